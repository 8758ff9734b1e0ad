//! Signal conditioning: tare correction and volume integration.
//!
//! The conditioner sits between the raw sample streams and the cycle
//! controller. It subtracts the active tare offsets from every pressure and
//! flow sample, integrates flow into delivered volume (trapezoid rule), and
//! publishes the latest conditioned triple on a latest-value-wins channel.
//! The controller never replays history; it only ever acts on the newest
//! value, so a `watch` channel is the right transport.
//!
//! Raw (uncorrected) samples are also retained in bounded history buffers.
//! Those exist for exactly two consumers: the tare computation, which
//! averages a quiet window of raw readings into new offsets, and noise
//! diagnostics.

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::core::{Conditioned, ControlEvent, Sample, TareState};
use crate::error::{VentError, VentResult};
use crate::history::HistoryBuffer;
use crate::sampler::SensorStreams;

/// Raw-sample history depth: 50 s at the default 100 Hz sampling rate.
const HISTORY_CAPACITY: usize = 5000;

/// Commands the controller sends to the conditioner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConditionerCommand {
    /// Zero the volume integrator. Issued at the start of every inhale.
    ResetVolume,
    /// Recompute tare offsets from the trailing `window_s` seconds of raw
    /// samples. Only meaningful while the system is quiescent.
    Tare {
        /// Length of the averaging window, seconds.
        window_s: f64,
    },
}

/// Tare-corrects and integrates the raw streams into [`Conditioned`] values.
pub struct SignalConditioner {
    pressure_rx: broadcast::Receiver<Sample>,
    flow_rx: broadcast::Receiver<Sample>,
    commands: mpsc::Receiver<ConditionerCommand>,
    output: watch::Sender<Option<Conditioned>>,
    events: broadcast::Sender<ControlEvent>,
    tare: TareState,
    raw_pressure: HistoryBuffer,
    raw_flow: HistoryBuffer,
    /// Last tare-corrected pressure sample.
    last_pressure: Option<Sample>,
    /// Last tare-corrected flow sample, the left edge of the next trapezoid.
    last_flow: Option<Sample>,
    volume_ml: f64,
}

impl SignalConditioner {
    /// Create a conditioner subscribed to the given streams.
    pub fn new(
        streams: &SensorStreams,
        commands: mpsc::Receiver<ConditionerCommand>,
        events: broadcast::Sender<ControlEvent>,
    ) -> Self {
        let (output, _) = watch::channel(None);
        Self {
            pressure_rx: streams.pressure.subscribe(),
            flow_rx: streams.flow.subscribe(),
            commands,
            output,
            events,
            tare: TareState::default(),
            raw_pressure: HistoryBuffer::new(HISTORY_CAPACITY),
            raw_flow: HistoryBuffer::new(HISTORY_CAPACITY),
            last_pressure: None,
            last_flow: None,
            volume_ml: 0.0,
        }
    }

    /// Subscribe to the conditioned output. Starts as `None` until the first
    /// pressure sample has been conditioned.
    pub fn subscribe(&self) -> watch::Receiver<Option<Conditioned>> {
        self.output.subscribe()
    }

    /// The currently active tare offsets.
    pub fn tare(&self) -> TareState {
        self.tare
    }

    /// Population variance of the raw pressure history, for noise diagnostics.
    pub fn pressure_noise(&self) -> Option<f64> {
        self.raw_pressure.variance()
    }

    /// Condition one raw pressure sample and republish.
    pub fn ingest_pressure(&mut self, raw: Sample) {
        self.raw_pressure.push(raw);
        self.last_pressure = Some(Sample::new(raw.t, raw.value - self.tare.pressure_offset));
        self.publish();
    }

    /// Condition one raw flow sample, advance the volume integral, republish.
    pub fn ingest_flow(&mut self, raw: Sample) {
        self.raw_flow.push(raw);
        let corrected = Sample::new(raw.t, raw.value - self.tare.flow_offset);
        if let Some(prev) = self.last_flow {
            let dt = corrected.t - prev.t;
            if dt > 0.0 {
                // L/min × s → mL: ÷60 to L/s, ×1000 to mL.
                self.volume_ml += (prev.value + corrected.value) / 2.0 * dt / 60.0 * 1000.0;
            }
        }
        self.last_flow = Some(corrected);
        self.publish();
    }

    /// Apply a controller command.
    pub fn apply_command(&mut self, command: ConditionerCommand) {
        match command {
            ConditionerCommand::ResetVolume => {
                debug!(discarded_ml = self.volume_ml, "volume integrator reset");
                self.volume_ml = 0.0;
                self.publish();
            }
            ConditionerCommand::Tare { window_s } => self.recompute_tare(window_s),
        }
    }

    /// Average the trailing window of *raw* samples into new tare offsets.
    ///
    /// A stream with no samples inside the window keeps its previous offset;
    /// an empty window is never a valid zero.
    fn recompute_tare(&mut self, window_s: f64) {
        let pressure_mean = self
            .raw_pressure
            .latest()
            .and_then(|s| self.raw_pressure.mean_since(s.t - window_s));
        let flow_mean = self
            .raw_flow
            .latest()
            .and_then(|s| self.raw_flow.mean_since(s.t - window_s));

        match pressure_mean {
            Some(mean) => self.tare.pressure_offset = mean,
            None => warn!("tare requested with no pressure samples in window"),
        }
        match flow_mean {
            Some(mean) => self.tare.flow_offset = mean,
            None => warn!("tare requested with no flow samples in window"),
        }
        self.tare.computed_at = chrono::Utc::now();

        info!(
            pressure_offset = self.tare.pressure_offset,
            flow_offset = self.tare.flow_offset,
            "tare offsets recomputed"
        );
        let _ = self.events.send(ControlEvent::TareComplete { tare: self.tare });
    }

    /// Publish the latest conditioned triple. Nothing is published until the
    /// first pressure sample arrives.
    fn publish(&mut self) {
        let Some(pressure) = self.last_pressure else {
            return;
        };
        let flow = self.last_flow.unwrap_or(Sample::new(pressure.t, 0.0));
        let conditioned = Conditioned {
            t: pressure.t.max(flow.t),
            pressure: pressure.value,
            flow: flow.value,
            volume_ml: self.volume_ml,
        };
        self.output.send_replace(Some(conditioned));
    }

    /// Run the conditioning loop until the command channel closes (graceful
    /// shutdown) or a sample stream drops (pipeline fault).
    pub async fn run(mut self) -> VentResult<()> {
        loop {
            tokio::select! {
                sample = self.pressure_rx.recv() => match sample {
                    Ok(s) => self.ingest_pressure(s),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "pressure stream lagged, oldest samples dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(VentError::ChannelClosed("pressure stream"));
                    }
                },
                sample = self.flow_rx.recv() => match sample {
                    Ok(s) => self.ingest_flow(s),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "flow stream lagged, oldest samples dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(VentError::ChannelClosed("flow stream"));
                    }
                },
                command = self.commands.recv() => match command {
                    Some(c) => self.apply_command(c),
                    None => {
                        debug!("command channel closed, conditioner stopping");
                        return Ok(());
                    }
                },
            }
        }
    }
}
