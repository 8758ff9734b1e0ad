//! Fixed-rate sensor sampling task.
//!
//! Polls the pressure and flow transducers at a fixed rate (default 100 Hz)
//! and publishes timestamped samples on broadcast channels. The broadcast
//! buffer is bounded; a consumer that falls behind loses the *oldest*
//! entries, never the newest. Freshness matters more than completeness for
//! control decisions.
//!
//! A transducer read failure is fatal to the sampling loop and propagates as
//! [`VentError::Sensor`]: the control loop depends on fresh data and detects
//! the resulting staleness, so the failure must be loud, never a silent zero.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::core::Sample;
use crate::error::{VentError, VentResult};
use crate::hardware::{FlowSensor, PressureSensor};

/// Default broadcast buffer capacity per stream.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Handles for subscribing to the raw sample streams.
#[derive(Clone)]
pub struct SensorStreams {
    /// Raw pressure samples, cmH₂O, uncorrected.
    pub pressure: broadcast::Sender<Sample>,
    /// Raw flow samples, L/min, uncorrected.
    pub flow: broadcast::Sender<Sample>,
}

impl SensorStreams {
    /// Create a fresh pair of bounded streams.
    pub fn new(capacity: usize) -> Self {
        let (pressure, _) = broadcast::channel(capacity);
        let (flow, _) = broadcast::channel(capacity);
        Self { pressure, flow }
    }
}

/// Polls the transducers at a fixed rate and feeds the sample streams.
pub struct SensorSampler {
    pressure: Arc<dyn PressureSensor>,
    flow: Arc<dyn FlowSensor>,
    streams: SensorStreams,
    epoch: Instant,
    period: Duration,
}

impl SensorSampler {
    /// Create a sampler polling at `rate_hz`, stamping samples relative to
    /// `epoch`.
    pub fn new(
        pressure: Arc<dyn PressureSensor>,
        flow: Arc<dyn FlowSensor>,
        rate_hz: f64,
        epoch: Instant,
    ) -> Self {
        Self {
            pressure,
            flow,
            streams: SensorStreams::new(DEFAULT_STREAM_CAPACITY),
            epoch,
            period: Duration::from_secs_f64(1.0 / rate_hz),
        }
    }

    /// Subscription handles for the streams this sampler feeds.
    pub fn streams(&self) -> SensorStreams {
        self.streams.clone()
    }

    /// Take one pressure/flow reading pair and publish it.
    ///
    /// Exposed separately from [`run`](Self::run) so tests can drive the
    /// sampler tick by tick.
    pub async fn sample_once(&self) -> VentResult<()> {
        let t = self.epoch.elapsed().as_secs_f64();

        let pressure = self.pressure.read_pressure().await.map_err(|e| {
            error!(error = %e, "pressure transducer read failed");
            VentError::Sensor(e.to_string())
        })?;
        let flow = self.flow.read_flow().await.map_err(|e| {
            error!(error = %e, "flow transducer read failed");
            VentError::Sensor(e.to_string())
        })?;

        // No receivers yet is fine; the stream simply has no audience.
        let _ = self.streams.pressure.send(Sample::new(t, pressure));
        let _ = self.streams.flow.send(Sample::new(t, flow));
        Ok(())
    }

    /// Run the fixed-rate sampling loop until a driver error stops it.
    ///
    /// If an acquisition overruns the tick budget the next tick is skipped
    /// rather than bursting to catch up: the loop is fixed-rate, not
    /// best-effort.
    pub async fn run(self) -> VentResult<()> {
        debug!(period_ms = self.period.as_millis() as u64, "sensor sampler started");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.sample_once().await?;
        }
    }
}
