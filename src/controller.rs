//! The breathing cycle state machine.
//!
//! [`CycleController`] runs a fixed-period tick loop (default 50 ms). Every
//! tick it reads the latest conditioned signal, the active mode, and the
//! current settings, then advances one state machine that covers both startup
//! and cycling:
//!
//! ```text
//! AwaitingSensors → Homing → Parking → InitialTare → Idle
//!                                                      │ (breathing mode set)
//!                          Wait → Inhale → [InhalePause] → Exhale → Wait …
//! ```
//!
//! Decisions are made strictly on tick boundaries from latest-value-wins
//! inputs; the controller never replays history and never blocks inside a
//! tick. Emergency mode preempts every state including startup. Condition
//! checks that end an inhale (pressure ceiling, volume target, endstop) are
//! state transitions, not errors; only startup deadline exhaustion is
//! reported as a failure, and then the machine parks in `StartupFailed`
//! until an external retry request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::conditioner::ConditionerCommand;
use crate::config::ControlSettings;
use crate::core::{Conditioned, ControlEvent, CycleStats, VentilationMode};
use crate::error::{VentError, VentResult};
use crate::piston::PistonDriver;

/// Recommended capacity for the shared event channel toward the UI.
pub const EVENT_CAPACITY: usize = 32;

/// One-shot request flags the UI sets and the controller consumes.
///
/// Each flag is consumed exactly once. A tare request made while a breathing
/// mode is active is rejected and cleared, never deferred; tare is only
/// honored in `Stop` mode.
#[derive(Debug, Default)]
pub struct ControlRequests {
    tare: AtomicBool,
    pause: AtomicBool,
    retry: AtomicBool,
}

impl ControlRequests {
    /// Request a tare recomputation at the next opportunity.
    pub fn request_tare(&self) {
        self.tare.store(true, Ordering::Relaxed);
    }

    /// Request an inhale-hold pause at the end of the next inhale.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    /// Request a startup retry after a startup failure.
    pub fn request_retry(&self) {
        self.retry.store(true, Ordering::Relaxed);
    }

    fn take_tare(&self) -> bool {
        self.tare.swap(false, Ordering::Relaxed)
    }

    fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::Relaxed)
    }

    fn take_retry(&self) -> bool {
        self.retry.swap(false, Ordering::Relaxed)
    }
}

/// UI-side handle to a running [`CycleController`].
pub struct ControllerLink {
    mode: watch::Sender<VentilationMode>,
    requests: Arc<ControlRequests>,
    events: broadcast::Sender<ControlEvent>,
    stats: watch::Receiver<CycleStats>,
}

impl ControllerLink {
    /// Set the active ventilation mode; takes effect on the next tick.
    pub fn set_mode(&self, mode: VentilationMode) {
        self.mode.send_replace(mode);
    }

    /// The one-shot request flags.
    pub fn requests(&self) -> &ControlRequests {
        &self.requests
    }

    /// Subscribe to controller events (startup, tare, cycle completion).
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Latest-value-wins cycle statistics.
    pub fn stats(&self) -> watch::Receiver<CycleStats> {
        self.stats.clone()
    }
}

/// Where the state machine currently is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlState {
    /// Waiting for the first valid conditioned signal, with a fatal deadline.
    AwaitingSensors {
        /// When waiting becomes a startup failure.
        deadline: Instant,
    },
    /// Alternately driving toward each end until an endstop fires.
    Homing {
        /// When the current drive direction is abandoned and reversed.
        flip_at: Instant,
        /// Whether the current hold drives upward.
        upward: bool,
        /// Direction-hold attempts made so far, including the current one.
        attempts: u32,
    },
    /// Driving up to the rest position after homing found a reference.
    Parking,
    /// Quiescent settling window before the startup tare is taken.
    InitialTare {
        /// When the settling window ends and the tare command is issued.
        until: Instant,
    },
    /// Startup gave up; parked with the piston stopped until a retry request.
    StartupFailed,
    /// Started up, no breathing mode active.
    Idle,
    /// Breathing mode active, waiting for the next breath to begin.
    Wait,
    /// Driving down, delivering a breath.
    Inhale,
    /// Holding at end of inhale for a requested plateau.
    InhalePause {
        /// When the hold ends and exhale begins.
        until: Instant,
    },
    /// Driving up, releasing the bag.
    Exhale,
    /// Emergency retraction engaged; holds until the mode changes.
    Emergency,
}

/// The tick-driven cycle state machine.
pub struct CycleController {
    driver: PistonDriver,
    signal_rx: watch::Receiver<Option<Conditioned>>,
    conditioner_tx: mpsc::Sender<ConditionerCommand>,
    settings_rx: watch::Receiver<ControlSettings>,
    mode_rx: watch::Receiver<VentilationMode>,
    requests: Arc<ControlRequests>,
    events: broadcast::Sender<ControlEvent>,
    stats_tx: watch::Sender<CycleStats>,

    state: ControlState,
    started_up: bool,
    /// Mode as of the previous tick, for detecting changes mid-cycle.
    active_mode: VentilationMode,

    inhale_started: Option<Instant>,
    exhale_started: Option<Instant>,
    /// Integrator reading when the current inhale began; delivered volume is
    /// measured as a delta from this, so a lost volume reset cannot carry
    /// the previous breath's integral into the new one. Follows the
    /// integrator down when the reset does land.
    inhale_volume_baseline: f64,
    last_inhale_duration: f64,
    last_exhale_duration: f64,
    /// Peaks of the cycle currently in progress.
    running_peak_pressure: f64,
    running_tidal_volume: f64,
    /// Peaks of the most recently completed cycle, reported in stats.
    completed_peak_pressure: f64,
    completed_tidal_volume: f64,
}

impl CycleController {
    /// Create a controller and the UI-side link to it.
    ///
    /// `events` is shared with the conditioner so the UI subscribes to one
    /// channel for startup, tare, and cycle events. The machine starts in
    /// `AwaitingSensors` with the deadline taken from the current settings.
    pub fn new(
        driver: PistonDriver,
        signal_rx: watch::Receiver<Option<Conditioned>>,
        conditioner_tx: mpsc::Sender<ConditionerCommand>,
        settings_rx: watch::Receiver<ControlSettings>,
        events: broadcast::Sender<ControlEvent>,
    ) -> (Self, ControllerLink) {
        let (mode_tx, mode_rx) = watch::channel(VentilationMode::Stop);
        let (stats_tx, stats_rx) = watch::channel(CycleStats::default());
        let requests = Arc::new(ControlRequests::default());

        let deadline = Instant::now()
            + Duration::from_secs_f64(settings_rx.borrow().timing.first_sample_timeout_s);

        let controller = Self {
            driver,
            signal_rx,
            conditioner_tx,
            settings_rx,
            mode_rx,
            requests: Arc::clone(&requests),
            events: events.clone(),
            stats_tx,
            state: ControlState::AwaitingSensors { deadline },
            started_up: false,
            active_mode: VentilationMode::Stop,
            inhale_started: None,
            exhale_started: None,
            inhale_volume_baseline: 0.0,
            last_inhale_duration: 0.0,
            last_exhale_duration: 0.0,
            running_peak_pressure: 0.0,
            running_tidal_volume: 0.0,
            completed_peak_pressure: 0.0,
            completed_tidal_volume: 0.0,
        };
        let link = ControllerLink {
            mode: mode_tx,
            requests,
            events,
            stats: stats_rx,
        };
        (controller, link)
    }

    /// Current state, for inspection.
    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Whether startup (homing plus initial tare) has completed.
    pub fn is_started_up(&self) -> bool {
        self.started_up
    }

    /// Advance the state machine by one tick at time `now`.
    pub fn tick(&mut self, now: Instant) -> VentResult<()> {
        let mode = *self.mode_rx.borrow_and_update();
        let settings = self.settings_rx.borrow_and_update().clone();
        let signal = *self.signal_rx.borrow_and_update();

        // Emergency preempts every state, startup included.
        if mode == VentilationMode::Emergency {
            if self.state != ControlState::Emergency {
                warn!("emergency retraction engaged");
                self.driver.emergency_retract()?;
                self.state = ControlState::Emergency;
            } else {
                self.driver.drive_up()?;
            }
            self.active_mode = mode;
            self.push_stats();
            return Ok(());
        }
        if self.state == ControlState::Emergency {
            info!("emergency released");
            self.driver.stop()?;
            self.state = if self.started_up {
                ControlState::Idle
            } else {
                // Position and tare are unknown again after a forced
                // retraction mid-startup.
                ControlState::AwaitingSensors {
                    deadline: now
                        + Duration::from_secs_f64(settings.timing.first_sample_timeout_s),
                }
            };
        }

        match self.state {
            ControlState::AwaitingSensors { deadline } => {
                if signal.is_some() {
                    info!("first conditioned signal received, homing");
                    self.driver.drive_up()?;
                    self.state = ControlState::Homing {
                        flip_at: now
                            + Duration::from_secs_f64(settings.homing.direction_timeout_s),
                        upward: true,
                        attempts: 1,
                    };
                } else if now >= deadline {
                    let err = VentError::SensorTimeout {
                        timeout_s: settings.timing.first_sample_timeout_s,
                    };
                    self.fail_startup(err.to_string())?;
                }
            }
            ControlState::Homing {
                flip_at,
                upward,
                attempts,
            } => {
                if self.driver.at_top() || self.driver.at_bottom() {
                    debug!(attempts, "endstop found, parking");
                    self.state = ControlState::Parking;
                } else if now >= flip_at {
                    let next = attempts + 1;
                    if next > settings.homing.max_attempts {
                        let err = VentError::StartupTimeout { attempts };
                        self.fail_startup(err.to_string())?;
                    } else {
                        if upward {
                            self.driver.drive_down()?;
                        } else {
                            self.driver.drive_up()?;
                        }
                        self.state = ControlState::Homing {
                            flip_at: now
                                + Duration::from_secs_f64(settings.homing.direction_timeout_s),
                            upward: !upward,
                            attempts: next,
                        };
                    }
                }
            }
            ControlState::Parking => {
                if self.driver.at_top() {
                    self.driver.stop()?;
                    self.state = ControlState::InitialTare {
                        until: now + Duration::from_secs_f64(settings.tare.window_s),
                    };
                } else {
                    self.driver.drive_up()?;
                }
            }
            ControlState::InitialTare { until } => {
                if now >= until {
                    self.send_conditioner(ConditionerCommand::Tare {
                        window_s: settings.tare.window_s,
                    });
                    self.started_up = true;
                    info!("startup complete");
                    let _ = self.events.send(ControlEvent::StartupComplete);
                    self.state = ControlState::Idle;
                }
            }
            ControlState::StartupFailed => {
                self.driver.stop()?;
                if self.requests.take_retry() {
                    info!("startup retry requested");
                    self.state = ControlState::AwaitingSensors {
                        deadline: now
                            + Duration::from_secs_f64(settings.timing.first_sample_timeout_s),
                    };
                }
            }
            ControlState::Idle
            | ControlState::Wait
            | ControlState::Inhale
            | ControlState::InhalePause { .. }
            | ControlState::Exhale => {
                self.tick_cycling(now, mode, &settings, signal)?;
            }
            ControlState::Emergency => {}
        }

        self.active_mode = mode;
        self.push_stats();
        Ok(())
    }

    /// One tick of the post-startup states.
    fn tick_cycling(
        &mut self,
        now: Instant,
        mode: VentilationMode,
        settings: &ControlSettings,
        signal: Option<Conditioned>,
    ) -> VentResult<()> {
        if !mode.is_breathing() {
            // Stop mode: piston halted. The only place tare is honored.
            self.driver.stop()?;
            self.state = ControlState::Idle;
            if self.requests.take_tare() {
                self.send_conditioner(ConditionerCommand::Tare {
                    window_s: settings.tare.window_s,
                });
            }
            return Ok(());
        }

        // Breathing while re-zeroing would corrupt the zero reference, so a
        // tare request in an active mode is rejected outright, not deferred.
        if self.requests.take_tare() {
            warn!("tare request rejected while a breathing mode is active");
        }

        // A mode change mid-cycle abandons the breath in progress.
        if mode != self.active_mode && self.state != ControlState::Idle {
            debug!(?mode, "mode changed, returning to wait");
            self.driver.stop()?;
            self.state = ControlState::Wait;
        }
        if self.state == ControlState::Idle {
            self.state = ControlState::Wait;
        }

        // No conditioned data yet this breath: hold the current command and
        // make no decisions.
        let Some(signal) = signal else {
            return Ok(());
        };

        if matches!(
            self.state,
            ControlState::Inhale | ControlState::InhalePause { .. } | ControlState::Exhale
        ) {
            self.inhale_volume_baseline = self.inhale_volume_baseline.min(signal.volume_ml);
            self.running_peak_pressure = self.running_peak_pressure.max(signal.pressure);
            self.running_tidal_volume =
                self.running_tidal_volume.max(self.delivered_volume(&signal));
        }

        match self.state {
            ControlState::Wait => {
                if self.should_start_inhale(now, mode, settings, &signal) {
                    self.start_inhale(now, &signal)?;
                }
            }
            ControlState::Inhale => {
                self.driver.drive_down()?;
                if self.inhale_done(now, mode, settings, &signal) {
                    self.end_inhale(now, mode, settings)?;
                }
            }
            ControlState::InhalePause { until } => {
                if now >= until {
                    self.begin_exhale(now)?;
                }
            }
            ControlState::Exhale => {
                self.driver.drive_up()?;
                if self.exhale_done(now, mode, settings) {
                    self.complete_cycle(now)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn should_start_inhale(
        &self,
        now: Instant,
        mode: VentilationMode,
        settings: &ControlSettings,
        signal: &Conditioned,
    ) -> bool {
        match mode {
            VentilationMode::VolumeControlled => {
                self.period_elapsed(now, settings.vcv.period_s())
                    && signal.volume_ml < settings.vcv.tidal_volume_ml
                    && signal.pressure < settings.vcv.max_pressure_cmh2o
            }
            VentilationMode::PressureControlled => {
                self.period_elapsed(now, settings.pcv.period_s())
                    && signal.pressure < settings.pcv.target_pressure_cmh2o
            }
            VentilationMode::SupportTriggered => {
                // Patient effort shows as pressure pulled below baseline.
                signal.pressure <= -settings.psv.trigger_sensitivity_cmh2o
            }
            _ => false,
        }
    }

    /// Whether a full breath period has passed since the last inhale began.
    /// The first breath of a session is always allowed.
    fn period_elapsed(&self, now: Instant, period_s: f64) -> bool {
        match self.inhale_started {
            None => true,
            Some(started) => (now - started).as_secs_f64() >= period_s,
        }
    }

    fn inhale_done(
        &self,
        now: Instant,
        mode: VentilationMode,
        settings: &ControlSettings,
        signal: &Conditioned,
    ) -> bool {
        if self.driver.at_bottom() {
            return true;
        }
        let elapsed = self
            .inhale_started
            .map(|s| (now - s).as_secs_f64())
            .unwrap_or(0.0);
        match mode {
            VentilationMode::VolumeControlled => {
                signal.pressure >= settings.vcv.max_pressure_cmh2o
                    || self.delivered_volume(signal) >= 0.9 * settings.vcv.tidal_volume_ml
                    || elapsed >= settings.vcv.period_s() / 2.0
            }
            VentilationMode::PressureControlled => {
                signal.pressure >= settings.pcv.target_pressure_cmh2o
                    || self.delivered_volume(signal) >= settings.pcv.max_volume_ml
                    || elapsed >= settings.pcv.inhale_time_s
            }
            VentilationMode::SupportTriggered => {
                signal.pressure >= settings.psv.support_pressure_cmh2o
            }
            _ => true,
        }
    }

    fn exhale_done(&self, now: Instant, mode: VentilationMode, settings: &ControlSettings) -> bool {
        if !self.driver.at_top() {
            return false;
        }
        match mode {
            // Timed modes hold the cycle open until the full period has run.
            VentilationMode::VolumeControlled => {
                self.period_elapsed(now, settings.vcv.period_s())
            }
            VentilationMode::PressureControlled => {
                self.period_elapsed(now, settings.pcv.period_s())
            }
            _ => true,
        }
    }

    /// Volume delivered since the current inhale began, mL.
    fn delivered_volume(&self, signal: &Conditioned) -> f64 {
        signal.volume_ml - self.inhale_volume_baseline
    }

    fn start_inhale(&mut self, now: Instant, signal: &Conditioned) -> VentResult<()> {
        self.running_peak_pressure = 0.0;
        self.running_tidal_volume = 0.0;
        self.inhale_volume_baseline = signal.volume_ml;
        self.send_conditioner(ConditionerCommand::ResetVolume);
        self.driver.drive_down()?;
        self.inhale_started = Some(now);
        self.state = ControlState::Inhale;
        debug!("inhale started");
        Ok(())
    }

    fn end_inhale(
        &mut self,
        now: Instant,
        mode: VentilationMode,
        settings: &ControlSettings,
    ) -> VentResult<()> {
        if let Some(started) = self.inhale_started {
            self.last_inhale_duration = (now - started).as_secs_f64();
        }
        // PSV breaths are patient-paced; a plateau hold makes no sense there.
        let pause_s = match mode {
            VentilationMode::VolumeControlled => Some(settings.vcv.inhale_pause_s),
            VentilationMode::PressureControlled => Some(settings.pcv.inhale_pause_s),
            _ => None,
        };
        match pause_s {
            Some(pause_s) if self.requests.take_pause() => {
                // Settings arrive over the watch channel and may not have
                // passed validate(); a negative duration must not panic the
                // tick loop.
                let pause_s = pause_s.max(0.0);
                self.driver.stop()?;
                self.state = ControlState::InhalePause {
                    until: now + Duration::from_secs_f64(pause_s),
                };
                debug!(pause_s, "inhale hold");
                Ok(())
            }
            _ => self.begin_exhale(now),
        }
    }

    fn begin_exhale(&mut self, now: Instant) -> VentResult<()> {
        self.driver.drive_up()?;
        self.exhale_started = Some(now);
        self.state = ControlState::Exhale;
        debug!("exhale started");
        Ok(())
    }

    fn complete_cycle(&mut self, now: Instant) -> VentResult<()> {
        if let Some(started) = self.exhale_started {
            self.last_exhale_duration = (now - started).as_secs_f64();
        }
        self.completed_peak_pressure = self.running_peak_pressure;
        self.completed_tidal_volume = self.running_tidal_volume;
        self.driver.stop()?;
        self.state = ControlState::Wait;
        let stats = self.current_stats();
        info!(
            inhale_s = stats.inhale_duration,
            exhale_s = stats.exhale_duration,
            peak_cmh2o = stats.peak_pressure,
            tidal_ml = stats.tidal_volume_ml,
            "cycle complete"
        );
        let _ = self.events.send(ControlEvent::CycleComplete { stats });
        Ok(())
    }

    fn fail_startup(&mut self, reason: String) -> VentResult<()> {
        warn!(%reason, "startup failed");
        self.driver.stop()?;
        let _ = self.events.send(ControlEvent::StartupError { reason });
        self.state = ControlState::StartupFailed;
        Ok(())
    }

    /// Non-blocking send toward the conditioner; a full queue drops the
    /// command with a warning rather than stalling the tick.
    fn send_conditioner(&self, command: ConditionerCommand) {
        if let Err(e) = self.conditioner_tx.try_send(command) {
            warn!(error = %e, "conditioner command dropped");
        }
    }

    fn current_stats(&self) -> CycleStats {
        let ie_ratio = if self.last_inhale_duration > 0.0 && self.last_exhale_duration > 0.0 {
            self.last_exhale_duration / self.last_inhale_duration
        } else {
            1.0
        };
        CycleStats {
            inhale_duration: self.last_inhale_duration,
            exhale_duration: self.last_exhale_duration,
            ie_ratio,
            peak_pressure: self.completed_peak_pressure,
            tidal_volume_ml: self.completed_tidal_volume,
            started_up: self.started_up,
        }
    }

    fn push_stats(&self) {
        self.stats_tx.send_replace(self.current_stats());
    }

    /// Run the tick loop forever at the configured period.
    pub async fn run(mut self) -> VentResult<()> {
        let tick_ms = self.settings_rx.borrow().timing.tick_ms;
        info!(tick_ms, "cycle controller started");
        let mut ticker = interval(Duration::from_millis(tick_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let now = ticker.tick().await;
            self.tick(now)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPiston;
    use crate::hardware::{Endstop, EndstopState};

    struct Harness {
        controller: CycleController,
        link: ControllerLink,
        piston: MockPiston,
        endstops: Arc<EndstopState>,
        signal_tx: watch::Sender<Option<Conditioned>>,
        cmd_rx: mpsc::Receiver<ConditionerCommand>,
        #[allow(dead_code)]
        settings_tx: watch::Sender<ControlSettings>,
    }

    fn harness(settings: ControlSettings) -> Harness {
        let piston = MockPiston::new();
        let endstops = Arc::new(EndstopState::new());
        let driver = PistonDriver::new(Box::new(piston.clone()), Arc::clone(&endstops));
        let (signal_tx, signal_rx) = watch::channel(None);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (controller, link) =
            CycleController::new(driver, signal_rx, cmd_tx, settings_rx, events);
        Harness {
            controller,
            link,
            piston,
            endstops,
            signal_tx,
            cmd_rx,
            settings_tx,
        }
    }

    fn quiet_signal() -> Conditioned {
        Conditioned {
            t: 0.0,
            pressure: 0.0,
            flow: 0.0,
            volume_ml: 0.0,
        }
    }

    async fn advance(s: f64) {
        tokio::time::advance(Duration::from_secs_f64(s)).await;
    }

    /// Drive the harness through homing and the initial tare to `Idle`.
    async fn start_up(h: &mut Harness) {
        h.signal_tx.send_replace(Some(quiet_signal()));
        h.controller.tick(Instant::now()).unwrap();
        assert!(matches!(h.controller.state(), ControlState::Homing { .. }));

        h.endstops.on_endstop(Endstop::Top);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Parking);
        h.controller.tick(Instant::now()).unwrap();
        assert!(matches!(h.controller.state(), ControlState::InitialTare { .. }));

        advance(h.settings_tx.borrow().tare.window_s + 0.1).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Idle);
        assert!(h.controller.is_started_up());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_homes_tares_and_reports_completion() {
        let mut h = harness(ControlSettings::default());
        let mut events = h.link.subscribe_events();

        start_up(&mut h).await;

        assert!(matches!(
            h.cmd_rx.try_recv().unwrap(),
            ConditionerCommand::Tare { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ControlEvent::StartupComplete
        ));
        assert!(h.link.stats().borrow().started_up);
    }

    #[tokio::test(start_paused = true)]
    async fn homing_gives_up_after_attempt_budget() {
        let mut settings = ControlSettings::default();
        settings.homing.max_attempts = 2;
        settings.homing.direction_timeout_s = 0.5;
        let mut h = harness(settings);
        let mut events = h.link.subscribe_events();

        h.signal_tx.send_replace(Some(quiet_signal()));
        h.controller.tick(Instant::now()).unwrap();

        // Two direction holds expire without any endstop firing.
        for _ in 0..2 {
            advance(0.6).await;
            h.controller.tick(Instant::now()).unwrap();
        }
        assert_eq!(h.controller.state(), ControlState::StartupFailed);
        assert!(matches!(
            events.recv().await.unwrap(),
            ControlEvent::StartupError { .. }
        ));
        // The piston is left stopped.
        assert_eq!(h.piston.last_command(), Some(crate::core::PistonCommand::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sensor_data_fails_startup_and_retry_restarts() {
        let mut h = harness(ControlSettings::default());
        let mut events = h.link.subscribe_events();

        advance(6.0).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::StartupFailed);
        assert!(matches!(
            events.recv().await.unwrap(),
            ControlEvent::StartupError { .. }
        ));

        h.link.requests().request_retry();
        h.controller.tick(Instant::now()).unwrap();
        assert!(matches!(
            h.controller.state(),
            ControlState::AwaitingSensors { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn vcv_cycle_runs_to_completion() {
        let mut h = harness(ControlSettings::default());
        let mut events = h.link.subscribe_events();
        start_up(&mut h).await;
        let _ = events.recv().await; // StartupComplete

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);
        assert!(matches!(
            h.cmd_rx.try_recv().unwrap(),
            ConditionerCommand::ResetVolume
        ));
        assert_eq!(h.piston.last_command(), Some(crate::core::PistonCommand::Down));

        // Volume reaches 90 % of the 300 mL target.
        advance(1.0).await;
        h.signal_tx.send_replace(Some(Conditioned {
            t: 1.0,
            pressure: 15.0,
            flow: 20.0,
            volume_ml: 280.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
        assert_eq!(h.piston.last_command(), Some(crate::core::PistonCommand::Up));

        // Back at the top, but the 5 s period has not elapsed yet.
        h.endstops.on_endstop(Endstop::Top);
        advance(1.0).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);

        advance(3.5).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Wait);

        match events.recv().await.unwrap() {
            ControlEvent::CycleComplete { stats } => {
                assert!((stats.inhale_duration - 1.0).abs() < 0.05);
                assert!(stats.exhale_duration > 4.0);
                assert!(stats.ie_ratio > 1.0);
                assert_eq!(stats.peak_pressure, 15.0);
                assert_eq!(stats.tidal_volume_ml, 280.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn vcv_inhale_aborts_at_pressure_ceiling() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.2,
            pressure: 45.0, // above the 40 cmH₂O ceiling
            flow: 10.0,
            volume_ml: 50.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_request_inserts_inhale_hold() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        h.link.requests().request_pause();

        h.endstops.on_endstop(Endstop::Bottom);
        h.controller.tick(Instant::now()).unwrap();
        assert!(matches!(
            h.controller.state(),
            ControlState::InhalePause { .. }
        ));
        assert_eq!(h.piston.last_command(), Some(crate::core::PistonCommand::Idle));

        // The 1 s default hold expires, then exhale begins.
        advance(1.1).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
    }

    #[tokio::test(start_paused = true)]
    async fn psv_breath_is_effort_triggered() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::SupportTriggered);
        h.controller.tick(Instant::now()).unwrap();
        // Quiet airway: no breath starts on its own.
        assert_eq!(h.controller.state(), ControlState::Wait);

        // Patient effort pulls pressure below the 2 cmH₂O sensitivity.
        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.1,
            pressure: -3.0,
            flow: -5.0,
            volume_ml: 0.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        // Support pressure reached ends the inhale.
        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.8,
            pressure: 21.0,
            flow: 15.0,
            volume_ml: 200.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);

        h.endstops.on_endstop(Endstop::Top);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Wait);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_preempts_and_releases_to_idle() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        h.link.set_mode(VentilationMode::Emergency);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Emergency);
        assert_eq!(h.piston.last_command(), Some(crate::core::PistonCommand::Up));

        h.link.set_mode(VentilationMode::Stop);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Idle);
        assert_eq!(h.piston.last_command(), Some(crate::core::PistonCommand::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn tare_request_while_cycling_is_rejected_and_cleared() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;
        let _ = h.cmd_rx.try_recv(); // startup tare

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        h.link.requests().request_tare();
        h.controller.tick(Instant::now()).unwrap();
        // Cycling: the request is discarded, nothing sent except the
        // inhale's volume reset.
        loop {
            match h.cmd_rx.try_recv() {
                Ok(ConditionerCommand::ResetVolume) => continue,
                Ok(other) => panic!("unexpected command {other:?}"),
                Err(_) => break,
            }
        }

        // The rejected request does not fire later in Stop mode either.
        h.link.set_mode(VentilationMode::Stop);
        h.controller.tick(Instant::now()).unwrap();
        assert!(h.cmd_rx.try_recv().is_err());

        // A fresh request in Stop mode is honored.
        h.link.requests().request_tare();
        h.controller.tick(Instant::now()).unwrap();
        assert!(matches!(
            h.cmd_rx.try_recv().unwrap(),
            ConditionerCommand::Tare { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn vcv_inhale_has_a_hard_timeout_at_half_period() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        // The signal never crosses any limit: no volume, no pressure, no
        // bottom endstop. Half the 5 s period still ends the inhale.
        advance(2.0).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        advance(0.6).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
    }

    #[tokio::test(start_paused = true)]
    async fn mode_change_mid_breath_returns_to_wait() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        h.link.set_mode(VentilationMode::PressureControlled);
        h.controller.tick(Instant::now()).unwrap();
        // The VCV breath was abandoned; PCV has not started one yet because
        // the period since the abandoned inhale has not elapsed.
        assert_eq!(h.controller.state(), ControlState::Wait);
    }

    #[tokio::test(start_paused = true)]
    async fn pcv_cycle_succeeds_on_target_pressure() {
        let mut h = harness(ControlSettings::default());
        let mut events = h.link.subscribe_events();
        start_up(&mut h).await;
        let _ = events.recv().await; // StartupComplete

        h.link.set_mode(VentilationMode::PressureControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);
        assert_eq!(h.piston.last_command(), Some(crate::core::PistonCommand::Down));

        // Airway pressure crosses the 20 cmH₂O target well before the 2 s
        // inhale ceiling or the 600 mL volume ceiling.
        advance(0.8).await;
        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.8,
            pressure: 20.5,
            flow: 25.0,
            volume_ml: 350.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);

        h.endstops.on_endstop(Endstop::Top);
        advance(4.5).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Wait);

        match events.recv().await.unwrap() {
            ControlEvent::CycleComplete { stats } => {
                assert!((stats.inhale_duration - 0.8).abs() < 0.05);
                assert_eq!(stats.peak_pressure, 20.5);
                assert_eq!(stats.tidal_volume_ml, 350.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pcv_inhale_aborts_at_volume_ceiling() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::PressureControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        // Pressure stays below the 20 cmH₂O target but the integrated
        // volume crosses the 600 mL safety ceiling.
        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.3,
            pressure: 8.0,
            flow: 40.0,
            volume_ml: 620.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
    }

    #[tokio::test(start_paused = true)]
    async fn pcv_inhale_times_out_at_inhale_time_ceiling() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::PressureControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        // The quiet signal never crosses pressure or volume; the 2 s
        // inhale-time ceiling ends the breath on its own.
        advance(1.5).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        advance(0.6).await;
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_pause_setting_does_not_panic_the_tick_loop() {
        let mut settings = ControlSettings::default();
        settings.vcv.inhale_pause_s = -1.0;
        let mut h = harness(settings);
        start_up(&mut h).await;

        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        h.link.requests().request_pause();

        h.endstops.on_endstop(Endstop::Bottom);
        h.controller.tick(Instant::now()).unwrap();
        assert!(matches!(
            h.controller.state(),
            ControlState::InhalePause { .. }
        ));

        // The clamped hold has already expired; exhale begins immediately.
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_volume_integral_does_not_end_the_next_inhale() {
        let mut h = harness(ControlSettings::default());
        start_up(&mut h).await;

        // The previous breath's 280 mL integral is still in the signal, as
        // if the volume reset command had been lost.
        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.0,
            pressure: 0.0,
            flow: 0.0,
            volume_ml: 280.0,
        }));
        h.link.set_mode(VentilationMode::VolumeControlled);
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        // 300 mL absolute is only 20 mL delivered this breath; the 90 %
        // volume check must not fire on the stale total.
        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.2,
            pressure: 10.0,
            flow: 30.0,
            volume_ml: 300.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Inhale);

        // 555 mL absolute is 275 mL delivered, past 90 % of the target.
        h.signal_tx.send_replace(Some(Conditioned {
            t: 0.4,
            pressure: 14.0,
            flow: 30.0,
            volume_ml: 555.0,
        }));
        h.controller.tick(Instant::now()).unwrap();
        assert_eq!(h.controller.state(), ControlState::Exhale);
    }
}
