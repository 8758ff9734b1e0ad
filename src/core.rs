//! Fundamental types shared across the control pipeline.
//!
//! This module defines the data model every other component builds on:
//! timestamped samples, the ventilation mode enumeration, per-cycle
//! statistics, the event type the controller emits toward the UI, and the
//! raw/decoded user-input representations.
//!
//! All of these are plain data. The behavior lives in the pipeline modules
//! (`sampler`, `conditioner`, `controller`, `input`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamped sensor reading.
///
/// `t` is in seconds relative to the pipeline epoch (the instant the sampler
/// started); `value` is in the unit of the stream it travels on (cmH₂O for
/// pressure, L/min for flow, mL for derived volume). Samples are produced
/// once and never mutated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the pipeline epoch.
    pub t: f64,
    /// Measured value in the stream's unit.
    pub value: f64,
}

impl Sample {
    /// Create a sample at time `t` seconds with the given value.
    pub fn new(t: f64, value: f64) -> Self {
        Self { t, value }
    }
}

/// The active ventilation mode, set externally by the UI.
///
/// The controller reads this once at the top of every tick; a change takes
/// effect on the next tick boundary, never mid-motion-command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VentilationMode {
    /// Piston held stopped. The only mode in which tare is permitted.
    #[default]
    Stop,
    /// Volume-controlled ventilation (VCV): inhale succeeds on volume.
    VolumeControlled,
    /// Pressure-controlled ventilation (PCV): inhale succeeds on pressure.
    PressureControlled,
    /// Pressure-support ventilation (PSV): breaths triggered by patient effort.
    SupportTriggered,
    /// Fail-safe override: retract the piston and hold, regardless of state.
    Emergency,
}

impl VentilationMode {
    /// Whether this mode runs the automatic breathing cycle.
    pub fn is_breathing(self) -> bool {
        matches!(
            self,
            VentilationMode::VolumeControlled
                | VentilationMode::PressureControlled
                | VentilationMode::SupportTriggered
        )
    }
}

/// Direction currently commanded to the piston.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PistonCommand {
    /// Both solenoid outputs de-asserted.
    #[default]
    Idle,
    /// Piston extending: compressing the bag (inhale direction).
    Down,
    /// Piston retracting: releasing the bag (exhale direction).
    Up,
}

/// Latest conditioned signal values, published by the conditioner and
/// consumed latest-value-wins by the controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Conditioned {
    /// Seconds since the pipeline epoch of the newest contributing sample.
    pub t: f64,
    /// Tare-corrected airway pressure, cmH₂O.
    pub pressure: f64,
    /// Tare-corrected flow, L/min, signed (inhale positive).
    pub flow: f64,
    /// Integrated tidal volume since the start of the current inhale, mL.
    pub volume_ml: f64,
}

/// Zero-offset calibration subtracted from raw sensor readings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TareState {
    /// Offset subtracted from raw pressure, cmH₂O.
    pub pressure_offset: f64,
    /// Offset subtracted from raw flow, L/min.
    pub flow_offset: f64,
    /// When this tare was computed.
    pub computed_at: DateTime<Utc>,
}

impl Default for TareState {
    fn default() -> Self {
        Self {
            pressure_offset: 0.0,
            flow_offset: 0.0,
            computed_at: Utc::now(),
        }
    }
}

/// Per-cycle breathing statistics, recomputed every control tick.
///
/// Lives for the process lifetime: created zeroed at controller startup,
/// overwritten (never accumulated) each tick thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    /// Duration of the most recent complete inhale, seconds.
    pub inhale_duration: f64,
    /// Duration of the most recent complete exhale, seconds.
    pub exhale_duration: f64,
    /// Exhale/inhale ratio; 1.0 before the first complete cycle.
    pub ie_ratio: f64,
    /// Peak pressure over the most recent full cycle, cmH₂O.
    pub peak_pressure: f64,
    /// Volume delivered in the most recent full cycle, mL.
    pub tidal_volume_ml: f64,
    /// Whether startup (homing + initial tare) has completed.
    pub started_up: bool,
}

impl Default for CycleStats {
    fn default() -> Self {
        Self {
            inhale_duration: 0.0,
            exhale_duration: 0.0,
            ie_ratio: 1.0,
            peak_pressure: 0.0,
            tidal_volume_ml: 0.0,
            started_up: false,
        }
    }
}

/// Events the controller emits toward the UI layer.
#[derive(Clone, Debug)]
pub enum ControlEvent {
    /// Homing and the initial tare completed; cycling may begin.
    StartupComplete,
    /// Startup failed; the controller is awaiting an external retry request.
    StartupError {
        /// Human-readable description of what failed.
        reason: String,
    },
    /// A tare recomputation finished with the given offsets.
    TareComplete {
        /// The newly active tare state.
        tare: TareState,
    },
    /// A full breath cycle completed with these statistics.
    CycleComplete {
        /// Statistics for the completed cycle.
        stats: CycleStats,
    },
}

/// Which physical input line produced a hardware edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeLine {
    /// Rotary encoder clock line.
    Clk,
    /// Rotary encoder data line.
    Dt,
    /// OK push button.
    Ok,
    /// UP push button.
    Up,
    /// DOWN push button.
    Down,
    /// Rotary encoder integrated push button.
    Rot,
}

/// A debounced falling-edge event from the input hardware.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeEvent {
    /// Which line fired.
    pub line: EdgeLine,
    /// Seconds since the pipeline epoch when the edge fired.
    pub t: f64,
}

/// A discrete user action decoded from hardware edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAction {
    /// UP button pressed.
    Up,
    /// DOWN button pressed.
    Down,
    /// OK button pressed.
    Ok,
    /// Rotary encoder button pressed.
    Rotate,
    /// Encoder turned clockwise by one detent.
    Clockwise,
    /// Encoder turned counter-clockwise by one detent.
    CounterClockwise,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_stop() {
        assert_eq!(VentilationMode::default(), VentilationMode::Stop);
        assert!(!VentilationMode::Stop.is_breathing());
        assert!(VentilationMode::VolumeControlled.is_breathing());
        assert!(!VentilationMode::Emergency.is_breathing());
    }

    #[test]
    fn default_stats_are_zero_with_unit_ie_ratio() {
        let stats = CycleStats::default();
        assert_eq!(stats.inhale_duration, 0.0);
        assert_eq!(stats.ie_ratio, 1.0);
        assert!(!stats.started_up);
    }

    #[test]
    fn default_tare_is_zero_offset() {
        let tare = TareState::default();
        assert_eq!(tare.pressure_offset, 0.0);
        assert_eq!(tare.flow_offset, 0.0);
    }
}
