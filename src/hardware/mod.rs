//! Hardware capability traits and shared endstop state.
//!
//! Instead of one monolithic device trait, the core consumes fine-grained
//! capability traits: a driver implements exactly the concerns it supports:
//!
//! - [`PressureSensor`]: airway pressure transducer, cmH₂O
//! - [`FlowSensor`]: flow transducer, L/min, signed (inhale positive)
//! - [`analog::AnalogInput`]: raw ADC voltage, for the generic
//!   gauge/orifice sensor implementations
//! - [`PistonActuator`]: the two mutually-exclusive solenoid outputs
//!
//! # Design
//!
//! Sensor reads are async (each call may block briefly on hardware I/O) and
//! return `anyhow::Result`: a driver failure must be reported, never papered
//! over with a silently-wrong zero. Actuator commands are synchronous and
//! non-blocking by contract: they assert or de-assert outputs and return;
//! completion of the motion is observed through [`EndstopState`] on a later
//! control tick, never awaited.
//!
//! All traits require `Send + Sync`; drivers use interior mutability for
//! state so shared references can cross task boundaries.

pub mod analog;
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;

/// Capability: airway pressure readout.
#[async_trait]
pub trait PressureSensor: Send + Sync {
    /// Read the current airway pressure in cmH₂O, positive above atmospheric.
    ///
    /// May block briefly on hardware I/O. A hardware fault must surface as
    /// `Err`; the caller decides whether to hold the last-known value.
    async fn read_pressure(&self) -> Result<f64>;
}

/// Capability: airflow readout.
#[async_trait]
pub trait FlowSensor: Send + Sync {
    /// Read the current flow in L/min, signed: inhale positive.
    async fn read_flow(&self) -> Result<f64>;
}

/// Capability: directional piston drive.
///
/// # Contract
///
/// - Commands are non-blocking requests: they latch solenoid outputs and
///   return immediately.
/// - `drive_down` and `drive_up` are mutually exclusive; asserting one must
///   de-assert the other.
/// - `stop` de-asserts both outputs. It is idempotent and always safe.
/// - `emergency_retract` forces the up output for a driver-defined safety
///   duration regardless of endstop state. Used only in Emergency mode.
pub trait PistonActuator: Send + Sync {
    /// Drive the piston down (compress the bag, the inhale direction).
    fn drive_down(&self) -> Result<()>;

    /// Drive the piston up (release the bag, the exhale direction).
    fn drive_up(&self) -> Result<()>;

    /// De-assert both outputs.
    fn stop(&self) -> Result<()>;

    /// Force the up output regardless of endstops, for the driver's safety
    /// hold duration. Defaults to a plain `drive_up`.
    fn emergency_retract(&self) -> Result<()> {
        self.drive_up()
    }
}

/// Which travel limit an endstop event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endstop {
    /// Piston fully retracted (bag released), the canonical rest position.
    Top,
    /// Piston fully extended (bag compressed).
    Bottom,
}

/// Debounced endstop flags, updated from the driver's interrupt context and
/// read with relaxed atomic loads by the controller.
///
/// Invariant: `at_top` and `at_bottom` are never simultaneously true.
/// Setting one clears the other, and commanding motion in a direction clears
/// the endstop the piston is leaving.
#[derive(Debug, Default)]
pub struct EndstopState {
    at_top: AtomicBool,
    at_bottom: AtomicBool,
}

impl EndstopState {
    /// Create with both flags clear (piston position unknown).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an endstop transition from the interrupt context.
    pub fn on_endstop(&self, which: Endstop) {
        match which {
            Endstop::Top => {
                self.at_bottom.store(false, Ordering::Relaxed);
                self.at_top.store(true, Ordering::Relaxed);
            }
            Endstop::Bottom => {
                self.at_top.store(false, Ordering::Relaxed);
                self.at_bottom.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Clear one flag; called when motion away from that end is commanded.
    pub fn clear(&self, which: Endstop) {
        match which {
            Endstop::Top => self.at_top.store(false, Ordering::Relaxed),
            Endstop::Bottom => self.at_bottom.store(false, Ordering::Relaxed),
        }
    }

    /// Whether the piston is at the top travel limit.
    pub fn at_top(&self) -> bool {
        self.at_top.load(Ordering::Relaxed)
    }

    /// Whether the piston is at the bottom travel limit.
    pub fn at_bottom(&self) -> bool {
        self.at_bottom.load(Ordering::Relaxed)
    }

    /// Whether either travel limit is currently active.
    pub fn any(&self) -> bool {
        self.at_top() || self.at_bottom()
    }
}
