//! Custom error types for the control core.
//!
//! This module defines the primary error type, `VentError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the controller
//! distinguishes:
//!
//! - **`Config` / `ConfigValidation`**: problems loading or semantically
//!   validating the control settings. Loading errors come from `figment`;
//!   validation errors are values that parse fine but are physiologically or
//!   mechanically nonsensical (zero breathing frequency, negative volumes).
//! - **`Sensor`**: a transducer driver failed to produce a reading. Fatal to
//!   the sampling loop that hit it: the control loop depends on fresh data
//!   and a silently-wrong zero would be worse than a loud failure.
//! - **`Actuator`**: the piston driver rejected a motion command.
//! - **`StartupTimeout`**: the homing procedure exhausted its attempt budget
//!   without reaching either endstop. The controller must not cycle with an
//!   unknown piston position, so this is fatal-to-cycling and surfaced as a
//!   retry-awaiting condition.
//! - **`SensorTimeout`**: no valid pressure/volume reading ever arrived
//!   within the startup deadline. Cycling without sensor feedback is unsafe.
//! - **`ChannelClosed`**: an inter-task channel was dropped, meaning a
//!   pipeline peer has gone away and the component cannot continue.
//!
//! Control-loop-local conditions (pressure limit exceeded mid-inhale, endstop
//! reached) are *not* errors: they are handled by state transition inside the
//! cycle controller and never propagate through this type.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type VentResult<T> = std::result::Result<T, VentError>;

/// Central error type for the ventilator control core.
#[derive(Error, Debug)]
pub enum VentError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    /// A pressure or flow transducer read failed.
    #[error("Sensor error: {0}")]
    Sensor(String),

    /// The piston actuator rejected a drive command.
    #[error("Actuator error: {0}")]
    Actuator(String),

    /// Homing never reached an endstop within the attempt budget.
    #[error("Startup homing failed after {attempts} attempts")]
    StartupTimeout {
        /// Number of direction-hold attempts made before giving up.
        attempts: u32,
    },

    /// No sensor reading arrived within the startup deadline.
    #[error("No sensor data received within {timeout_s} s of startup")]
    SensorTimeout {
        /// The deadline that elapsed, in seconds.
        timeout_s: f64,
    },

    /// An inter-task channel closed; the pipeline peer has gone away.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}
