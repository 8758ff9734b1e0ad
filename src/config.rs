//! Strongly-typed control settings.
//!
//! Settings are loaded from a TOML file merged with `VENTCORE_`-prefixed
//! environment variables via `figment`, validated, and then distributed to
//! the controller through a `watch` channel. The controller re-reads the
//! channel every tick, so a settings update from the UI takes effect on the
//! next tick boundary without restarting anything.
//!
//! # Example
//! ```no_run
//! use ventcore::config::ControlSettings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ControlSettings::load_from("config/ventcore.toml")?;
//! settings.validate()?;
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{VentError, VentResult};

/// Top-level control settings, one section per concern.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlSettings {
    /// Control-loop and sampling timing.
    #[serde(default)]
    pub timing: TimingSettings,
    /// Volume-controlled ventilation parameters.
    #[serde(default)]
    pub vcv: VcvSettings,
    /// Pressure-controlled ventilation parameters.
    #[serde(default)]
    pub pcv: PcvSettings,
    /// Pressure-support ventilation parameters.
    #[serde(default)]
    pub psv: PsvSettings,
    /// Startup homing parameters.
    #[serde(default)]
    pub homing: HomingSettings,
    /// Tare calibration parameters.
    #[serde(default)]
    pub tare: TareSettings,
}

/// Control-loop and sampling timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Control tick period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Sensor sampling rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
    /// Fatal deadline for the first valid sensor reading at startup, seconds.
    #[serde(default = "default_first_sample_timeout")]
    pub first_sample_timeout_s: f64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            sample_rate_hz: default_sample_rate(),
            first_sample_timeout_s: default_first_sample_timeout(),
        }
    }
}

/// Volume-controlled ventilation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcvSettings {
    /// Breathing frequency, breaths per minute.
    #[serde(default = "default_frequency")]
    pub frequency_bpm: f64,
    /// Target tidal volume, mL.
    #[serde(default = "default_tidal_volume")]
    pub tidal_volume_ml: f64,
    /// Safety pressure ceiling, cmH₂O; inhale aborts at or above this.
    #[serde(default = "default_max_pressure")]
    pub max_pressure_cmh2o: f64,
    /// Inhale-hold duration applied when a pause is requested, seconds.
    #[serde(default = "default_inhale_pause")]
    pub inhale_pause_s: f64,
}

impl Default for VcvSettings {
    fn default() -> Self {
        Self {
            frequency_bpm: default_frequency(),
            tidal_volume_ml: default_tidal_volume(),
            max_pressure_cmh2o: default_max_pressure(),
            inhale_pause_s: default_inhale_pause(),
        }
    }
}

impl VcvSettings {
    /// Breath period in seconds (60 / frequency).
    pub fn period_s(&self) -> f64 {
        60.0 / self.frequency_bpm
    }
}

/// Pressure-controlled ventilation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcvSettings {
    /// Breathing frequency, breaths per minute.
    #[serde(default = "default_frequency")]
    pub frequency_bpm: f64,
    /// Target airway pressure, cmH₂O; inhale succeeds at or above this.
    #[serde(default = "default_target_pressure")]
    pub target_pressure_cmh2o: f64,
    /// Safety volume ceiling, mL; inhale aborts at or above this.
    #[serde(default = "default_max_volume")]
    pub max_volume_ml: f64,
    /// Hard inhale duration ceiling, seconds.
    #[serde(default = "default_inhale_time")]
    pub inhale_time_s: f64,
    /// Inhale-hold duration applied when a pause is requested, seconds.
    #[serde(default = "default_inhale_pause")]
    pub inhale_pause_s: f64,
}

impl Default for PcvSettings {
    fn default() -> Self {
        Self {
            frequency_bpm: default_frequency(),
            target_pressure_cmh2o: default_target_pressure(),
            max_volume_ml: default_max_volume(),
            inhale_time_s: default_inhale_time(),
            inhale_pause_s: default_inhale_pause(),
        }
    }
}

impl PcvSettings {
    /// Breath period in seconds (60 / frequency).
    pub fn period_s(&self) -> f64 {
        60.0 / self.frequency_bpm
    }
}

/// Pressure-support ventilation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsvSettings {
    /// Support pressure the inhale drives toward, cmH₂O.
    #[serde(default = "default_target_pressure")]
    pub support_pressure_cmh2o: f64,
    /// Effort-trigger sensitivity, cmH₂O below zero that starts a breath.
    #[serde(default = "default_sensitivity")]
    pub trigger_sensitivity_cmh2o: f64,
}

impl Default for PsvSettings {
    fn default() -> Self {
        Self {
            support_pressure_cmh2o: default_target_pressure(),
            trigger_sensitivity_cmh2o: default_sensitivity(),
        }
    }
}

/// Startup homing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomingSettings {
    /// How long each drive direction is held before reversing, seconds.
    #[serde(default = "default_direction_timeout")]
    pub direction_timeout_s: f64,
    /// Maximum direction-hold attempts before declaring a startup error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for HomingSettings {
    fn default() -> Self {
        Self {
            direction_timeout_s: default_direction_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Tare calibration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TareSettings {
    /// Averaging window for offset computation, seconds.
    #[serde(default = "default_tare_window")]
    pub window_s: f64,
}

impl Default for TareSettings {
    fn default() -> Self {
        Self {
            window_s: default_tare_window(),
        }
    }
}

// Default value functions
fn default_tick_ms() -> u64 {
    50
}

fn default_sample_rate() -> f64 {
    100.0
}

fn default_first_sample_timeout() -> f64 {
    5.0
}

fn default_frequency() -> f64 {
    12.0
}

fn default_tidal_volume() -> f64 {
    300.0
}

fn default_max_pressure() -> f64 {
    40.0
}

fn default_inhale_pause() -> f64 {
    1.0
}

fn default_target_pressure() -> f64 {
    20.0
}

fn default_max_volume() -> f64 {
    600.0
}

fn default_inhale_time() -> f64 {
    2.0
}

fn default_sensitivity() -> f64 {
    2.0
}

fn default_direction_timeout() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    20
}

fn default_tare_window() -> f64 {
    5.0
}

impl ControlSettings {
    /// Load settings from a TOML file merged with `VENTCORE_`-prefixed
    /// environment variables, on top of the built-in defaults.
    ///
    /// Example override: `VENTCORE_VCV_FREQUENCY_BPM=15`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ControlSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VENTCORE_").split("_"))
            .extract()
    }

    /// Validate that the settings are physically and mechanically sane.
    pub fn validate(&self) -> VentResult<()> {
        if self.timing.tick_ms == 0 || self.timing.tick_ms > 50 {
            return Err(VentError::ConfigValidation(format!(
                "tick_ms must be in 1..=50, got {}",
                self.timing.tick_ms
            )));
        }
        if self.timing.sample_rate_hz <= 0.0 {
            return Err(VentError::ConfigValidation(
                "sample_rate_hz must be positive".into(),
            ));
        }
        if self.timing.first_sample_timeout_s <= 0.0 {
            return Err(VentError::ConfigValidation(
                "first_sample_timeout_s must be positive".into(),
            ));
        }
        for (name, freq) in [
            ("vcv.frequency_bpm", self.vcv.frequency_bpm),
            ("pcv.frequency_bpm", self.pcv.frequency_bpm),
        ] {
            if freq <= 0.0 {
                return Err(VentError::ConfigValidation(format!(
                    "{name} must be positive, got {freq}"
                )));
            }
        }
        if self.vcv.tidal_volume_ml <= 0.0 {
            return Err(VentError::ConfigValidation(
                "vcv.tidal_volume_ml must be positive".into(),
            ));
        }
        if self.vcv.max_pressure_cmh2o <= 0.0 {
            return Err(VentError::ConfigValidation(
                "vcv.max_pressure_cmh2o must be positive".into(),
            ));
        }
        for (name, pause) in [
            ("vcv.inhale_pause_s", self.vcv.inhale_pause_s),
            ("pcv.inhale_pause_s", self.pcv.inhale_pause_s),
        ] {
            if pause < 0.0 {
                return Err(VentError::ConfigValidation(format!(
                    "{name} must not be negative, got {pause}"
                )));
            }
        }
        if self.pcv.max_volume_ml <= 0.0 || self.pcv.inhale_time_s <= 0.0 {
            return Err(VentError::ConfigValidation(
                "pcv limits must be positive".into(),
            ));
        }
        if self.psv.support_pressure_cmh2o <= 0.0 || self.psv.trigger_sensitivity_cmh2o <= 0.0 {
            return Err(VentError::ConfigValidation(
                "psv parameters must be positive".into(),
            ));
        }
        if self.homing.max_attempts == 0 {
            return Err(VentError::ConfigValidation(
                "homing.max_attempts must be at least 1".into(),
            ));
        }
        if self.homing.direction_timeout_s <= 0.0 {
            return Err(VentError::ConfigValidation(
                "homing.direction_timeout_s must be positive".into(),
            ));
        }
        if self.tare.window_s <= 0.0 {
            return Err(VentError::ConfigValidation(
                "tare.window_s must be positive".into(),
            ));
        }
        Ok(())
    }
}
