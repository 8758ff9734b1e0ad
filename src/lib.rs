//! Control core for a piston-driven bag ventilator.
//!
//! `ventcore` implements the host-side pipeline that turns raw transducer
//! readings into breathing cycles:
//!
//! - [`sampler`]: fixed-rate acquisition from the pressure and flow
//!   transducers onto bounded broadcast streams
//! - [`conditioner`]: tare correction and tidal volume integration,
//!   published latest-value-wins
//! - [`controller`]: the tick-driven cycle state machine: startup homing,
//!   initial tare, then VCV/PCV/PSV breathing with an emergency override
//! - [`piston`]: actuator commands plus endstop bookkeeping
//! - [`input`]: rotary encoder and push button decoding
//! - [`hardware`]: capability traits, the analog front-end conversions,
//!   and mock implementations for testing
//! - [`config`]: TOML/env-layered control settings
//! - [`telemetry`]: structured logging setup
//!
//! Components communicate over `tokio` channels and share no locks on the
//! control path. Each has an async `run` entry point; an embedding
//! application spawns them and keeps the [`controller::ControllerLink`] for
//! the UI side.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use ventcore::config::ControlSettings;
//! use ventcore::conditioner::SignalConditioner;
//! use ventcore::controller::CycleController;
//! use ventcore::hardware::mock::{MockFlowSensor, MockPiston, MockPressureSensor};
//! use ventcore::hardware::EndstopState;
//! use ventcore::piston::PistonDriver;
//! use ventcore::sampler::SensorSampler;
//!
//! # async fn pipeline() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ControlSettings::load_from("config/ventcore.toml")?;
//! settings.validate()?;
//! let (settings_tx, settings_rx) = tokio::sync::watch::channel(settings.clone());
//!
//! let sampler = SensorSampler::new(
//!     Arc::new(MockPressureSensor::new(0.0)),
//!     Arc::new(MockFlowSensor::new(0.0)),
//!     settings.timing.sample_rate_hz,
//!     tokio::time::Instant::now(),
//! );
//! let streams = sampler.streams();
//!
//! let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(8);
//! let (events_tx, _) = tokio::sync::broadcast::channel(ventcore::controller::EVENT_CAPACITY);
//! let conditioner = SignalConditioner::new(&streams, cmd_rx, events_tx.clone());
//! let signal_rx = conditioner.subscribe();
//!
//! let endstops = Arc::new(EndstopState::new());
//! let driver = PistonDriver::new(Box::new(MockPiston::new()), Arc::clone(&endstops));
//! let (controller, link) =
//!     CycleController::new(driver, signal_rx, cmd_tx, settings_rx, events_tx);
//!
//! tokio::spawn(sampler.run());
//! tokio::spawn(conditioner.run());
//! tokio::spawn(controller.run());
//!
//! link.set_mode(ventcore::core::VentilationMode::VolumeControlled);
//! # drop(settings_tx);
//! # Ok(())
//! # }
//! ```

pub mod conditioner;
pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod hardware;
pub mod history;
pub mod input;
pub mod piston;
pub mod sampler;
pub mod telemetry;

pub use crate::config::ControlSettings;
pub use crate::controller::{ControllerLink, CycleController};
pub use crate::core::{Conditioned, ControlEvent, CycleStats, Sample, VentilationMode};
pub use crate::error::{VentError, VentResult};
