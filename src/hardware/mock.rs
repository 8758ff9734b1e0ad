//! Mock hardware implementations.
//!
//! Simulated transducers and a recording piston actuator for testing the
//! pipeline without physical hardware. All mocks are cheaply cloneable
//! (shared interior state), so a test can keep one clone to script sensor
//! values while the pipeline owns another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use crate::core::PistonCommand;

use super::{FlowSensor, PistonActuator, PressureSensor};

/// Mock pressure transducer with a scriptable value and optional noise.
#[derive(Clone)]
pub struct MockPressureSensor {
    value: Arc<RwLock<f64>>,
    noise_cmh2o: f64,
    fail: Arc<AtomicBool>,
}

impl MockPressureSensor {
    /// Create reading a constant `value` cmH₂O with no noise.
    pub fn new(value: f64) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
            noise_cmh2o: 0.0,
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add uniform noise of the given half-amplitude to each reading.
    pub fn with_noise(mut self, half_amplitude: f64) -> Self {
        self.noise_cmh2o = half_amplitude;
        self
    }

    /// Script the pressure the sensor will report from now on.
    pub async fn set_pressure(&self, cmh2o: f64) {
        *self.value.write().await = cmh2o;
    }

    /// Make every subsequent read fail, to exercise the error path.
    pub fn fail_reads(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl PressureSensor for MockPressureSensor {
    async fn read_pressure(&self) -> Result<f64> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(anyhow!("mock pressure transducer fault"));
        }
        let base = *self.value.read().await;
        Ok(base + jitter(self.noise_cmh2o))
    }
}

/// Mock flow transducer with a scriptable value and optional noise.
#[derive(Clone)]
pub struct MockFlowSensor {
    value: Arc<RwLock<f64>>,
    noise_lpm: f64,
    fail: Arc<AtomicBool>,
}

impl MockFlowSensor {
    /// Create reading a constant `value` L/min with no noise.
    pub fn new(value: f64) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
            noise_lpm: 0.0,
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add uniform noise of the given half-amplitude to each reading.
    pub fn with_noise(mut self, half_amplitude: f64) -> Self {
        self.noise_lpm = half_amplitude;
        self
    }

    /// Script the flow the sensor will report from now on.
    pub async fn set_flow(&self, lpm: f64) {
        *self.value.write().await = lpm;
    }

    /// Make every subsequent read fail, to exercise the error path.
    pub fn fail_reads(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl FlowSensor for MockFlowSensor {
    async fn read_flow(&self) -> Result<f64> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(anyhow!("mock flow transducer fault"));
        }
        let base = *self.value.read().await;
        Ok(base + jitter(self.noise_lpm))
    }
}

fn jitter(half_amplitude: f64) -> f64 {
    if half_amplitude <= 0.0 {
        0.0
    } else {
        rand::thread_rng().gen_range(-half_amplitude..half_amplitude)
    }
}

/// Recording piston actuator: latches the last command and keeps the full
/// command history for assertions.
#[derive(Clone, Default)]
pub struct MockPiston {
    history: Arc<Mutex<Vec<PistonCommand>>>,
}

impl MockPiston {
    /// Create with an empty command history.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently issued command, if any.
    pub fn last_command(&self) -> Option<PistonCommand> {
        self.history.lock().ok().and_then(|h| h.last().copied())
    }

    /// Full command history, oldest first.
    pub fn history(&self) -> Vec<PistonCommand> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn record(&self, cmd: PistonCommand) -> Result<()> {
        self.history
            .lock()
            .map_err(|_| anyhow!("mock piston history poisoned"))?
            .push(cmd);
        Ok(())
    }
}

impl PistonActuator for MockPiston {
    fn drive_down(&self) -> Result<()> {
        self.record(PistonCommand::Down)
    }

    fn drive_up(&self) -> Result<()> {
        self.record(PistonCommand::Up)
    }

    fn stop(&self) -> Result<()> {
        self.record(PistonCommand::Idle)
    }
}
