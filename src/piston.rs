//! Piston motion layer: actuator commands plus endstop bookkeeping.
//!
//! [`PistonDriver`] wraps a [`PistonActuator`] and the shared [`EndstopState`]
//! so the cycle controller issues motion in one place. Commanding motion in a
//! direction clears the endstop flag the piston is leaving; the flag for the
//! destination end is set by the driver's interrupt context and observed on a
//! later control tick. Commands are latched: issuing the same direction twice
//! is harmless.

use std::sync::Arc;

use tracing::debug;

use crate::core::PistonCommand;
use crate::error::{VentError, VentResult};
use crate::hardware::{Endstop, EndstopState, PistonActuator};

/// Owns the actuator and tracks the currently commanded direction.
pub struct PistonDriver {
    actuator: Box<dyn PistonActuator>,
    endstops: Arc<EndstopState>,
    commanded: PistonCommand,
}

impl PistonDriver {
    /// Wrap an actuator and its endstop state.
    pub fn new(actuator: Box<dyn PistonActuator>, endstops: Arc<EndstopState>) -> Self {
        Self {
            actuator,
            endstops,
            commanded: PistonCommand::Idle,
        }
    }

    /// Drive the piston down (compress the bag). Clears the top endstop flag.
    pub fn drive_down(&mut self) -> VentResult<()> {
        self.endstops.clear(Endstop::Top);
        self.actuator
            .drive_down()
            .map_err(|e| VentError::Actuator(e.to_string()))?;
        if self.commanded != PistonCommand::Down {
            debug!("piston commanded down");
        }
        self.commanded = PistonCommand::Down;
        Ok(())
    }

    /// Drive the piston up (release the bag). Clears the bottom endstop flag.
    pub fn drive_up(&mut self) -> VentResult<()> {
        self.endstops.clear(Endstop::Bottom);
        self.actuator
            .drive_up()
            .map_err(|e| VentError::Actuator(e.to_string()))?;
        if self.commanded != PistonCommand::Up {
            debug!("piston commanded up");
        }
        self.commanded = PistonCommand::Up;
        Ok(())
    }

    /// De-assert both outputs.
    pub fn stop(&mut self) -> VentResult<()> {
        self.actuator
            .stop()
            .map_err(|e| VentError::Actuator(e.to_string()))?;
        self.commanded = PistonCommand::Idle;
        Ok(())
    }

    /// Force retraction regardless of endstop state.
    pub fn emergency_retract(&mut self) -> VentResult<()> {
        self.endstops.clear(Endstop::Bottom);
        self.actuator
            .emergency_retract()
            .map_err(|e| VentError::Actuator(e.to_string()))?;
        self.commanded = PistonCommand::Up;
        Ok(())
    }

    /// The direction currently commanded.
    pub fn command(&self) -> PistonCommand {
        self.commanded
    }

    /// Whether the piston is at the top travel limit.
    pub fn at_top(&self) -> bool {
        self.endstops.at_top()
    }

    /// Whether the piston is at the bottom travel limit.
    pub fn at_bottom(&self) -> bool {
        self.endstops.at_bottom()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPiston;

    fn driver() -> (PistonDriver, MockPiston, Arc<EndstopState>) {
        let piston = MockPiston::new();
        let endstops = Arc::new(EndstopState::new());
        let driver = PistonDriver::new(Box::new(piston.clone()), Arc::clone(&endstops));
        (driver, piston, endstops)
    }

    #[test]
    fn drive_down_clears_top_flag() {
        let (mut driver, piston, endstops) = driver();
        endstops.on_endstop(Endstop::Top);
        assert!(driver.at_top());

        driver.drive_down().unwrap();
        assert!(!driver.at_top());
        assert_eq!(driver.command(), PistonCommand::Down);
        assert_eq!(piston.last_command(), Some(PistonCommand::Down));
    }

    #[test]
    fn drive_up_clears_bottom_flag() {
        let (mut driver, _piston, endstops) = driver();
        endstops.on_endstop(Endstop::Bottom);

        driver.drive_up().unwrap();
        assert!(!driver.at_bottom());
        assert_eq!(driver.command(), PistonCommand::Up);
    }

    #[test]
    fn stop_returns_command_to_idle() {
        let (mut driver, piston, _endstops) = driver();
        driver.drive_down().unwrap();
        driver.stop().unwrap();
        assert_eq!(driver.command(), PistonCommand::Idle);
        assert_eq!(
            piston.history(),
            vec![PistonCommand::Down, PistonCommand::Idle]
        );
    }

    #[test]
    fn emergency_retract_commands_up() {
        let (mut driver, piston, endstops) = driver();
        endstops.on_endstop(Endstop::Bottom);
        driver.emergency_retract().unwrap();
        assert_eq!(driver.command(), PistonCommand::Up);
        assert!(!driver.at_bottom());
        assert_eq!(piston.last_command(), Some(PistonCommand::Up));
    }
}
