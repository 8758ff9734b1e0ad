//! Decoding hardware input edges into user actions.
//!
//! Push buttons decode trivially: one debounced falling edge is one press.
//! The rotary encoder needs a tiny state machine: a detent produces an edge
//! on both the CLK and DT lines, and the *order* of the pair gives the
//! direction. CLK before DT is clockwise, DT before CLK is counter-clockwise.
//! The pair only counts when the second edge lands inside a time window:
//! too close together is electrical noise, too far apart is two unrelated
//! half-turns.
//!
//! [`InputDecoder::feed`] is a pure function of decoder state and one edge,
//! so the pairing logic tests without any hardware or clock. The async
//! wrapper in [`InputDecoder::run`] adapts it to channels.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::{EdgeEvent, EdgeLine, UserAction};
use crate::error::{VentError, VentResult};

/// Pairing window for encoder edges, seconds.
const MIN_PAIR_INTERVAL_S: f64 = 5e-6;
const MAX_PAIR_INTERVAL_S: f64 = 0.150;

#[derive(Clone, Copy, Debug, PartialEq)]
enum DecoderState {
    /// No unpaired encoder edge outstanding.
    Idle,
    /// Saw CLK at the given time, waiting for DT.
    GotClkFirst(f64),
    /// Saw DT at the given time, waiting for CLK.
    GotDtFirst(f64),
}

/// Turns a stream of debounced edges into discrete [`UserAction`]s.
#[derive(Debug)]
pub struct InputDecoder {
    state: DecoderState,
}

impl Default for InputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl InputDecoder {
    /// Create a decoder with no outstanding encoder edge.
    pub fn new() -> Self {
        Self {
            state: DecoderState::Idle,
        }
    }

    /// Feed one edge; returns the decoded action if the edge completes one.
    pub fn feed(&mut self, edge: EdgeEvent) -> Option<UserAction> {
        match edge.line {
            // Buttons bypass the encoder state entirely: a pending half-turn
            // stays pending across an unrelated button press.
            EdgeLine::Ok => return Some(UserAction::Ok),
            EdgeLine::Up => return Some(UserAction::Up),
            EdgeLine::Down => return Some(UserAction::Down),
            EdgeLine::Rot => return Some(UserAction::Rotate),
            EdgeLine::Clk | EdgeLine::Dt => {}
        }

        match (self.state, edge.line) {
            (DecoderState::Idle, EdgeLine::Clk) => {
                self.state = DecoderState::GotClkFirst(edge.t);
                None
            }
            (DecoderState::Idle, EdgeLine::Dt) => {
                self.state = DecoderState::GotDtFirst(edge.t);
                None
            }
            (DecoderState::GotClkFirst(t0), EdgeLine::Dt) => self.try_pair(
                t0,
                edge,
                UserAction::Clockwise,
                DecoderState::GotDtFirst(edge.t),
            ),
            (DecoderState::GotDtFirst(t0), EdgeLine::Clk) => self.try_pair(
                t0,
                edge,
                UserAction::CounterClockwise,
                DecoderState::GotClkFirst(edge.t),
            ),
            // Same line twice: the earlier edge was a stray, keep the newer.
            (DecoderState::GotClkFirst(_), EdgeLine::Clk) => {
                self.state = DecoderState::GotClkFirst(edge.t);
                None
            }
            (DecoderState::GotDtFirst(_), EdgeLine::Dt) => {
                self.state = DecoderState::GotDtFirst(edge.t);
                None
            }
            _ => None,
        }
    }

    /// Resolve a candidate pair. Inside the window the pair decodes to
    /// `action`; outside it the stale first edge is discarded and the new
    /// edge starts a fresh half-turn (`restate`).
    fn try_pair(
        &mut self,
        t0: f64,
        edge: EdgeEvent,
        action: UserAction,
        restate: DecoderState,
    ) -> Option<UserAction> {
        let dt = edge.t - t0;
        if (MIN_PAIR_INTERVAL_S..=MAX_PAIR_INTERVAL_S).contains(&dt) {
            self.state = DecoderState::Idle;
            trace!(?action, interval_s = dt, "encoder detent");
            Some(action)
        } else {
            self.state = restate;
            None
        }
    }

    /// Pump edges from `edges` into decoded actions on `actions` until the
    /// edge source closes.
    pub async fn run(
        mut self,
        mut edges: mpsc::Receiver<EdgeEvent>,
        actions: mpsc::Sender<UserAction>,
    ) -> VentResult<()> {
        while let Some(edge) = edges.recv().await {
            if let Some(action) = self.feed(edge) {
                debug!(?action, "user action");
                actions
                    .send(action)
                    .await
                    .map_err(|_| VentError::ChannelClosed("user actions"))?;
            }
        }
        debug!("edge source closed, input decoder stopping");
        Ok(())
    }
}
