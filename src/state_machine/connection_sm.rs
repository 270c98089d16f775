//! RFB connection state machine.
//!
//! Hierarchy:
//! ```text
//! Idle → Live (superstate)                       → Closed { reason }
//!          ├── Handshaking                             (terminal)
//!          ├── Negotiated
//!          └── Streaming  [entry: log]
//! ```
//!
//! A connection is single-shot: once `Closed`, every event is ignored and
//! the owning client must be replaced.

use statig::prelude::*;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// TCP connection established; handshake begins.
    Connected,
    /// ServerInit received.
    HandshakeComplete,
    /// Pixel format, encodings and first update request sent.
    StreamStarted,
    /// Socket failed, protocol error, or local disconnect.
    Closed(String),
}

/// Coarse connection state exposed to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Negotiated,
    Streaming,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct ConnectionMachine {
    /// Peer address, for log context.
    pub peer: String,
    /// Whether this connection ever reached `Streaming`.
    pub reached_streaming: bool,
}

impl ConnectionMachine {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            reached_streaming: false,
        }
    }

    pub fn public_state(state: &State) -> ConnectionState {
        match state {
            State::Idle {} | State::Closed { .. } => ConnectionState::Disconnected,
            State::Handshaking {} => ConnectionState::Handshaking,
            State::Negotiated {} => ConnectionState::Negotiated,
            State::Streaming {} => ConnectionState::Streaming,
        }
    }

    /// Close reason, once closed.
    pub fn close_reason(state: &State) -> Option<&str> {
        match state {
            State::Closed { reason } => Some(reason),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq))
)]
impl ConnectionMachine {
    #[superstate]
    fn live(&mut self, event: &ConnectionEvent) -> Outcome<State> {
        match event {
            ConnectionEvent::Closed(reason) => Transition(State::closed(reason.clone())),
            _ => Handled,
        }
    }

    #[state]
    fn idle(&mut self, event: &ConnectionEvent) -> Outcome<State> {
        match event {
            ConnectionEvent::Connected => Transition(State::handshaking()),
            ConnectionEvent::Closed(reason) => Transition(State::closed(reason.clone())),
            _ => Handled,
        }
    }

    #[state(superstate = "live")]
    fn handshaking(&mut self, event: &ConnectionEvent) -> Outcome<State> {
        match event {
            ConnectionEvent::HandshakeComplete => Transition(State::negotiated()),
            _ => Super,
        }
    }

    #[state(superstate = "live")]
    fn negotiated(&mut self, event: &ConnectionEvent) -> Outcome<State> {
        match event {
            ConnectionEvent::StreamStarted => Transition(State::streaming()),
            _ => Super,
        }
    }

    #[state(superstate = "live", entry_action = "enter_streaming")]
    fn streaming(&mut self, event: &ConnectionEvent) -> Outcome<State> {
        let _ = event;
        Super
    }

    /// Terminal. Ignores everything.
    #[state(entry_action = "enter_closed")]
    fn closed(&mut self, event: &ConnectionEvent, reason: &String) -> Outcome<State> {
        debug!(peer = %self.peer, reason = %reason, ?event, "event on closed connection ignored");
        Handled
    }

    #[action]
    fn enter_streaming(&mut self) {
        self.reached_streaming = true;
        info!(peer = %self.peer, "RFB streaming");
    }

    #[action]
    fn enter_closed(&mut self) {
        info!(peer = %self.peer, reached_streaming = self.reached_streaming, "RFB connection closed");
    }
}
