//! Stream session state
//!
//! The gate holds the session state together with an epoch that grows on
//! every start. Asynchronous work captures a `SessionTicket` before it
//! suspends and checks it against the gate before acting, so work begun in
//! an earlier session can never touch a later one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{Error, Result};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nothing running
    Idle,
    /// Acquiring media and ICE servers
    Starting,
    /// Signaling is live
    Active,
    /// Releasing resources
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Inputs of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// `Idle -> Starting`, opens a new epoch
    Start,
    /// `Starting -> Active`
    Activate,
    /// `Starting -> Idle`
    StartFailed,
    /// `Starting | Active -> Stopping`
    Stop,
    /// `Stopping -> Idle`
    Stopped,
}

impl SessionState {
    /// The single transition function. `None` means the event is not
    /// allowed in this state.
    #[must_use]
    pub const fn next(self, event: SessionEvent) -> Option<Self> {
        match (self, event) {
            (Self::Idle, SessionEvent::Start) => Some(Self::Starting),
            (Self::Starting, SessionEvent::Activate) => Some(Self::Active),
            (Self::Starting, SessionEvent::StartFailed) => Some(Self::Idle),
            (Self::Starting | Self::Active, SessionEvent::Stop) => Some(Self::Stopping),
            (Self::Stopping, SessionEvent::Stopped) => Some(Self::Idle),
            _ => None,
        }
    }
}

/// Proof of which session a piece of work belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    epoch: u64,
}

impl SessionTicket {
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }
}

struct GateInner {
    state: SessionState,
    epoch: u64,
}

pub struct SessionGate {
    inner: Mutex<GateInner>,
    state_tx: watch::Sender<SessionState>,
    streaming_tx: watch::Sender<bool>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: SessionState::Idle,
                epoch: 0,
            }),
            state_tx: watch::Sender::new(SessionState::Idle),
            streaming_tx: watch::Sender::new(false),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Ticket for the current epoch
    #[must_use]
    pub fn ticket(&self) -> SessionTicket {
        SessionTicket {
            epoch: self.inner.lock().epoch,
        }
    }

    /// Whether `ticket` belongs to the current session and that session is in `state`
    #[must_use]
    pub fn holds(&self, ticket: SessionTicket, state: SessionState) -> bool {
        let inner = self.inner.lock();
        inner.epoch == ticket.epoch && inner.state == state
    }

    /// Whether `ticket` belongs to the current session and signaling is live
    #[must_use]
    pub fn is_active(&self, ticket: SessionTicket) -> bool {
        self.holds(ticket, SessionState::Active)
    }

    /// Apply `event` regardless of epoch.
    pub fn transition(&self, event: SessionEvent) -> Result<SessionTicket> {
        self.step(None, event)
    }

    /// Apply `event` only if `ticket` is still the current epoch.
    pub fn transition_from(&self, ticket: SessionTicket, event: SessionEvent) -> Result<SessionTicket> {
        self.step(Some(ticket), event)
    }

    fn step(&self, ticket: Option<SessionTicket>, event: SessionEvent) -> Result<SessionTicket> {
        let (from, to, epoch) = {
            let mut inner = self.inner.lock();

            if let Some(ticket) = ticket {
                if ticket.epoch != inner.epoch {
                    return Err(Error::InvalidState(format!(
                        "session epoch {} has ended (current {})",
                        ticket.epoch, inner.epoch
                    )));
                }
            }

            let from = inner.state;
            let to = from.next(event).ok_or_else(|| {
                Error::InvalidState(format!("cannot apply {event:?} while {from}"))
            })?;

            if event == SessionEvent::Start {
                inner.epoch += 1;
            }
            inner.state = to;
            (from, to, inner.epoch)
        };

        self.state_tx.send_replace(to);
        self.streaming_tx
            .send_if_modified(|streaming| {
                let now = to == SessionState::Active;
                let changed = *streaming != now;
                *streaming = now;
                changed
            });

        if to == SessionState::Active || to == SessionState::Idle {
            info!(from = %from, to = %to, epoch = epoch, "Stream session state changed");
        } else {
            debug!(from = %from, to = %to, epoch = epoch, "Stream session state changed");
        }

        Ok(SessionTicket { epoch })
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn subscribe_streaming(&self) -> watch::Receiver<bool> {
        self.streaming_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use SessionEvent::*;
        use SessionState::*;

        assert_eq!(Idle.next(Start), Some(Starting));
        assert_eq!(Starting.next(Activate), Some(Active));
        assert_eq!(Starting.next(StartFailed), Some(Idle));
        assert_eq!(Starting.next(Stop), Some(Stopping));
        assert_eq!(Active.next(Stop), Some(Stopping));
        assert_eq!(Stopping.next(Stopped), Some(Idle));

        assert_eq!(Idle.next(Stop), None);
        assert_eq!(Active.next(Start), None);
        assert_eq!(Stopping.next(Activate), None);
        assert_eq!(Idle.next(Activate), None);
    }

    #[test]
    fn test_start_opens_new_epoch() {
        let gate = SessionGate::new();
        let first = gate.transition(SessionEvent::Start).unwrap();
        gate.transition_from(first, SessionEvent::Activate).unwrap();
        assert!(gate.is_active(first));

        gate.transition(SessionEvent::Stop).unwrap();
        assert!(!gate.is_active(first));
        gate.transition(SessionEvent::Stopped).unwrap();

        let second = gate.transition(SessionEvent::Start).unwrap();
        assert_ne!(first, second);
        gate.transition_from(second, SessionEvent::Activate).unwrap();

        assert!(!gate.is_active(first));
        assert!(gate.is_active(second));
    }

    #[test]
    fn test_stale_ticket_cannot_transition() {
        let gate = SessionGate::new();
        let old = gate.transition(SessionEvent::Start).unwrap();
        gate.transition(SessionEvent::Stop).unwrap();
        gate.transition(SessionEvent::Stopped).unwrap();
        gate.transition(SessionEvent::Start).unwrap();

        let err = gate.transition_from(old, SessionEvent::Activate).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(gate.state(), SessionState::Starting);
    }

    #[test]
    fn test_streaming_flag_follows_active_state() {
        let gate = SessionGate::new();
        let streaming = gate.subscribe_streaming();
        let state = gate.subscribe_state();

        let ticket = gate.transition(SessionEvent::Start).unwrap();
        assert!(!*streaming.borrow());
        gate.transition_from(ticket, SessionEvent::Activate).unwrap();
        assert!(*streaming.borrow());
        assert_eq!(*state.borrow(), SessionState::Active);

        gate.transition(SessionEvent::Stop).unwrap();
        assert!(!*streaming.borrow());
    }
}
