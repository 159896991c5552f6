use std::fmt::{Display, Formatter};

use tokio::sync::watch;
use tracing::debug;

use crate::error::{TgError, TgResult};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum LinkState {
    NotConnected,
    Connected,
    Closing,
    Closed,
    Reconnecting,
    /// the server forcefully terminated the session; terminal
    Terminated,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LinkState {
    pub fn is_closed(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Closing | LinkState::Terminated)
    }

    fn can_transition_to(self, to: LinkState) -> bool {
        use LinkState::*;
        matches!((self, to),
            (NotConnected, Connected)
            | (NotConnected, Closed)
            | (Connected, Closing)
            | (Connected, Reconnecting)
            | (Connected, Terminated)
            | (Reconnecting, Connected)
            | (Reconnecting, Closed)
            | (Reconnecting, Terminated)
            | (Closing, Closed)
            | (Closed, Connected)
        )
    }
}

/// The link state together with the number of times the channel has (re-)connected. The epoch
///  lets a task that observed a failure on one connection tell whether a reconnect happened since.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub epoch: u64,
}

/// Holds the current [LinkState]. Reads are lock free, and tasks can wait for changes.
///
/// Transitions are only valid along the documented state machine, and callers are expected to
///  hold the channel's state lock while changing state.
pub struct LinkStateCell {
    status: watch::Sender<LinkStatus>,
}

impl Default for LinkStateCell {
    fn default() -> Self {
        LinkStateCell {
            status: watch::Sender::new(LinkStatus {
                state: LinkState::NotConnected,
                epoch: 0,
            }),
        }
    }
}

impl LinkStateCell {
    pub fn get(&self) -> LinkState {
        self.status.borrow().state
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    pub fn transition(&self, to: LinkState) -> TgResult<()> {
        let mut result = Ok(());
        self.status.send_if_modified(|status| {
            if status.state == to {
                return false;
            }
            if !status.state.can_transition_to(to) {
                result = Err(TgError::General(format!("invalid link state transition from {} to {}", status.state, to)));
                return false;
            }

            debug!("link state {} -> {}", status.state, to);
            status.state = to;
            if to == LinkState::Connected {
                status.epoch += 1;
            }
            true
        });
        result
    }
}
