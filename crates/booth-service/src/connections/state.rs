//! Per-transport connection states and the transitions between them.

use super::messages::OutboundFrame;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Guest,
    Authenticated,
    Lost,
}

impl ConnectionState {
    /// Metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Guest => "guest",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Lost => "lost",
        }
    }
}

/// An open transport that has not authenticated yet.
#[derive(Debug)]
pub struct Guest {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub opened_at: Instant,
    /// Cancels the authentication window timer.
    pub window: CancellationToken,
}

#[derive(Debug)]
pub struct Authenticated {
    pub user_id: String,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    /// Last inbound frame, keepalives included.
    pub last_activity: Instant,
    /// Set when a ban lands mid-session.
    pub banned: bool,
}

/// A participant whose transport dropped. Outbound traffic goes to the
/// durable queue until the grace timer fires or the participant resumes.
#[derive(Debug)]
pub struct Lost {
    pub user_id: String,
    pub grace: CancellationToken,
}

#[derive(Debug)]
pub enum Connection {
    Guest(Guest),
    Authenticated(Authenticated),
    Lost(Lost),
}

/// What the registry does with a connection after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Promote { user_id: String },
    Lose,
    /// Drop the connection. `offline` also takes the participant offline
    /// cluster-wide.
    Remove { offline: bool },
}

impl Connection {
    #[must_use]
    pub fn guest(outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Connection::Guest(Guest {
            outbound,
            opened_at: Instant::now(),
            window: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self {
            Connection::Guest(_) => ConnectionState::Guest,
            Connection::Authenticated(_) => ConnectionState::Authenticated,
            Connection::Lost(_) => ConnectionState::Lost,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Connection::Guest(_) => None,
            Connection::Authenticated(a) => Some(&a.user_id),
            Connection::Lost(l) => Some(&l.user_id),
        }
    }

    /// Live transport, if the connection still has one.
    #[must_use]
    pub fn outbound(&self) -> Option<&mpsc::UnboundedSender<OutboundFrame>> {
        match self {
            Connection::Guest(g) => Some(&g.outbound),
            Connection::Authenticated(a) => Some(&a.outbound),
            Connection::Lost(_) => None,
        }
    }

    /// Transition taken when the transport reports it closed.
    #[must_use]
    pub fn on_closed(&self) -> Transition {
        match self {
            Connection::Guest(_) => Transition::Remove { offline: false },
            Connection::Authenticated(a) if a.banned => Transition::Remove { offline: true },
            Connection::Authenticated(_) => Transition::Lose,
            // No transport to close.
            Connection::Lost(_) => Transition::Stay,
        }
    }

    /// Whether a guest is still inside its authentication window.
    #[must_use]
    pub fn within_auth_window(&self, window: Duration) -> bool {
        match self {
            Connection::Guest(g) => g.opened_at.elapsed() <= window,
            _ => false,
        }
    }

    /// Guest to Authenticated over the same transport. Other states are
    /// returned unchanged.
    #[must_use]
    pub fn promote(self, user_id: String) -> Self {
        match self {
            Connection::Guest(g) => {
                g.window.cancel();
                Connection::Authenticated(Authenticated {
                    user_id,
                    outbound: g.outbound,
                    last_activity: Instant::now(),
                    banned: false,
                })
            }
            other => other,
        }
    }

    /// Authenticated to Lost. The transport is dropped.
    #[must_use]
    pub fn into_lost(self, grace: CancellationToken) -> Self {
        match self {
            Connection::Authenticated(a) => Connection::Lost(Lost {
                user_id: a.user_id,
                grace,
            }),
            other => other,
        }
    }

    /// Cancel any timer owned by this connection.
    pub fn cancel_timers(&self) {
        match self {
            Connection::Guest(g) => g.window.cancel(),
            Connection::Authenticated(_) => {}
            Connection::Lost(l) => l.grace.cancel(),
        }
    }
}
