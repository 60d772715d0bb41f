//! Registry mailbox messages and transport-facing types.

use super::state::ConnectionState;
use crate::bus::WireMessage;
use common::types::ConnectionId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Reserved keepalive frame. Never parsed as JSON.
pub const KEEPALIVE_FRAME: &str = "-";

/// Events a transport reports to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed,
}

/// What the registry asks a transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Connection counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub guests: usize,
    pub authenticated: usize,
    pub lost: usize,
}

#[derive(Debug)]
pub enum RegistryMessage {
    OpenTransport {
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        respond_to: oneshot::Sender<ConnectionId>,
    },
    Transport {
        connection_id: ConnectionId,
        event: TransportEvent,
    },
    /// Fan out to every live local transport.
    Broadcast { message: WireMessage },
    /// Deliver to the participant's local connection, buffering if Lost.
    SendTo {
        user_id: String,
        message: WireMessage,
    },
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
    LookupUser {
        user_id: String,
        respond_to: oneshot::Sender<Option<ConnectionState>>,
    },
    AuthWindowElapsed { connection_id: ConnectionId },
    GraceExpired { connection_id: ConnectionId },
    RecountGuests,
}
