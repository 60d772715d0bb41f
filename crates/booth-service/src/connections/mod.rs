//! Realtime connections.
//!
//! Every transport is one [`Connection`](state::Connection) in exactly one
//! state:
//!
//! ```text
//! Guest --token--> Authenticated --transport closed--> Lost --grace expired--> (offline)
//!   |                    |                               |
//!   +--closed--> gone    +--logout / ban--> (offline)    +--re-authenticated--> Authenticated
//! ```
//!
//! The [`ConnectionRegistryHandle`] is the only way in. It is created once
//! per process and passed to the transport endpoint.

pub mod actions;
pub mod messages;
pub mod registry;
pub mod state;

pub use messages::{OutboundFrame, RegistryStatus, TransportEvent, KEEPALIVE_FRAME};
pub use registry::{ConnectionRegistryHandle, RegistryContext};
pub use state::ConnectionState;
