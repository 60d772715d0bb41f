//! Cross-process event bus.
//!
//! Every state change is published here and every instance (including the
//! publisher) fans it out to its own connections. Two channels share one
//! JSON envelope:
//!
//! - `broadcast`: a [`WireMessage`] sent verbatim to every live connection
//! - `action`: a named [`ServerAction`] that each registry turns into the
//!   right broadcast or targeted send

pub mod local;

pub use local::LocalBus;

use crate::directory::PlaylistItem;
use crate::errors::BoothError;
use async_trait::async_trait;
use common::types::HistoryId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// `{command, data}` frame exchanged with clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub command: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WireMessage {
    pub fn new(command: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    /// Text frame for the transport.
    ///
    /// # Errors
    ///
    /// `Serialization` if encoding fails.
    pub fn to_frame(&self) -> Result<String, BoothError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What a newly started play looks like on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayPayload {
    #[serde(rename = "historyID")]
    pub history_id: HistoryId,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "playlistID")]
    pub playlist_id: String,
    pub media: PlaylistItem,
    /// Milliseconds since the Unix epoch.
    pub played_at: i64,
}

/// Named structured actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all_fields = "camelCase")]
pub enum ServerAction {
    #[serde(rename = "advance:complete")]
    AdvanceComplete(Option<PlayPayload>),

    #[serde(rename = "waitlist:join")]
    WaitlistJoin {
        #[serde(rename = "userID")]
        user_id: String,
        waitlist: Vec<String>,
    },

    #[serde(rename = "waitlist:leave")]
    WaitlistLeave {
        #[serde(rename = "userID")]
        user_id: String,
        waitlist: Vec<String>,
    },

    #[serde(rename = "waitlist:add")]
    WaitlistAdd {
        #[serde(rename = "userID")]
        user_id: String,
        #[serde(rename = "moderatorID")]
        moderator_id: String,
        position: usize,
        waitlist: Vec<String>,
    },

    #[serde(rename = "waitlist:remove")]
    WaitlistRemove {
        #[serde(rename = "userID")]
        user_id: String,
        #[serde(rename = "moderatorID")]
        moderator_id: String,
        waitlist: Vec<String>,
    },

    #[serde(rename = "waitlist:move")]
    WaitlistMove {
        #[serde(rename = "userID")]
        user_id: String,
        #[serde(rename = "moderatorID")]
        moderator_id: String,
        position: usize,
        waitlist: Vec<String>,
    },

    #[serde(rename = "waitlist:clear")]
    WaitlistClear {
        #[serde(rename = "moderatorID")]
        moderator_id: String,
    },

    #[serde(rename = "waitlist:lock")]
    WaitlistLock {
        #[serde(rename = "moderatorID")]
        moderator_id: String,
        locked: bool,
    },

    #[serde(rename = "waitlist:update")]
    WaitlistUpdate { waitlist: Vec<String> },

    #[serde(rename = "booth:vote")]
    Vote {
        #[serde(rename = "userID")]
        user_id: String,
        direction: i8,
    },

    #[serde(rename = "booth:favorite")]
    Favorite {
        #[serde(rename = "userID")]
        user_id: String,
        #[serde(rename = "historyID")]
        history_id: HistoryId,
    },

    #[serde(rename = "chat:message")]
    ChatMessage {
        id: String,
        #[serde(rename = "userID")]
        user_id: String,
        message: String,
        timestamp: i64,
    },

    #[serde(rename = "user:join")]
    UserJoin {
        #[serde(rename = "userID")]
        user_id: String,
    },

    #[serde(rename = "user:leave")]
    UserLeave {
        #[serde(rename = "userID")]
        user_id: String,
    },

    #[serde(rename = "user:ban")]
    UserBan {
        #[serde(rename = "userID")]
        user_id: String,
        #[serde(rename = "moderatorID")]
        moderator_id: String,
    },

    /// A participant resumed on `instance_id`; whoever holds its lost
    /// session elsewhere drops it silently.
    #[serde(rename = "session:resumed")]
    SessionResumed {
        #[serde(rename = "userID")]
        user_id: String,
        #[serde(rename = "instanceID")]
        instance_id: String,
    },

    #[serde(rename = "guests:count")]
    GuestCount { count: u64 },

    /// Sent only to the performer whose playlist was rotated.
    #[serde(rename = "playlist:cycle")]
    PlaylistCycle {
        #[serde(rename = "userID")]
        user_id: String,
        #[serde(rename = "playlistID")]
        playlist_id: String,
    },
}

/// Envelope carried on the shared channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload", rename_all = "snake_case")]
pub enum BusMessage {
    Broadcast(WireMessage),
    Action(ServerAction),
}

impl BusMessage {
    /// Bounded metric label.
    #[must_use]
    pub fn channel(&self) -> &'static str {
        match self {
            BusMessage::Broadcast(_) => "broadcast",
            BusMessage::Action(_) => "action",
        }
    }
}

/// Publish/subscribe across all booth instances.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), BoothError>;

    /// Receive everything published after this call, including own messages.
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;

    async fn publish_action(&self, action: ServerAction) -> Result<(), BoothError> {
        self.publish(BusMessage::Action(action)).await
    }

    async fn publish_broadcast(&self, message: WireMessage) -> Result<(), BoothError> {
        self.publish(BusMessage::Broadcast(message)).await
    }
}
