//! Turns structured bus actions into client messages.
//!
//! Every instance receives every action and runs it through [`route`]; the
//! result says whether to fan out, target one participant, or apply a local
//! effect.

use crate::bus::{ServerAction, WireMessage};
use serde_json::json;

/// Client command names.
pub mod commands {
    pub const ADVANCE: &str = "advance";
    pub const WAITLIST_JOIN: &str = "waitlistJoin";
    pub const WAITLIST_LEAVE: &str = "waitlistLeave";
    pub const WAITLIST_ADD: &str = "waitlistAdd";
    pub const WAITLIST_REMOVE: &str = "waitlistRemove";
    pub const WAITLIST_MOVE: &str = "waitlistMove";
    pub const WAITLIST_CLEAR: &str = "waitlistClear";
    pub const WAITLIST_LOCK: &str = "waitlistLock";
    pub const WAITLIST_UPDATE: &str = "waitlistUpdate";
    pub const VOTE: &str = "vote";
    pub const FAVORITE: &str = "favorite";
    pub const CHAT_MESSAGE: &str = "chatMessage";
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const BAN: &str = "ban";
    pub const GUESTS: &str = "guests";
    pub const PLAYLIST_CYCLE: &str = "playlistCycle";
    pub const ERROR: &str = "error";
    pub const AUTHENTICATED: &str = "authenticated";
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Broadcast(WireMessage),
    SendTo {
        user_id: String,
        message: WireMessage,
    },
    /// Close the participant's local connections and take them offline.
    Ban { user_id: String },
    /// Drop a Lost connection for `user_id` held here, unless the resume
    /// happened on this instance.
    SessionResumed {
        user_id: String,
        instance_id: String,
    },
}

fn broadcast(command: &str, data: serde_json::Value) -> Vec<Delivery> {
    vec![Delivery::Broadcast(WireMessage::new(command, data))]
}

#[must_use]
pub fn route(action: ServerAction) -> Vec<Delivery> {
    use commands as c;

    match action {
        ServerAction::AdvanceComplete(play) => broadcast(c::ADVANCE, json!(play)),
        ServerAction::WaitlistJoin { user_id, waitlist } => {
            broadcast(c::WAITLIST_JOIN, json!({ "userID": user_id, "waitlist": waitlist }))
        }
        ServerAction::WaitlistLeave { user_id, waitlist } => {
            broadcast(c::WAITLIST_LEAVE, json!({ "userID": user_id, "waitlist": waitlist }))
        }
        ServerAction::WaitlistAdd {
            user_id,
            moderator_id,
            position,
            waitlist,
        } => broadcast(
            c::WAITLIST_ADD,
            json!({
                "userID": user_id,
                "moderatorID": moderator_id,
                "position": position,
                "waitlist": waitlist,
            }),
        ),
        ServerAction::WaitlistRemove {
            user_id,
            moderator_id,
            waitlist,
        } => broadcast(
            c::WAITLIST_REMOVE,
            json!({ "userID": user_id, "moderatorID": moderator_id, "waitlist": waitlist }),
        ),
        ServerAction::WaitlistMove {
            user_id,
            moderator_id,
            position,
            waitlist,
        } => broadcast(
            c::WAITLIST_MOVE,
            json!({
                "userID": user_id,
                "moderatorID": moderator_id,
                "position": position,
                "waitlist": waitlist,
            }),
        ),
        ServerAction::WaitlistClear { moderator_id } => {
            broadcast(c::WAITLIST_CLEAR, json!({ "moderatorID": moderator_id }))
        }
        ServerAction::WaitlistLock {
            moderator_id,
            locked,
        } => broadcast(
            c::WAITLIST_LOCK,
            json!({ "moderatorID": moderator_id, "locked": locked }),
        ),
        ServerAction::WaitlistUpdate { waitlist } => broadcast(c::WAITLIST_UPDATE, json!(waitlist)),
        ServerAction::Vote { user_id, direction } => {
            broadcast(c::VOTE, json!({ "userID": user_id, "value": direction }))
        }
        ServerAction::Favorite {
            user_id,
            history_id,
        } => broadcast(
            c::FAVORITE,
            json!({ "userID": user_id, "historyID": history_id }),
        ),
        ServerAction::ChatMessage {
            id,
            user_id,
            message,
            timestamp,
        } => broadcast(
            c::CHAT_MESSAGE,
            json!({ "id": id, "userID": user_id, "message": message, "timestamp": timestamp }),
        ),
        ServerAction::UserJoin { user_id } => broadcast(c::JOIN, json!({ "userID": user_id })),
        ServerAction::UserLeave { user_id } => broadcast(c::LEAVE, json!({ "userID": user_id })),
        ServerAction::UserBan {
            user_id,
            moderator_id,
        } => vec![
            Delivery::Broadcast(WireMessage::new(
                c::BAN,
                json!({ "userID": user_id, "moderatorID": moderator_id }),
            )),
            Delivery::Ban { user_id },
        ],
        ServerAction::SessionResumed {
            user_id,
            instance_id,
        } => vec![Delivery::SessionResumed {
            user_id,
            instance_id,
        }],
        ServerAction::GuestCount { count } => broadcast(c::GUESTS, json!(count)),
        ServerAction::PlaylistCycle {
            user_id,
            playlist_id,
        } => vec![Delivery::SendTo {
            user_id,
            message: WireMessage::new(c::PLAYLIST_CYCLE, json!({ "playlistID": playlist_id })),
        }],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_advance_broadcasts_null() {
        let deliveries = route(ServerAction::AdvanceComplete(None));
        assert_eq!(
            deliveries,
            [Delivery::Broadcast(WireMessage::new(
                commands::ADVANCE,
                serde_json::Value::Null
            ))]
        );
    }

    #[test]
    fn test_ban_broadcasts_then_applies_locally() {
        let deliveries = route(ServerAction::UserBan {
            user_id: "u1".to_string(),
            moderator_id: "m1".to_string(),
        });
        assert_eq!(deliveries.len(), 2);
        assert!(matches!(
            deliveries.first(),
            Some(Delivery::Broadcast(msg)) if msg.command == commands::BAN
        ));
        assert_eq!(
            deliveries.get(1),
            Some(&Delivery::Ban {
                user_id: "u1".to_string()
            })
        );
    }

    #[test]
    fn test_playlist_cycle_targets_performer() {
        let deliveries = route(ServerAction::PlaylistCycle {
            user_id: "u1".to_string(),
            playlist_id: "p1".to_string(),
        });
        assert_eq!(
            deliveries,
            [Delivery::SendTo {
                user_id: "u1".to_string(),
                message: WireMessage::new(
                    commands::PLAYLIST_CYCLE,
                    json!({ "playlistID": "p1" })
                ),
            }]
        );
    }

    #[test]
    fn test_vote_payload() {
        let deliveries = route(ServerAction::Vote {
            user_id: "u1".to_string(),
            direction: -1,
        });
        assert_eq!(
            deliveries,
            [Delivery::Broadcast(WireMessage::new(
                commands::VOTE,
                json!({ "userID": "u1", "value": -1 })
            ))]
        );
    }
}
