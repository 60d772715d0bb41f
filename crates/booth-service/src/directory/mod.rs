//! Participant and playlist lookups.
//!
//! Accounts, roles, playlists and moderation records are owned elsewhere.
//! The booth only needs the narrow view in [`UserDirectory`]: who a
//! participant is, what they may do, and what they would play next.

pub mod memory;

pub use memory::MemoryDirectory;

use crate::errors::BoothError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capabilities checked by waitlist and booth operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "waitlist.join")]
    WaitlistJoin,
    /// Join even while the waitlist is locked.
    #[serde(rename = "waitlist.join.locked")]
    WaitlistJoinLocked,
    #[serde(rename = "waitlist.add")]
    WaitlistAdd,
    #[serde(rename = "waitlist.move")]
    WaitlistMove,
    #[serde(rename = "waitlist.remove")]
    WaitlistRemove,
    #[serde(rename = "waitlist.clear")]
    WaitlistClear,
    #[serde(rename = "waitlist.lock")]
    WaitlistLock,
    #[serde(rename = "booth.skip.other")]
    BoothSkipOther,
    #[serde(rename = "chat.send")]
    ChatSend,
}

impl Permission {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::WaitlistJoin => "waitlist.join",
            Permission::WaitlistJoinLocked => "waitlist.join.locked",
            Permission::WaitlistAdd => "waitlist.add",
            Permission::WaitlistMove => "waitlist.move",
            Permission::WaitlistRemove => "waitlist.remove",
            Permission::WaitlistClear => "waitlist.clear",
            Permission::WaitlistLock => "waitlist.lock",
            Permission::BoothSkipOther => "booth.skip.other",
            Permission::ChatSend => "chat.send",
        }
    }
}

/// A participant as seen by the booth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub active_playlist: Option<String>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub muted: bool,
}

impl UserRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            permissions: BTreeSet::new(),
            active_playlist: None,
            banned: false,
            muted: false,
        }
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    #[must_use]
    pub fn with_playlist(mut self, playlist_id: impl Into<String>) -> Self {
        self.active_playlist = Some(playlist_id.into());
        self
    }

    #[must_use]
    pub fn can(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// One playable entry. `start` and `end` are offsets into the media in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub id: String,
    pub artist: String,
    pub title: String,
    pub start: u64,
    pub end: u64,
}

impl PlaylistItem {
    /// Play time in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Read access to accounts and playlists, plus the one playlist write the
/// booth performs (cycling the played item to the back).
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, BoothError>;

    /// Unknown users have no permissions.
    async fn can(&self, user_id: &str, permission: Permission) -> Result<bool, BoothError> {
        Ok(self
            .get_user(user_id)
            .await?
            .is_some_and(|u| u.can(permission)))
    }

    async fn active_playlist(&self, user_id: &str) -> Result<Option<String>, BoothError> {
        Ok(self
            .get_user(user_id)
            .await?
            .and_then(|u| u.active_playlist))
    }

    async fn playlist_item_at(
        &self,
        playlist_id: &str,
        index: usize,
    ) -> Result<Option<PlaylistItem>, BoothError>;

    /// Move the first item to the tail.
    async fn cycle_playlist(&self, playlist_id: &str) -> Result<(), BoothError>;

    async fn is_banned(&self, user_id: &str) -> Result<bool, BoothError> {
        Ok(self.get_user(user_id).await?.is_some_and(|u| u.banned))
    }

    async fn is_muted(&self, user_id: &str) -> Result<bool, BoothError> {
        Ok(self.get_user(user_id).await?.is_some_and(|u| u.muted))
    }
}

/// The playlist and item a participant would play right now, if any.
///
/// A zero-length head item counts as nothing to play; its play timer would
/// fire immediately and spin the rotation.
pub async fn next_play(
    directory: &dyn UserDirectory,
    user_id: &str,
) -> Result<Option<(String, PlaylistItem)>, BoothError> {
    let Some(playlist_id) = directory.active_playlist(user_id).await? else {
        return Ok(None);
    };
    Ok(directory
        .playlist_item_at(&playlist_id, 0)
        .await?
        .filter(|item| item.duration_secs() > 0)
        .map(|item| (playlist_id, item)))
}
