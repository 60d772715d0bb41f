//! In-memory [`UserDirectory`].
//!
//! Used by tests, and by the binary when `BOOTH_DIRECTORY_SEED` points at a
//! JSON file of the form:
//!
//! ```json
//! {
//!   "users": [{ "id": "u1", "username": "ada", "permissions": ["waitlist.join"],
//!               "activePlaylist": "p1" }],
//!   "playlists": [{ "id": "p1", "items": [{ "id": "m1", "artist": "A",
//!                   "title": "T", "start": 0, "end": 215 }] }]
//! }
//! ```

use super::{PlaylistItem, UserDirectory, UserRecord};
use crate::errors::BoothError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    playlists: HashMap<String, VecDeque<PlaylistItem>>,
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    inner: RwLock<Inner>,
}

#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    playlists: Vec<SeedPlaylist>,
}

#[derive(Debug, Deserialize)]
struct SeedPlaylist {
    id: String,
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

fn poisoned() -> BoothError {
    BoothError::Internal("directory lock poisoned".to_string())
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON seed document.
    ///
    /// # Errors
    ///
    /// `Config` when the document does not parse.
    pub fn from_seed_json(json: &str) -> Result<Self, BoothError> {
        let seed: Seed = serde_json::from_str(json)
            .map_err(|e| BoothError::Config(format!("invalid directory seed: {e}")))?;
        let directory = Self::new();
        for playlist in seed.playlists {
            directory.put_playlist(&playlist.id, playlist.items)?;
        }
        for user in seed.users {
            directory.put_user(user)?;
        }
        Ok(directory)
    }

    /// Build from a JSON seed file.
    ///
    /// # Errors
    ///
    /// `Config` when the file cannot be read or parsed.
    pub fn from_seed_file(path: impl AsRef<Path>) -> Result<Self, BoothError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BoothError::Config(format!("cannot read directory seed {}: {e}", path.display()))
        })?;
        let directory = Self::from_seed_json(&json)?;
        info!(
            target: "booth.directory",
            path = %path.display(),
            "Directory seeded"
        );
        Ok(directory)
    }

    /// Insert or replace a user.
    pub fn put_user(&self, user: UserRecord) -> Result<(), BoothError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.users.insert(user.id.clone(), user);
        Ok(())
    }

    /// Insert or replace a playlist's items.
    pub fn put_playlist(
        &self,
        playlist_id: &str,
        items: impl IntoIterator<Item = PlaylistItem>,
    ) -> Result<(), BoothError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner
            .playlists
            .insert(playlist_id.to_string(), items.into_iter().collect());
        Ok(())
    }

    /// Apply a change to a stored user. Unknown users are ignored.
    pub fn update_user(
        &self,
        user_id: &str,
        change: impl FnOnce(&mut UserRecord),
    ) -> Result<(), BoothError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if let Some(user) = inner.users.get_mut(user_id) {
            change(user);
        }
        Ok(())
    }

    /// Current item order of a playlist.
    pub fn playlist_items(&self, playlist_id: &str) -> Result<Vec<PlaylistItem>, BoothError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .playlists
            .get(playlist_id)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, BoothError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.users.get(user_id).cloned())
    }

    async fn playlist_item_at(
        &self,
        playlist_id: &str,
        index: usize,
    ) -> Result<Option<PlaylistItem>, BoothError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .playlists
            .get(playlist_id)
            .and_then(|items| items.get(index))
            .cloned())
    }

    async fn cycle_playlist(&self, playlist_id: &str) -> Result<(), BoothError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if let Some(items) = inner.playlists.get_mut(playlist_id) {
            if let Some(first) = items.pop_front() {
                items.push_back(first);
            }
        }
        Ok(())
    }
}
