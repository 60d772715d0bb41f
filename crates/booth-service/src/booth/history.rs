//! Play history records.
//!
//! A record is written when a play starts and sealed with its final tallies
//! when the next advance supersedes it. Records live under `history:{id}`
//! and the newest ids are kept in `history:recent`.

use crate::directory::PlaylistItem;
use crate::errors::BoothError;
use crate::store::{keys, StateStore, StoreOp};
use common::types::HistoryId;
use serde::{Deserialize, Serialize};

/// Number of history ids kept in `history:recent`.
pub const RECENT_HISTORY_CAPACITY: usize = 100;

/// Final vote and favorite tallies of a finished play.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tallies {
    pub upvotes: Vec<String>,
    pub downvotes: Vec<String>,
    pub favorites: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: HistoryId,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "playlistID")]
    pub playlist_id: String,
    pub media: PlaylistItem,
    /// Milliseconds since the Unix epoch.
    pub played_at: i64,
    /// Present once the play has been superseded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tallies: Option<Tallies>,
}

impl HistoryRecord {
    /// Milliseconds of play time left at `now_ms`, zero if over.
    #[must_use]
    pub fn remaining_ms(&self, now_ms: i64) -> u64 {
        let total_ms = i64::try_from(self.media.duration_secs().saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let elapsed_ms = now_ms.saturating_sub(self.played_at).max(0);
        u64::try_from(total_ms.saturating_sub(elapsed_ms)).unwrap_or(0)
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.tallies.is_some()
    }

    /// Write op for inclusion in an atomic group.
    ///
    /// # Errors
    ///
    /// `Serialization` if the record cannot be encoded.
    pub fn store_op(&self) -> Result<StoreOp, BoothError> {
        Ok(StoreOp::Set {
            key: keys::history(&self.id.to_string()),
            value: serde_json::to_string(self)?,
            ttl: None,
        })
    }
}

/// Load one record. Missing and undecodable records both yield `None`.
pub async fn load(store: &dyn StateStore, id: &str) -> Result<Option<HistoryRecord>, BoothError> {
    let Some(raw) = store.get(&keys::history(id)).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            tracing::warn!(
                target: "booth.scheduler",
                history_id = %id,
                error = %e,
                "Ignoring undecodable history record"
            );
            Ok(None)
        }
    }
}

/// Newest first, at most `limit` records.
pub async fn recent(store: &dyn StateStore, limit: usize) -> Result<Vec<HistoryRecord>, BoothError> {
    let ids = store.list_range(keys::RECENT_HISTORY).await?;
    let mut records = Vec::with_capacity(limit.min(ids.len()));
    for id in ids.iter().rev().take(limit) {
        if let Some(record) = load(store, id).await? {
            records.push(record);
        }
    }
    Ok(records)
}
