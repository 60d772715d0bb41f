//! Shared state store.
//!
//! Every piece of booth state that must be visible to all instances lives
//! behind [`StateStore`]: the waitlist, booth keys, history, handshake tokens,
//! lost-session queues and presence. Two implementations exist:
//!
//! - [`crate::redis::RedisStore`] for deployments
//! - [`MemoryStore`] for tests and single-node use
//!
//! # Key Patterns
//!
//! - `waitlist` - ordered participant IDs (LIST)
//! - `waitlist:lock` - `"1"` when locked (STRING)
//! - `booth:currentDJ`, `booth:historyID` - active play (STRING)
//! - `booth:upvotes`, `booth:downvotes`, `booth:favorites` - tallies (SET)
//! - `booth:advancing` - advance lease (STRING with TTL)
//! - `history:{id}` - JSON history record, `history:recent` - newest ids (LIST)
//! - `auth:socket:{token}` - handshake token to participant (STRING with TTL)
//! - `sessions:lost:{user}` - lost marker, `sessions:queue:{user}` - buffer (LIST)
//! - `users:online` (SET), `sessions:owner` (HASH)
//! - `guests:count:{instance}` - one instance's guests (STRING with TTL),
//!   `guests:instances` - reporting instances (SET), `guests:total` - last
//!   published total (STRING)

pub mod lease;
pub mod memory;

pub use lease::DistributedLock;
pub use memory::MemoryStore;

use crate::errors::BoothError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Store key names.
pub mod keys {
    pub const WAITLIST: &str = "waitlist";
    pub const WAITLIST_LOCK: &str = "waitlist:lock";
    pub const CURRENT_DJ: &str = "booth:currentDJ";
    pub const HISTORY_ID: &str = "booth:historyID";
    pub const UPVOTES: &str = "booth:upvotes";
    pub const DOWNVOTES: &str = "booth:downvotes";
    pub const FAVORITES: &str = "booth:favorites";
    pub const ADVANCE_LEASE: &str = "booth:advancing";
    pub const RECENT_HISTORY: &str = "history:recent";
    pub const ONLINE_USERS: &str = "users:online";
    pub const SESSION_OWNERS: &str = "sessions:owner";
    pub const GUEST_INSTANCES: &str = "guests:instances";
    pub const GUEST_TOTAL: &str = "guests:total";

    #[must_use]
    pub fn guest_count(instance_id: &str) -> String {
        format!("guests:count:{instance_id}")
    }

    #[must_use]
    pub fn history(id: &str) -> String {
        format!("history:{id}")
    }

    #[must_use]
    pub fn auth_token(token: &str) -> String {
        format!("auth:socket:{token}")
    }

    #[must_use]
    pub fn lost_marker(user_id: &str) -> String {
        format!("sessions:lost:{user_id}")
    }

    #[must_use]
    pub fn lost_queue(user_id: &str) -> String {
        format!("sessions:queue:{user_id}")
    }
}

/// Where to insert relative to a pivot element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Before,
    After,
}

impl InsertPosition {
    /// Redis `LINSERT` keyword.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            InsertPosition::Before => "BEFORE",
            InsertPosition::After => "AFTER",
        }
    }
}

/// One write inside an [`StateStore::atomic`] group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    ListPushBack {
        key: String,
        value: String,
    },
    ListPushFront {
        key: String,
        value: String,
    },
    /// Remove every occurrence of `value`.
    ListRemove {
        key: String,
        value: String,
    },
    ListInsert {
        key: String,
        position: InsertPosition,
        pivot: String,
        value: String,
    },
    /// Keep only the newest `keep` elements (the tail).
    ListKeepLast {
        key: String,
        keep: usize,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    HashSet {
        key: String,
        field: String,
        value: String,
    },
    HashDel {
        key: String,
        field: String,
    },
}

/// Precondition for writing into a session someone else may have taken.
///
/// Holds while field `user_id` of hash `owners_key` equals `owner` and
/// `marker_key` exists.
#[derive(Debug, Clone, Copy)]
pub struct OwnerGuard<'a> {
    pub owners_key: &'a str,
    pub user_id: &'a str,
    pub owner: &'a str,
    pub marker_key: &'a str,
}

/// Async access to the shared store.
///
/// Every method is one awaited round trip. Callers interleave only at these
/// suspension points, so multi-step updates that must not be observed
/// half-done go through [`StateStore::atomic`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BoothError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BoothError>;

    /// Read and delete in one step. The value is handed out at most once.
    async fn get_del(&self, key: &str) -> Result<Option<String>, BoothError>;

    /// Store `value` without a TTL and return the value it replaced.
    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>, BoothError>;

    async fn del(&self, key: &str) -> Result<(), BoothError>;

    /// Entire list, head first.
    async fn list_range(&self, key: &str) -> Result<Vec<String>, BoothError>;

    async fn list_len(&self, key: &str) -> Result<usize, BoothError>;

    async fn list_push_back(&self, key: &str, value: &str) -> Result<usize, BoothError>;

    async fn list_push_front(&self, key: &str, value: &str) -> Result<usize, BoothError>;

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, BoothError>;

    /// Remove all occurrences of `value`, returning how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, BoothError>;

    /// Insert next to `pivot`. Returns `None` when the pivot is absent.
    async fn list_insert(
        &self,
        key: &str,
        position: InsertPosition,
        pivot: &str,
        value: &str,
    ) -> Result<Option<usize>, BoothError>;

    /// Read the whole list and delete it atomically.
    async fn list_drain(&self, key: &str) -> Result<Vec<String>, BoothError>;

    /// Append, keep only the newest `cap` elements and refresh the TTL, all
    /// only while `guard` holds. Returns false when nothing was pushed.
    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
        guard: &OwnerGuard<'_>,
    ) -> Result<bool, BoothError>;

    /// Returns true when the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BoothError>;

    /// Returns true when the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BoothError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BoothError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BoothError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BoothError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BoothError>;

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BoothError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BoothError>;

    /// Apply all ops as one transaction.
    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<(), BoothError>;

    /// Set `key` to `owner` only if absent. Returns true when acquired.
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, BoothError>;

    /// Refresh the TTL if `owner` still holds the lease.
    async fn extend_lease(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, BoothError>;

    /// Delete the lease if `owner` still holds it.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, BoothError>;
}
