//! In-process [`StateStore`].
//!
//! Mirrors the Redis semantics the booth relies on: empty collections
//! disappear, wrong-type access fails, and TTLs run on the tokio clock so
//! paused-time tests can expire keys deterministically. Several registries
//! sharing one `MemoryStore` behave like several processes sharing Redis.

use super::{InsertPosition, OwnerGuard, StateStore, StoreOp};
use crate::errors::BoothError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::Hash(h) => h.is_empty(),
        }
    }
}

fn as_list(value: &mut Value) -> Option<&mut VecDeque<String>> {
    match value {
        Value::List(l) => Some(l),
        _ => None,
    }
}

fn as_set(value: &mut Value) -> Option<&mut BTreeSet<String>> {
    match value {
        Value::Set(s) => Some(s),
        _ => None,
    }
}

fn as_hash(value: &mut Value) -> Option<&mut HashMap<String, String>> {
    match value {
        Value::Hash(h) => Some(h),
        _ => None,
    }
}

fn new_list() -> Value {
    Value::List(VecDeque::new())
}

fn new_set() -> Value {
    Value::Set(BTreeSet::new())
}

fn new_hash() -> Value {
    Value::Hash(HashMap::new())
}

fn wrong_type(key: &str) -> BoothError {
    BoothError::Store(format!("WRONGTYPE operation against key {key}"))
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default, Clone)]
struct Inner {
    entries: HashMap<String, Entry>,
}

impl Inner {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Typed access to a collection, optionally creating it.
    fn slot<T>(
        &mut self,
        key: &str,
        now: Instant,
        create: Option<fn() -> Value>,
        pick: fn(&mut Value) -> Option<&mut T>,
    ) -> Result<Option<&mut T>, BoothError> {
        if self.live(key, now).is_none() {
            let Some(make) = create else {
                return Ok(None);
            };
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: make(),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(entry) => pick(&mut entry.value).map(Some).ok_or_else(|| wrong_type(key)),
            None => Ok(None),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.value.is_empty_collection())
        {
            self.entries.remove(key);
        }
    }

    fn string(&mut self, key: &str, now: Instant) -> Result<Option<String>, BoothError> {
        match self.live(key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_string(&mut self, key: &str, value: &str, ttl: Option<Duration>, now: Instant) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| now + t),
            },
        );
    }

    fn list_snapshot(&mut self, key: &str, now: Instant) -> Result<Vec<String>, BoothError> {
        Ok(self
            .slot(key, now, None, as_list)?
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn push(&mut self, key: &str, value: &str, front: bool, now: Instant) -> Result<usize, BoothError> {
        let list = self
            .slot(key, now, Some(new_list), as_list)?
            .ok_or_else(|| wrong_type(key))?;
        if front {
            list.push_front(value.to_string());
        } else {
            list.push_back(value.to_string());
        }
        Ok(list.len())
    }

    fn remove_all(&mut self, key: &str, value: &str, now: Instant) -> Result<usize, BoothError> {
        let removed = match self.slot(key, now, None, as_list)? {
            Some(list) => {
                let before = list.len();
                list.retain(|v| v != value);
                before - list.len()
            }
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn insert(
        &mut self,
        key: &str,
        position: InsertPosition,
        pivot: &str,
        value: &str,
        now: Instant,
    ) -> Result<Option<usize>, BoothError> {
        let Some(list) = self.slot(key, now, None, as_list)? else {
            return Ok(None);
        };
        let Some(index) = list.iter().position(|v| v == pivot) else {
            return Ok(None);
        };
        let at = match position {
            InsertPosition::Before => index,
            InsertPosition::After => index + 1,
        };
        list.insert(at, value.to_string());
        Ok(Some(list.len()))
    }

    fn keep_last(&mut self, key: &str, keep: usize, now: Instant) -> Result<(), BoothError> {
        if let Some(list) = self.slot(key, now, None, as_list)? {
            while list.len() > keep {
                list.pop_front();
            }
        }
        self.drop_if_empty(key);
        Ok(())
    }

    fn set_add(&mut self, key: &str, member: &str, now: Instant) -> Result<bool, BoothError> {
        let set = self
            .slot(key, now, Some(new_set), as_set)?
            .ok_or_else(|| wrong_type(key))?;
        Ok(set.insert(member.to_string()))
    }

    fn set_remove(&mut self, key: &str, member: &str, now: Instant) -> Result<bool, BoothError> {
        let removed = self
            .slot(key, now, None, as_set)?
            .is_some_and(|set| set.remove(member));
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn hash_set(&mut self, key: &str, field: &str, value: &str, now: Instant) -> Result<(), BoothError> {
        let hash = self
            .slot(key, now, Some(new_hash), as_hash)?
            .ok_or_else(|| wrong_type(key))?;
        hash.insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hash_del(&mut self, key: &str, field: &str, now: Instant) -> Result<(), BoothError> {
        if let Some(hash) = self.slot(key, now, None, as_hash)? {
            hash.remove(field);
        }
        self.drop_if_empty(key);
        Ok(())
    }

    fn apply(&mut self, op: StoreOp, now: Instant) -> Result<(), BoothError> {
        match op {
            StoreOp::Set { key, value, ttl } => self.set_string(&key, &value, ttl, now),
            StoreOp::Del { key } => {
                self.entries.remove(&key);
            }
            StoreOp::ListPushBack { key, value } => {
                self.push(&key, &value, false, now)?;
            }
            StoreOp::ListPushFront { key, value } => {
                self.push(&key, &value, true, now)?;
            }
            StoreOp::ListRemove { key, value } => {
                self.remove_all(&key, &value, now)?;
            }
            StoreOp::ListInsert {
                key,
                position,
                pivot,
                value,
            } => {
                self.insert(&key, position, &pivot, &value, now)?;
            }
            StoreOp::ListKeepLast { key, keep } => self.keep_last(&key, keep, now)?,
            StoreOp::SetAdd { key, member } => {
                self.set_add(&key, &member, now)?;
            }
            StoreOp::SetRemove { key, member } => {
                self.set_remove(&key, &member, now)?;
            }
            StoreOp::HashSet { key, field, value } => self.hash_set(&key, &field, &value, now)?,
            StoreOp::HashDel { key, field } => self.hash_del(&key, &field, now)?,
        }
        Ok(())
    }
}

/// Shared-nothing store living in this process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut Inner, Instant) -> Result<R, BoothError>,
    ) -> Result<R, BoothError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| BoothError::Internal("memory store lock poisoned".to_string()))?;
        f(&mut inner, Instant::now())
    }

    /// Remaining TTL of a key, if it has one.
    pub fn time_to_live(&self, key: &str) -> Result<Option<Duration>, BoothError> {
        self.with(|inner, now| {
            Ok(inner
                .live(key, now)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now)))
        })
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoothError> {
        self.with(|inner, now| inner.string(key, now))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BoothError> {
        self.with(|inner, now| {
            inner.set_string(key, value, ttl, now);
            Ok(())
        })
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, BoothError> {
        self.with(|inner, now| {
            let value = inner.string(key, now)?;
            inner.entries.remove(key);
            Ok(value)
        })
    }

    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>, BoothError> {
        self.with(|inner, now| {
            let previous = inner.string(key, now)?;
            inner.set_string(key, value, None, now);
            Ok(previous)
        })
    }

    async fn del(&self, key: &str) -> Result<(), BoothError> {
        self.with(|inner, _| {
            inner.entries.remove(key);
            Ok(())
        })
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, BoothError> {
        self.with(|inner, now| inner.list_snapshot(key, now))
    }

    async fn list_len(&self, key: &str) -> Result<usize, BoothError> {
        self.with(|inner, now| Ok(inner.slot(key, now, None, as_list)?.map_or(0, |l| l.len())))
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<usize, BoothError> {
        self.with(|inner, now| inner.push(key, value, false, now))
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<usize, BoothError> {
        self.with(|inner, now| inner.push(key, value, true, now))
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, BoothError> {
        self.with(|inner, now| {
            let popped = inner
                .slot(key, now, None, as_list)?
                .and_then(VecDeque::pop_front);
            inner.drop_if_empty(key);
            Ok(popped)
        })
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, BoothError> {
        self.with(|inner, now| inner.remove_all(key, value, now))
    }

    async fn list_insert(
        &self,
        key: &str,
        position: InsertPosition,
        pivot: &str,
        value: &str,
    ) -> Result<Option<usize>, BoothError> {
        self.with(|inner, now| inner.insert(key, position, pivot, value, now))
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<String>, BoothError> {
        self.with(|inner, now| {
            let items = inner.list_snapshot(key, now)?;
            inner.entries.remove(key);
            Ok(items)
        })
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
        guard: &OwnerGuard<'_>,
    ) -> Result<bool, BoothError> {
        self.with(|inner, now| {
            let owner = inner
                .slot(guard.owners_key, now, None, as_hash)?
                .and_then(|h| h.get(guard.user_id).cloned());
            if owner.as_deref() != Some(guard.owner) || inner.live(guard.marker_key, now).is_none() {
                return Ok(false);
            }
            inner.push(key, value, false, now)?;
            inner.keep_last(key, cap, now)?;
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.expires_at = Some(now + ttl);
            }
            Ok(true)
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BoothError> {
        self.with(|inner, now| inner.set_add(key, member, now))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BoothError> {
        self.with(|inner, now| inner.set_remove(key, member, now))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BoothError> {
        self.with(|inner, now| {
            Ok(inner
                .slot(key, now, None, as_set)?
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BoothError> {
        self.with(|inner, now| {
            Ok(inner
                .slot(key, now, None, as_set)?
                .is_some_and(|s| s.contains(member)))
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BoothError> {
        self.with(|inner, now| inner.hash_set(key, field, value, now))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BoothError> {
        self.with(|inner, now| {
            Ok(inner
                .slot(key, now, None, as_hash)?
                .and_then(|h| h.get(field).cloned()))
        })
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BoothError> {
        self.with(|inner, now| inner.hash_del(key, field, now))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BoothError> {
        self.with(|inner, now| {
            Ok(inner
                .slot(key, now, None, as_hash)?
                .cloned()
                .unwrap_or_default())
        })
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<(), BoothError> {
        self.with(|inner, now| {
            // Stage on a copy so a failing op leaves nothing half-applied.
            let mut staged = inner.clone();
            for op in ops {
                staged.apply(op, now)?;
            }
            *inner = staged;
            Ok(())
        })
    }

    async fn acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BoothError> {
        self.with(|inner, now| {
            if inner.live(key, now).is_some() {
                return Ok(false);
            }
            inner.set_string(key, owner, Some(ttl), now);
            Ok(true)
        })
    }

    async fn extend_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BoothError> {
        self.with(|inner, now| {
            if inner.string(key, now)?.as_deref() != Some(owner) {
                return Ok(false);
            }
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.expires_at = Some(now + ttl);
            }
            Ok(true)
        })
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, BoothError> {
        self.with(|inner, now| {
            if inner.string(key, now)?.as_deref() != Some(owner) {
                return Ok(false);
            }
            inner.entries.remove(key);
            Ok(true)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_insert_and_remove() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.list_push_back("l", id).await.unwrap();
        }

        let len = store
            .list_insert("l", InsertPosition::Before, "b", "x")
            .await
            .unwrap();
        assert_eq!(len, Some(4));
        assert_eq!(store.list_range("l").await.unwrap(), ["a", "x", "b", "c"]);

        let missing = store
            .list_insert("l", InsertPosition::After, "zz", "y")
            .await
            .unwrap();
        assert_eq!(missing, None);

        assert_eq!(store.list_remove("l", "x").await.unwrap(), 1);
        assert_eq!(store.list_range("l").await.unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_list_disappears() {
        let store = MemoryStore::new();
        store.list_push_back("l", "only").await.unwrap();
        store.list_remove("l", "only").await.unwrap();

        // The key is gone, so it can be reused as a different type.
        store.set("l", "now a string", None).await.unwrap();
        assert_eq!(store.get("l").await.unwrap().as_deref(), Some("now a string"));
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(matches!(
            store.list_push_back("k", "x").await,
            Err(BoothError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_get_del_hands_out_value_once() {
        let store = MemoryStore::new();
        store.set("token", "user-1", None).await.unwrap();

        assert_eq!(store.get_del("token").await.unwrap().as_deref(), Some("user-1"));
        assert_eq!(store.get_del("token").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_on_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set("short", "v", Some(Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("short").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("short").await.unwrap().is_none());
    }

    const GUARD: OwnerGuard<'static> = OwnerGuard {
        owners_key: "owners",
        user_id: "u1",
        owner: "node-a",
        marker_key: "lost:u1",
    };

    async fn hold_guard(store: &MemoryStore) {
        store.hash_set("owners", "u1", "node-a").await.unwrap();
        store.set("lost:u1", "{}", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_capped_keeps_newest() {
        let store = MemoryStore::new();
        hold_guard(&store).await;
        for i in 0..5 {
            let pushed = store
                .list_push_capped("q", &i.to_string(), 3, Duration::from_secs(30), &GUARD)
                .await
                .unwrap();
            assert!(pushed);
        }
        assert_eq!(store.list_range("q").await.unwrap(), ["2", "3", "4"]);
        assert!(store.time_to_live("q").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_push_capped_refused_once_owner_moves() {
        let store = MemoryStore::new();
        hold_guard(&store).await;
        store.hash_set("owners", "u1", "node-b").await.unwrap();

        let pushed = store
            .list_push_capped("q", "late", 3, Duration::from_secs(30), &GUARD)
            .await
            .unwrap();
        assert!(!pushed);
        assert!(store.list_range("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_capped_refused_without_marker() {
        let store = MemoryStore::new();
        hold_guard(&store).await;
        store.del("lost:u1").await.unwrap();

        let pushed = store
            .list_push_capped("q", "late", 3, Duration::from_secs(30), &GUARD)
            .await
            .unwrap();
        assert!(!pushed);
        assert_eq!(store.list_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_set_returns_replaced_value() {
        let store = MemoryStore::new();
        assert_eq!(store.get_set("total", "3").await.unwrap(), None);
        assert_eq!(store.get_set("total", "4").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.get("total").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_atomic_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.set("str", "v", None).await.unwrap();

        let result = store
            .atomic(vec![
                StoreOp::ListPushBack {
                    key: "list".to_string(),
                    value: "a".to_string(),
                },
                // Fails: "str" is a string.
                StoreOp::SetAdd {
                    key: "str".to_string(),
                    member: "m".to_string(),
                },
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(store.list_len("list").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_is_owner_checked() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(2000);

        assert!(store.acquire_lease("lease", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("lease", "b", ttl).await.unwrap());
        assert!(!store.extend_lease("lease", "b", ttl).await.unwrap());
        assert!(!store.release_lease("lease", "b").await.unwrap());

        assert!(store.extend_lease("lease", "a", ttl).await.unwrap());
        assert!(store.release_lease("lease", "a").await.unwrap());
        assert!(store.acquire_lease("lease", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(2001)).await;
        assert!(store.acquire_lease("lease", "c", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_and_set_operations() {
        let store = MemoryStore::new();
        store.hash_set("h", "a", "1").await.unwrap();
        store.hash_set("h", "b", "2").await.unwrap();
        store.hash_del("h", "a").await.unwrap();
        assert_eq!(store.hash_get("h", "b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.hash_get_all("h").await.unwrap().len(), 1);

        assert!(store.set_add("s", "x").await.unwrap());
        assert!(!store.set_add("s", "x").await.unwrap());
        assert!(store.set_contains("s", "x").await.unwrap());
        assert!(store.set_remove("s", "x").await.unwrap());
        assert!(store.set_members("s").await.unwrap().is_empty());
    }
}
