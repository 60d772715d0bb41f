//! Redis implementation of [`StateStore`].
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of sharing it behind a
//! lock.
//!
//! # Atomicity
//!
//! Read-and-delete and drain are `MULTI`/`EXEC` pipelines.
//! [`StateStore::atomic`] sends the whole op group as one transaction.
//! Lease extend/release and the guarded capped push run the owner-checked
//! scripts in [`super::lua_scripts`].

use crate::errors::BoothError;
use crate::observability::metrics::record_store_latency;
use crate::redis::lua_scripts;
use crate::store::{InsertPosition, OwnerGuard, StateStore, StoreOp};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, Pipeline, Script};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Redis store shared by every booth instance.
///
/// Cheaply cloneable; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    extend_lease_script: Script,
    release_lease_script: Script,
    push_if_owner_script: Script,
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `LTRIM` start index that keeps the newest `keep` elements.
fn keep_last_start(keep: usize) -> i64 {
    -i64::try_from(keep).unwrap_or(i64::MAX)
}

fn add_op(pipe: &mut Pipeline, op: &StoreOp) {
    match op {
        StoreOp::Set { key, value, ttl } => {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(*ttl));
            }
        }
        StoreOp::Del { key } => {
            pipe.cmd("DEL").arg(key);
        }
        StoreOp::ListPushBack { key, value } => {
            pipe.cmd("RPUSH").arg(key).arg(value);
        }
        StoreOp::ListPushFront { key, value } => {
            pipe.cmd("LPUSH").arg(key).arg(value);
        }
        StoreOp::ListRemove { key, value } => {
            pipe.cmd("LREM").arg(key).arg(0).arg(value);
        }
        StoreOp::ListInsert {
            key,
            position,
            pivot,
            value,
        } => {
            pipe.cmd("LINSERT")
                .arg(key)
                .arg(position.as_str())
                .arg(pivot)
                .arg(value);
        }
        StoreOp::ListKeepLast { key, keep } => {
            if *keep == 0 {
                pipe.cmd("DEL").arg(key);
            } else {
                pipe.cmd("LTRIM").arg(key).arg(keep_last_start(*keep)).arg(-1);
            }
        }
        StoreOp::SetAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member);
        }
        StoreOp::SetRemove { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member);
        }
        StoreOp::HashSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value);
        }
        StoreOp::HashDel { key, field } => {
            pipe.cmd("HDEL").arg(key).arg(field);
        }
    }
    pipe.ignore();
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `BoothError::Store` if the URL is invalid or the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, BoothError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may contain credentials
            error!(target: "booth.redis", error = %e, "Failed to open Redis client");
            BoothError::Store(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "booth.redis", error = %e, "Failed to connect to Redis");
                BoothError::Store(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            extend_lease_script: Script::new(lua_scripts::EXTEND_LEASE),
            release_lease_script: Script::new(lua_scripts::RELEASE_LEASE),
            push_if_owner_script: Script::new(lua_scripts::PUSH_IF_OWNER),
        })
    }

    fn failed(operation: &'static str, e: &redis::RedisError) -> BoothError {
        warn!(target: "booth.redis", operation, error = %e, "Store operation failed");
        BoothError::Store(format!("{operation} failed: {e}"))
    }

    async fn run<T: FromRedisValue>(&self, operation: &'static str, cmd: Cmd) -> Result<T, BoothError> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result = cmd.query_async(&mut conn).await;
        record_store_latency(operation, started.elapsed());
        result.map_err(|e| Self::failed(operation, &e))
    }

    async fn run_pipe<T: FromRedisValue>(
        &self,
        operation: &'static str,
        pipe: Pipeline,
    ) -> Result<T, BoothError> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result = pipe.query_async(&mut conn).await;
        record_store_latency(operation, started.elapsed());
        result.map_err(|e| Self::failed(operation, &e))
    }

    async fn run_script(
        &self,
        operation: &'static str,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<i64, BoothError> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let result = invocation.invoke_async(&mut conn).await;
        record_store_latency(operation, started.elapsed());
        result.map_err(|e| Self::failed(operation, &e))
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoothError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("get", cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BoothError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.run("set", cmd).await
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, BoothError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("GET")
            .arg(key)
            .cmd("DEL")
            .arg(key)
            .ignore();
        let (value,): (Option<String>,) = self.run_pipe("get_del", pipe).await?;
        Ok(value)
    }

    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>, BoothError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("GET");
        self.run("get_set", cmd).await
    }

    async fn del(&self, key: &str) -> Result<(), BoothError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run("del", cmd).await
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, BoothError> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(0).arg(-1);
        self.run("list_range", cmd).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, BoothError> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.run("list_len", cmd).await
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<usize, BoothError> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        self.run("list_push_back", cmd).await
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<usize, BoothError> {
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key).arg(value);
        self.run("list_push_front", cmd).await
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, BoothError> {
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(key);
        self.run("list_pop_front", cmd).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, BoothError> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(key).arg(0).arg(value);
        self.run("list_remove", cmd).await
    }

    async fn list_insert(
        &self,
        key: &str,
        position: InsertPosition,
        pivot: &str,
        value: &str,
    ) -> Result<Option<usize>, BoothError> {
        let mut cmd = redis::cmd("LINSERT");
        cmd.arg(key).arg(position.as_str()).arg(pivot).arg(value);
        // -1: pivot missing, 0: key missing
        let len: i64 = self.run("list_insert", cmd).await?;
        Ok(usize::try_from(len).ok().filter(|n| *n > 0))
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<String>, BoothError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(key)
            .ignore();
        let (items,): (Vec<String>,) = self.run_pipe("list_drain", pipe).await?;
        Ok(items)
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
        guard: &OwnerGuard<'_>,
    ) -> Result<bool, BoothError> {
        let args = [
            guard.owner.to_string(),
            guard.user_id.to_string(),
            value.to_string(),
            cap.max(1).to_string(),
            ttl_millis(ttl).to_string(),
        ];
        let pushed = self
            .run_script(
                "list_push_capped",
                &self.push_if_owner_script,
                &[key, guard.owners_key, guard.marker_key],
                &args,
            )
            .await?;
        Ok(pushed == 1)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BoothError> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let added: usize = self.run("set_add", cmd).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BoothError> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let removed: usize = self.run("set_remove", cmd).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BoothError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.run("set_members", cmd).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BoothError> {
        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(key).arg(member);
        self.run("set_contains", cmd).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BoothError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        self.run("hash_set", cmd).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BoothError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.run("hash_get", cmd).await
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BoothError> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(field);
        self.run("hash_del", cmd).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BoothError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run("hash_get_all", cmd).await
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<(), BoothError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            add_op(&mut pipe, op);
        }
        self.run_pipe("atomic", pipe).await
    }

    async fn acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BoothError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl));
        let reply: Option<String> = self.run("acquire_lease", cmd).await?;
        Ok(reply.is_some())
    }

    async fn extend_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BoothError> {
        let args = [owner.to_string(), ttl_millis(ttl).to_string()];
        let result = self
            .run_script("extend_lease", &self.extend_lease_script, &[key], &args)
            .await?;
        Ok(result == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, BoothError> {
        let args = [owner.to_string()];
        let result = self
            .run_script("release_lease", &self.release_lease_script, &[key], &args)
            .await?;
        Ok(result == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_keep_last_start_is_negative_count() {
        assert_eq!(keep_last_start(100), -100);
    }

    #[test]
    fn test_atomic_ops_are_all_ignored_in_pipeline() {
        let mut pipe = redis::pipe();
        pipe.atomic();
        add_op(
            &mut pipe,
            &StoreOp::Set {
                key: "booth:currentDJ".to_string(),
                value: "u1".to_string(),
                ttl: Some(Duration::from_secs(1)),
            },
        );
        add_op(
            &mut pipe,
            &StoreOp::ListRemove {
                key: "waitlist".to_string(),
                value: "u1".to_string(),
            },
        );
        let packed = String::from_utf8_lossy(&pipe.get_packed_pipeline()).to_string();
        assert!(packed.contains("MULTI"));
        assert!(packed.contains("PX"));
        assert!(packed.contains("LREM"));
    }
}
