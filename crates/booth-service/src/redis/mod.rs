//! Redis-backed store and event bus.
//!
//! - [`RedisStore`] implements [`crate::store::StateStore`] over a
//!   multiplexed async connection, with atomic pipelines for grouped writes
//!   and Lua scripts for lease ownership checks.
//! - [`RedisEventBus`] implements [`crate::bus::EventBus`] with PUBLISH and a
//!   background SUBSCRIBE task that reconnects with back-off.
//!
//! Redis URLs may embed credentials and are never logged.

pub mod bus;
pub mod client;
pub mod lua_scripts;

pub use bus::RedisEventBus;
pub use client::RedisStore;
