//! Booth Service Library
//!
//! A rotating performer slot shared by many connected clients:
//!
//! - a waitlist of participants waiting for their turn
//! - a single booth whose play ends on a timer, then advances to the next
//!   performer under a cluster-wide lease
//! - a realtime connection layer that keeps every client's view consistent,
//!   across reconnects and across service instances
//!
//! # Architecture
//!
//! ```text
//! client frames --> ConnectionRegistry --> WaitlistQueue / BoothScheduler
//!                        ^                          |
//!                        |                    StateStore (Redis)
//!                        |                          |
//!                        +------ EventBus <---------+
//!                         (every instance fans out what any instance publishes)
//! ```
//!
//! Instances share nothing in memory. All coordination goes through the
//! [`store::StateStore`] and the [`bus::EventBus`]; both have Redis
//! implementations in [`redis`] and in-process ones for tests.
//!
//! # Modules
//!
//! - [`auth`] - Single-use handshake tokens
//! - [`booth`] - Booth state machine, play timer and history
//! - [`waitlist`] - Ordered participant queue
//! - [`connections`] - Guest / Authenticated / Lost connection registry
//! - [`directory`] - Users, permissions and playlists (external collaborator)
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client error codes

pub mod auth;
pub mod booth;
pub mod bus;
pub mod config;
pub mod connections;
pub mod directory;
pub mod errors;
pub mod observability;
pub mod redis;
pub mod server;
pub mod store;
pub mod waitlist;
