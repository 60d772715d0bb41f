//! # Booth Test Utilities
//!
//! Fixtures for running one or more booth instances in-process, on top of
//! the in-memory store, bus and directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use booth_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let infra = TestInfra::new();
//!     infra.add_participant("alice", &[("track-1", 180)]);
//!
//!     let instance = infra.instance("booth-1");
//!     let mut alice = instance.login("alice").await;
//!     alice.send("vote", serde_json::json!(1)).await;
//! }
//! ```
//!
//! Two instances built from the same [`TestInfra`] share state and bus
//! traffic exactly as two processes sharing one Redis would.

pub mod fixtures;

pub use fixtures::*;
