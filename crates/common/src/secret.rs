//! Secret types for values that must never reach a log line.
//!
//! Re-exports [`secrecy`] so every crate in the workspace wraps credentials
//! the same way. The Redis URL is the main customer: it routinely embeds a
//! password (`redis://:password@host:6379`).
//!
//! `SecretString` implements `Debug` with redaction, so deriving `Debug` on a
//! config struct holding one stays safe. Reading the value requires an
//! explicit `expose_secret()` call, which keeps accesses easy to audit.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@cache:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert_eq!(url.expose_secret(), "redis://:hunter2@cache:6379");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
