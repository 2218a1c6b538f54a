//! Distributed Replicated Session Store
//!
//! This library crate defines the subsystems that make up one node of the
//! session cluster. It is the foundation for the binary executable
//! (`main.rs`).
//!
//! ## Architecture Modules
//! - **`session`**: the core replicated-actor protocol. One actor per
//!   (session id, replica slot) owns a versioned record, replicates from
//!   the primary slot to its partner, and expires with its TTL.
//! - **`placement`**: decides which cluster node hosts a newly activated
//!   actor instance (sticky slot-1 pinning, replica spreading).
//! - **`router`**: client-side slot resolution with a last-good-slot cache
//!   and transient-failure sweep across replica slots.
//! - **`membership`**: UDP gossip (SWIM-like) node discovery and failure
//!   detection backing placement and liveness checks.
//! - **`writebehind`**: asynchronous micro-batched persistence of session
//!   existence and deletion facts.
//! - **`liveness`**: process-local TTL markers of recent session activity.
//! - **`authz`**: the permission stub and its policy-cache refresher.

pub mod authz;
pub mod config;
pub mod error;
pub mod liveness;
pub mod membership;
pub mod placement;
pub mod router;
pub mod session;
pub mod writebehind;
