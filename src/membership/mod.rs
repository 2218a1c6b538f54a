//! Cluster Membership
//!
//! UDP gossip (SWIM-like) node discovery and failure detection.
//!
//! ## Role in the session store
//! - **Placement** asks for the set of alive nodes when activating a
//!   session actor.
//! - **Session actors** ask whether their replication partner's node is
//!   dead before trusting a cached Location Hint.
//! - **Internode transport** resolves node ids to HTTP addresses.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
