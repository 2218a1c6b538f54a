//! Write-Behind Pipeline
//!
//! Batches session-existence and deletion facts from actors into the
//! durable existence table, off the hot read/write path.
//!
//! ## Core Concepts
//! - **Micro-batching**: events collect until a size threshold or a time
//!   window is hit, whichever comes first.
//! - **At-most-once**: a failing flush is logged and dropped; only
//!   existence is tracked here, content durability belongs to replication.
//! - **Callback**: deletion batches can notify an external URL,
//!   fire-and-forget.

pub mod batcher;
pub mod pipeline;
pub mod store;

#[cfg(test)]
mod tests;
