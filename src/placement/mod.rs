//! Actor Placement
//!
//! Decides which cluster node hosts a newly activated session actor.
//! The decision itself is the pure `place` function; `PlacementDirector`
//! only feeds it the current membership view, so every placement rule is
//! unit-testable without a runtime.

pub mod director;

pub use director::{PlacementDirector, PlacementRequest, place};
