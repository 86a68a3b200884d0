//! Lockstep Hub
//!
//! Rendezvous and sum-reduction point for a group of replicas. The hub holds
//! no run state beyond the current group and forgets it once every member
//! has disconnected.

pub mod hub;

pub use hub::ReductionHub;
