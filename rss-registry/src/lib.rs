//! Cluster membership and leader election for the Remote Shuffle Service.
//!
//! `CoordinationClient` is the narrow gossip-shaped contract the rest of
//! this crate needs from the coordination layer; `GossipCoordinationClient`
//! is its reference implementation over `chitchat`. `Registry` builds
//! Worker membership and Master leader election on top of either one.

pub mod coordination;
pub mod registry;

pub use coordination::{CoordinationClient, GossipCoordinationClient, NodeSnapshot};
pub use registry::{MasterLocation, Registry};
