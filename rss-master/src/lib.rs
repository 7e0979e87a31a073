//! Shuffle Master: the leader-elected allocator component of the Remote
//! Shuffle Service (§4.2).

pub mod allocator;
pub mod service;

pub use service::ShuffleMasterService;
