//! Shuffle Worker: the per-node data server component of the Remote Shuffle
//! Service. Buffers blocks in memory, dumps them to DFS, and answers the
//! control/data tonic services the Client writes and reads through.

pub mod memory;
pub mod server;
pub mod storage;
pub mod token_bucket;

pub use server::{ShuffleWorkerControlService, ShuffleWorkerDataService};
pub use storage::Storage;
