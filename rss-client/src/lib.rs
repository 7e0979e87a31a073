//! Client library embedded in the host compute engine: Shuffle Handle
//! construction, Writer, Reader, and Stage Finalizer.

pub mod finalizer;
pub mod handle;
pub mod reader;
pub mod writer;

pub use finalizer::{delete_stale_markers, finalize_stage};
pub use handle::build_handle;
pub use reader::{await_stage_ready, read_partition_range, PartitionRead};
pub use writer::{select_strategy, ShuffleRecord, ShuffleWriter, WriterStrategyKind};
