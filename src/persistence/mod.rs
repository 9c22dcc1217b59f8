//! Persistence Layer
//!
//! Durable buffering of deferred work:
//! - Priority-ordered buffer with per-type processors
//! - Atomic JSON snapshots for crash recovery

pub mod buffer;
pub mod entry;
pub mod processor;
pub mod snapshot;

pub use buffer::{BufferConfig, BufferMetrics, BufferStatus, BufferSystem};
pub use entry::{BufferEntry, BufferType, EntryStatus};
pub use processor::{CommandReplayProcessor, EntryProcessor, LoggingProcessor, ProcessResult};
pub use snapshot::{load_snapshot, save_snapshot, BufferSnapshot};
