//! The durable log store: segmented append-only files with CRC framing, a
//! write/force pipeline driven by fibers, an index store mapping log index
//! to byte position, crash recovery, and the CRC-protected status file.

pub mod appender;
pub mod frame;
pub mod index;
pub mod log;
pub mod restorer;
pub mod segment;
pub mod status;

pub use appender::{AppendCallback, LogAppender, WaitWriteFinished};
pub use index::{IdxFlushFiber, IdxOps};
pub use log::RaftLog;
pub use status::{StatusFile, StatusManager, StatusPersistFiber, StatusValues};

use std::path::PathBuf;
use std::time::Duration;

/// Store tuning knobs, shared by the per-group components.
#[derive(Clone)]
pub struct StoreOptions {
    /// The group data directory; log/ and idx/ segments live under it.
    pub dir: PathBuf,
    /// Log segment size. Must be a power of two.
    pub segment_size: u64,
    /// Index segment size. Must be a power of two.
    pub index_segment_size: u64,
    /// The largest single write buffer the appender encodes before
    /// submitting.
    pub max_write_buffer: usize,
    /// The IO retry backoff vector. Log writes retry indefinitely, clamped
    /// to the last interval; forces fail the group once it is exhausted.
    pub io_retry_interval: Vec<Duration>,
}

impl StoreOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: 64 * 1024 * 1024,
            index_segment_size: 1024 * 1024,
            max_write_buffer: 1024 * 1024,
            io_retry_interval: vec![
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ],
        }
    }
}
