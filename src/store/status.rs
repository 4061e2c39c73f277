//! The durable status file: a single 512-byte CRC-protected record holding
//! the persistent Raft state (currentTerm, votedFor) plus the last known
//! commit index and its byte position, used as the restart recovery scan
//! origin. The record is 8 hex CRC digits, "\r\n", then properties-style
//! key=value lines space-padded to 512 bytes; the CRC covers bytes
//! [10, 512). Writes are whole-record followed by fdatasync, and are
//! serialized: a new persist waits for any in-flight one.

use crate::errdata;
use crate::error::{Error, Result};
use crate::fiber::{Condition, Ctx, FiberFuture, Frame, Input, IoHandle, Step};

use log::{info, warn};
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

const FILE_LENGTH: usize = 512;
const CRC_HEX_LENGTH: usize = 8;
const CONTENT_START: usize = CRC_HEX_LENGTH + 2;

const CURRENT_TERM_KEY: &str = "currentTerm";
const VOTED_FOR_KEY: &str = "votedFor";
const COMMIT_INDEX_KEY: &str = "commitIndex";
const COMMIT_INDEX_POS_KEY: &str = "commitIndexPos";
const FIRST_INDEX_KEY: &str = "firstIndex";
const FIRST_TERM_KEY: &str = "firstTerm";

/// How long to wait before retrying a failed status write.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The values held by the status file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatusValues {
    pub term: u32,
    pub voted_for: u32,
    pub commit_index: u64,
    pub commit_index_pos: u64,
    /// The first index still present in the log; entries below it were
    /// dropped after a snapshot. 0 is treated as 1 (no compaction yet).
    pub first_index: u64,
    /// The term of the entry preceding first_index (the snapshot
    /// boundary), or 0 when the log starts at 1.
    pub first_term: u32,
}

/// The status file handle. Cloneable so writes can run on the IO executor.
#[derive(Clone)]
pub struct StatusFile {
    path: PathBuf,
    file: Arc<std::fs::File>,
}

impl StatusFile {
    /// Opens or creates the status file, returning the stored values. A
    /// fresh file yields zeroed values; an existing file must be exactly
    /// 512 bytes with a valid CRC, anything else is fatal.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, StatusValues)> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        let len = file.metadata()?.len();
        let this = Self { path: path.clone(), file: Arc::new(file) };
        if len == 0 {
            info!("created status file {path:?}");
            return Ok((this, StatusValues::default()));
        }
        if len != FILE_LENGTH as u64 {
            return errdata!("bad status file length {len} in {path:?}");
        }
        let mut buf = [0u8; FILE_LENGTH];
        this.file.read_exact_at(&mut buf, 0)?;
        let values = Self::decode(&buf)?;
        info!("loaded status file {path:?}: {values:?}");
        Ok((this, values))
    }

    /// Writes the values as a whole record and forces them to disk. Runs on
    /// the IO executor.
    pub fn write(&self, values: &StatusValues) -> Result<()> {
        let buf = Self::encode(values);
        self.file.write_all_at(&buf, 0)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn encode(values: &StatusValues) -> [u8; FILE_LENGTH] {
        let content = format!(
            "{CURRENT_TERM_KEY}={}\n{VOTED_FOR_KEY}={}\n{COMMIT_INDEX_KEY}={}\n\
             {COMMIT_INDEX_POS_KEY}={}\n{FIRST_INDEX_KEY}={}\n{FIRST_TERM_KEY}={}\n",
            values.term,
            values.voted_for,
            values.commit_index,
            values.commit_index_pos,
            values.first_index,
            values.first_term,
        );
        assert!(content.len() <= FILE_LENGTH - CONTENT_START, "status content too large");

        let mut buf = [b' '; FILE_LENGTH];
        buf[CONTENT_START - 2] = b'\r';
        buf[CONTENT_START - 1] = b'\n';
        buf[CONTENT_START..CONTENT_START + content.len()].copy_from_slice(content.as_bytes());
        let crc = crc32c::crc32c(&buf[CONTENT_START..]);
        buf[..CRC_HEX_LENGTH].copy_from_slice(format!("{crc:08x}").as_bytes());
        buf
    }

    fn decode(buf: &[u8; FILE_LENGTH]) -> Result<StatusValues> {
        let expect = crc32c::crc32c(&buf[CONTENT_START..]);
        let actual = u32::from_str_radix(std::str::from_utf8(&buf[..CRC_HEX_LENGTH])?, 16)
            .map_err(|_| Error::InvalidData("bad status file crc field".to_string()))?;
        if actual != expect {
            return errdata!("status file crc mismatch: {actual:08x}, expect {expect:08x}");
        }

        let mut values = StatusValues::default();
        let content = std::str::from_utf8(&buf[CONTENT_START..])?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return errdata!("malformed status line {line:?}");
            };
            let value = value.trim();
            match key.trim() {
                CURRENT_TERM_KEY => values.term = value.parse()?,
                VOTED_FOR_KEY => values.voted_for = value.parse()?,
                COMMIT_INDEX_KEY => values.commit_index = value.parse()?,
                COMMIT_INDEX_POS_KEY => values.commit_index_pos = value.parse()?,
                FIRST_INDEX_KEY => values.first_index = value.parse()?,
                FIRST_TERM_KEY => values.first_term = value.parse()?,
                _ => {}
            }
        }
        Ok(values)
    }
}

/// Serializes status persistence on a single fiber: requests coalesce to
/// the latest values, writes run one at a time on the IO executor, and
/// waiters are completed once a write covering their request lands.
pub struct StatusManager {
    file: StatusFile,
    io: IoHandle,
    work: Condition,
    latest: Option<(u64, StatusValues)>,
    requested_seq: u64,
    persisted_seq: u64,
    pending: Vec<(u64, FiberFuture<()>)>,
    closed: bool,
}

impl StatusManager {
    pub fn new(file: StatusFile, io: IoHandle) -> Self {
        Self {
            file,
            io,
            work: Condition::new("status-work"),
            latest: None,
            requested_seq: 0,
            persisted_seq: 0,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Requests an asynchronous persist of the given values. The returned
    /// future completes once a write covering this request has been forced
    /// to disk. Callers that must not proceed before durability (e.g.
    /// voting) await it.
    pub fn persist(&mut self, ctx: &mut Ctx, values: StatusValues) -> FiberFuture<()> {
        self.requested_seq += 1;
        self.latest = Some((self.requested_seq, values));
        let future = FiberFuture::new();
        self.pending.push((self.requested_seq, future.clone()));
        self.work.signal(ctx);
        future
    }

    /// Shuts the persist fiber down once in-flight work completes.
    pub fn close(&mut self, ctx: &mut Ctx) {
        self.closed = true;
        self.work.signal_all(ctx);
    }

    fn complete_through(&mut self, ctx: &mut Ctx, seq: u64) {
        self.persisted_seq = seq;
        for (_, future) in self.pending.iter().filter(|(s, _)| *s <= seq) {
            future.complete(ctx, Ok(()));
        }
        self.pending.retain(|(s, _)| *s > seq);
    }

    fn abort_pending(&mut self, ctx: &mut Ctx) {
        for (_, future) in self.pending.drain(..) {
            future.complete(ctx, Err(Error::Abort));
        }
    }
}

/// The status persist fiber. One per group, started at group creation.
pub struct StatusPersistFiber {
    manager: Rc<RefCell<StatusManager>>,
    writing: Option<(u64, StatusValues)>,
}

impl StatusPersistFiber {
    pub fn new(manager: Rc<RefCell<StatusManager>>) -> Self {
        Self { manager, writing: None }
    }
}

impl Frame for StatusPersistFiber {
    fn resume(&mut self, ctx: &mut Ctx, _input: Input) -> Result<Step> {
        let mut manager = self.manager.borrow_mut();

        // A completed write: release waiters covered by it.
        if let Some((seq, _)) = self.writing.take() {
            manager.complete_through(ctx, seq);
        }

        if manager.closed || ctx.is_stopping() {
            manager.abort_pending(ctx);
            return Ok(Step::done());
        }

        if let Some((seq, values)) = manager.latest.take() {
            let future = FiberFuture::<()>::new();
            let completer = future.completer(ctx);
            let file = manager.file.clone();
            manager.io.submit(completer, move || file.write(&values));
            self.writing = Some((seq, values));
            return Ok(future.wait());
        }

        let work = manager.work.clone();
        drop(manager);
        Ok(work.wait())
    }

    fn handle(&mut self, ctx: &mut Ctx, error: Error) -> Result<Step> {
        let mut manager = self.manager.borrow_mut();
        match error {
            Error::Interrupt => {
                manager.abort_pending(ctx);
                Ok(Step::done())
            }
            error => {
                // A failed write: requeue the values (unless a newer request
                // arrived) and retry after a delay.
                let Some((seq, values)) = self.writing.take() else { return Err(error) };
                warn!(
                    "status write failed for {:?}, retrying in {RETRY_INTERVAL:?}: {error}",
                    manager.file.path
                );
                if manager.latest.is_none() {
                    manager.latest = Some((seq, values));
                }
                Ok(Step::Sleep(RETRY_INTERVAL))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_file_defaults() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, values) = StatusFile::open(dir.path().join("status"))?;
        assert_eq!(values, StatusValues::default());
        Ok(())
    }

    #[test]
    fn write_and_reload() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status");
        let (file, _) = StatusFile::open(&path)?;
        let values = StatusValues {
            term: 7,
            voted_for: 3,
            commit_index: 42,
            commit_index_pos: 4096,
            first_index: 10,
            first_term: 2,
        };
        file.write(&values)?;

        let (_, reloaded) = StatusFile::open(&path)?;
        assert_eq!(reloaded, values);
        Ok(())
    }

    #[test]
    fn record_layout() {
        let values =
            StatusValues { term: 3, voted_for: 2, ..Default::default() };
        let buf = StatusFile::encode(&values);
        assert_eq!(buf.len(), FILE_LENGTH);
        assert_eq!(&buf[CRC_HEX_LENGTH..CONTENT_START], b"\r\n");
        let content = std::str::from_utf8(&buf[CONTENT_START..]).expect("utf8");
        assert!(content.starts_with("currentTerm=3\nvotedFor=2\n"));
        // The record is space-padded to the full length.
        assert!(content.ends_with(' '));
    }

    #[test]
    fn corruption_detected() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status");
        let (file, _) = StatusFile::open(&path)?;
        file.write(&StatusValues { term: 1, ..Default::default() })?;

        // Flip a content byte behind the CRC's back.
        let raw = OpenOptions::new().write(true).open(&path)?;
        raw.write_all_at(b"9", CONTENT_START as u64 + 12)?;

        assert!(matches!(StatusFile::open(&path), Err(Error::InvalidData(_))));
        Ok(())
    }

    #[test]
    fn truncated_file_fatal() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status");
        let (file, _) = StatusFile::open(&path)?;
        file.write(&StatusValues::default())?;
        OpenOptions::new().write(true).open(&path)?.set_len(100)?;
        assert!(matches!(StatusFile::open(&path), Err(Error::InvalidData(_))));
        Ok(())
    }
}
