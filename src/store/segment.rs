//! Segmented append-only files. All segments of a store have identical
//! power-of-two size and are named by their zero-padded hex start offset in
//! the global byte stream, so the segment owning a position p is found with
//! p & !(size - 1). The first SEGMENT_HEADER_SIZE bytes of each segment are
//! reserved for a magic/version header and never hold items.

use crate::error::Result;
use crate::{errdata, errinput};

use log::{debug, info};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The reserved per-segment header region.
pub const SEGMENT_HEADER_SIZE: u64 = 64;

const SEGMENT_MAGIC: u32 = 0x4252_4c47; // "BRLG"
const SEGMENT_VERSION: u32 = 1;

/// One fixed-size segment of the global byte stream. Tracks the first item
/// it contains, recorded lazily on first append, and a use count that
/// blocks deletion while the fsync fiber holds the file.
#[derive(Debug)]
pub struct LogFile {
    pub start_pos: u64,
    pub end_pos: u64,
    pub path: PathBuf,
    pub file: Arc<File>,
    pub first_index: u64,
    pub first_term: u32,
    pub first_timestamp: i64,
    pub use_count: u32,
}

impl LogFile {
    /// Returns whether the global position falls inside this segment.
    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start_pos && pos < self.end_pos
    }
}

/// An ordered, contiguous queue of segments in one directory.
pub struct SegmentQueue {
    dir: PathBuf,
    size: u64,
    suffix: &'static str,
    files: VecDeque<LogFile>,
}

impl SegmentQueue {
    /// Opens a segment directory, scanning and validating existing files.
    /// Segment start offsets must be contiguous.
    pub fn open(dir: impl Into<PathBuf>, size: u64, suffix: &'static str) -> Result<Self> {
        assert!(size.is_power_of_two(), "segment size must be a power of two");
        assert!(size > SEGMENT_HEADER_SIZE, "segment size too small");
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut starts = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(hex) = name.strip_suffix(suffix) else { continue };
            let Ok(start) = u64::from_str_radix(hex, 16) else {
                return errdata!("unexpected file {name} in segment dir");
            };
            starts.push(start);
        }
        starts.sort_unstable();

        let mut queue = Self { dir, size, suffix, files: VecDeque::new() };
        for start in starts {
            if let Some(last) = queue.files.back() {
                if last.end_pos != start {
                    return errdata!("segment gap between {:x} and {start:x}", last.start_pos);
                }
            }
            let path = queue.path_of(start);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            if file.metadata()?.len() != size {
                return errdata!("segment {path:?} has wrong length");
            }
            let mut header = [0u8; 8];
            file.read_exact_at(&mut header, 0)?;
            let magic = u32::from_be_bytes(header[0..4].try_into().expect("sliced 4"));
            let version = u32::from_be_bytes(header[4..8].try_into().expect("sliced 4"));
            if magic != SEGMENT_MAGIC {
                return errdata!("segment {path:?} has bad magic {magic:#x}");
            }
            if version != SEGMENT_VERSION {
                return errdata!("segment {path:?} has unsupported version {version}");
            }
            debug!("opened segment {path:?}");
            queue.files.push_back(LogFile {
                start_pos: start,
                end_pos: start + size,
                path,
                file: Arc::new(file),
                first_index: 0,
                first_term: 0,
                first_timestamp: 0,
                use_count: 0,
            });
        }
        Ok(queue)
    }

    pub fn segment_size(&self) -> u64 {
        self.size
    }

    /// The bitmask extracting the in-segment offset of a global position.
    pub fn offset_mask(&self) -> u64 {
        self.size - 1
    }

    /// The start offset of the segment owning the global position.
    pub fn base_of(&self, pos: u64) -> u64 {
        pos & !(self.size - 1)
    }

    /// The first writable position of the segment after the one owning pos.
    pub fn next_file_pos(&self, pos: u64) -> u64 {
        self.base_of(pos) + self.size + SEGMENT_HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn first(&self) -> Option<&LogFile> {
        self.files.front()
    }

    pub fn last(&self) -> Option<&LogFile> {
        self.files.back()
    }

    /// Returns the segment owning the global position, if present.
    pub fn get(&self, pos: u64) -> Option<&LogFile> {
        self.index_of(pos).map(|i| &self.files[i])
    }

    pub fn get_mut(&mut self, pos: u64) -> Option<&mut LogFile> {
        self.index_of(pos).map(move |i| &mut self.files[i])
    }

    fn index_of(&self, pos: u64) -> Option<usize> {
        let first = self.files.front()?;
        if pos < first.start_pos {
            return None;
        }
        let index = ((self.base_of(pos) - first.start_pos) / self.size) as usize;
        (index < self.files.len()).then_some(index)
    }

    fn path_of(&self, start: u64) -> PathBuf {
        self.dir.join(format!("{start:016x}{}", self.suffix))
    }

    /// The start offset the next allocated segment will get.
    pub fn next_alloc_start(&self, pos: u64) -> u64 {
        match self.files.back() {
            Some(last) => last.end_pos,
            None => self.base_of(pos),
        }
    }

    /// The path the next allocated segment will get. Allocation itself runs
    /// on the IO executor via allocate_file; the returned file is then
    /// installed with install.
    pub fn next_alloc_path(&self, pos: u64) -> PathBuf {
        self.path_of(self.next_alloc_start(pos))
    }

    /// Installs a freshly allocated segment at the tail of the queue.
    pub fn install(&mut self, pos: u64, file: Arc<File>) {
        let start = self.next_alloc_start(pos);
        info!("installed segment {:?}", self.path_of(start));
        self.files.push_back(LogFile {
            start_pos: start,
            end_pos: start + self.size,
            path: self.path_of(start),
            file,
            first_index: 0,
            first_term: 0,
            first_timestamp: 0,
            use_count: 0,
        });
    }

    /// Deletes the first segment. The caller must ensure its use count is
    /// zero and its contents are no longer required.
    pub fn delete_first(&mut self) -> Result<()> {
        if let Some(file) = self.files.pop_front() {
            assert_eq!(file.use_count, 0, "deleting segment in use");
            info!("deleting segment {:?}", file.path);
            std::fs::remove_file(&file.path)?;
        }
        Ok(())
    }

    /// Deletes all segments after the one owning pos, used when restart
    /// recovery truncates the log.
    pub fn delete_after(&mut self, pos: u64) -> Result<()> {
        let base = self.base_of(pos);
        while let Some(last) = self.files.back() {
            if last.start_pos <= base {
                break;
            }
            let file = self.files.pop_back().expect("segment queue underflow");
            info!("deleting trailing segment {:?}", file.path);
            std::fs::remove_file(&file.path)?;
        }
        Ok(())
    }

    /// Returns a Send snapshot of the queue for reads on the IO executor.
    pub fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            size: self.size,
            files: self.files.iter().map(|f| (f.start_pos, f.file.clone())).collect(),
        }
    }
}

/// Creates a segment file on disk: full length, header written and synced.
/// Runs on the IO executor; the dispatcher installs the result.
pub fn allocate_file(path: &Path, size: u64) -> Result<Arc<File>> {
    let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    file.set_len(size)?;
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC.to_be_bytes());
    header[4..8].copy_from_slice(&SEGMENT_VERSION.to_be_bytes());
    file.write_all_at(&header, 0)?;
    file.sync_data()?;
    Ok(Arc::new(file))
}

/// A point-in-time view of the segment files, safe to read from any thread
/// via positioned reads.
#[derive(Clone)]
pub struct SegmentSnapshot {
    size: u64,
    files: Vec<(u64, Arc<File>)>,
}

impl SegmentSnapshot {
    pub fn segment_size(&self) -> u64 {
        self.size
    }

    /// The start offset of the segment owning the global position.
    pub fn base_of(&self, pos: u64) -> u64 {
        pos & !(self.size - 1)
    }

    /// Reads exactly buf.len() bytes at a global position. The range must
    /// not span segments; items never do.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let base = self.base_of(pos);
        if self.base_of(pos + buf.len() as u64 - 1) != base {
            return errinput!("read range {pos}+{} spans segments", buf.len());
        }
        let Some((_, file)) = self.files.iter().find(|(start, _)| *start == base) else {
            return errinput!("no segment for position {pos}");
        };
        file.read_exact_at(buf, pos & (self.size - 1))?;
        Ok(())
    }

    /// Returns whether the global position falls inside a known segment.
    pub fn contains(&self, pos: u64) -> bool {
        let base = self.base_of(pos);
        self.files.iter().any(|(start, _)| *start == base)
    }

    /// The exclusive end of the segment stream.
    pub fn end_pos(&self) -> u64 {
        self.files.last().map_or(0, |(start, _)| start + self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_allocate_reopen() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let size = 1024 * 1024;
        let mut queue = SegmentQueue::open(dir.path(), size, ".lf")?;
        assert!(queue.is_empty());

        let path = queue.next_alloc_path(64);
        let file = allocate_file(&path, size)?;
        queue.install(64, file);
        assert_eq!(queue.first().map(|f| f.start_pos), Some(0));

        let path = queue.next_alloc_path(size + 64);
        let file = allocate_file(&path, size)?;
        queue.install(size + 64, file);
        assert_eq!(queue.last().map(|f| f.start_pos), Some(size));

        // Positions map to the right segments.
        assert_eq!(queue.get(100).map(|f| f.start_pos), Some(0));
        assert_eq!(queue.get(size + 100).map(|f| f.start_pos), Some(size));
        assert!(queue.get(2 * size).is_none());

        drop(queue);
        let queue = SegmentQueue::open(dir.path(), size, ".lf")?;
        assert_eq!(queue.files.len(), 2);
        Ok(())
    }

    #[test]
    fn snapshot_reads() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let size = 4096;
        let mut queue = SegmentQueue::open(dir.path(), size, ".lf")?;
        let file = allocate_file(&queue.next_alloc_path(0), size)?;
        file.write_all_at(b"hello", SEGMENT_HEADER_SIZE)?;
        queue.install(0, file);

        let snapshot = queue.snapshot();
        let mut buf = [0u8; 5];
        snapshot.read_at(SEGMENT_HEADER_SIZE, &mut buf)?;
        assert_eq!(&buf, b"hello");

        // Cross-segment reads are rejected.
        let mut buf = [0u8; 8];
        assert!(snapshot.read_at(size - 4, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn delete_after_truncates() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let size = 4096;
        let mut queue = SegmentQueue::open(dir.path(), size, ".lf")?;
        for i in 0..3 {
            let pos = i * size + SEGMENT_HEADER_SIZE;
            let file = allocate_file(&queue.next_alloc_path(pos), size)?;
            queue.install(pos, file);
        }
        queue.delete_after(size + 10)?;
        assert_eq!(queue.files.len(), 2);
        let queue = SegmentQueue::open(dir.path(), size, ".lf")?;
        assert_eq!(queue.files.len(), 2);
        Ok(())
    }
}
