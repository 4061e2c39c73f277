//! Restart recovery. Scans the log segment stream from the persisted commit
//! index position, validating every frame: the first item must be the
//! commit item itself, and each subsequent item must chain correctly
//! (prevLogTerm equals the previous item's term, indexes are contiguous,
//! terms never decrease) with valid CRCs on the header and both payload
//! sections. An all-zero header is a clean end-of-data sentinel. Anything
//! else stops the scan: the log is truncated after the last valid item and
//! later segments are deleted. Validated items repopulate the index store.

use super::frame::{self, ITEM_HEADER_SIZE};
use super::index::IdxOps;
use super::segment::{SegmentQueue, SEGMENT_HEADER_SIZE};
use crate::errdata;
use crate::error::Result;
use crate::raft::item::{Index, Term};

use log::{info, warn};
use std::os::unix::fs::FileExt;

/// The outcome of restart recovery.
#[derive(Debug, PartialEq)]
pub struct Restored {
    /// The last valid item, or (0, 0) for an empty log.
    pub last_index: Index,
    pub last_term: Term,
    /// The global byte position where the next item will be written.
    pub next_pos: u64,
    /// Whether invalid data was found and truncated.
    pub truncated: bool,
}

/// Scans and validates the log from the persisted commit position. When
/// the log head was compacted after a snapshot, first_index names the
/// first entry the log may contain; with no usable commit position, the
/// scan starts at the head of the first segment and expects it.
pub fn restore(
    segs: &mut SegmentQueue,
    idx: &mut IdxOps,
    commit_index: Index,
    commit_pos: u64,
    first_index: Index,
) -> Result<Restored> {
    if segs.is_empty() {
        if commit_index > 0 {
            return errdata!("no log segments but commit index is {commit_index}");
        }
        return Ok(Restored {
            last_index: 0,
            last_term: 0,
            next_pos: SEGMENT_HEADER_SIZE,
            truncated: false,
        });
    }

    let size = segs.segment_size();
    let mask = segs.offset_mask();

    // Find the first segment to scan and the offset within it.
    let first_start = segs.first().expect("no first segment").start_pos;
    let mut file_start = if commit_index > 0 {
        if segs.get(commit_pos).is_none() {
            return errdata!("commit position {commit_pos:#x} has no segment");
        }
        segs.base_of(commit_pos)
    } else {
        first_start
    };
    let mut offset = if commit_index > 0 { commit_pos & mask } else { SEGMENT_HEADER_SIZE };
    if offset < SEGMENT_HEADER_SIZE {
        return errdata!("commit position {commit_pos:#x} is inside a segment header");
    }

    // With a commit position the first item must be the commit item; with
    // a compacted head, the first item must be first_index (and is indexed
    // like any other, unlike the commit item whose slot is already known).
    let expect_first = if commit_index > 0 {
        Some((commit_index, false))
    } else if first_index > 1 {
        Some((first_index, true))
    } else {
        None
    };
    let mut commit_checked = expect_first.is_none();
    let mut prev_index: Index = commit_index;
    let mut prev_term: Term = 0;
    let mut last_index: Index = 0;
    let mut last_term: Term = 0;
    let mut next_pos = file_start + offset;
    let mut truncated = false;

    'files: loop {
        let Some(file) = segs.get(file_start) else { break };
        info!("restoring log segment {:?} from offset {offset:#x}", file.path);
        let handle = file.file.clone();

        while offset + (ITEM_HEADER_SIZE as u64) <= size {
            let item_pos = file_start + offset;
            let mut header_buf = [0u8; ITEM_HEADER_SIZE];
            handle.read_exact_at(&mut header_buf, offset)?;
            let header = frame::decode_header(&header_buf);

            if commit_checked {
                if header.is_end_sentinel() {
                    info!("reached end of log data at {item_pos:#x}");
                    break 'files;
                }
                if header.prev_log_term != prev_term {
                    warn!(
                        "prevLogTerm mismatch at {item_pos:#x}: {} != {prev_term}, truncating",
                        header.prev_log_term
                    );
                    truncated = true;
                    break 'files;
                }
                if header.index != prev_index + 1 {
                    warn!(
                        "index mismatch at {item_pos:#x}: {} != {}, truncating",
                        header.index,
                        prev_index + 1
                    );
                    truncated = true;
                    break 'files;
                }
                if header.term < prev_term {
                    warn!(
                        "term regression at {item_pos:#x}: {} < {prev_term}, truncating",
                        header.term
                    );
                    truncated = true;
                    break 'files;
                }
            } else {
                // The first item must be the expected one, and must be
                // structurally sound; a broken committed item is fatal.
                let (expect, _) = expect_first.expect("missing first-item expectation");
                if header.index != expect {
                    return errdata!(
                        "first item index mismatch at {item_pos:#x}: {} != {expect}",
                        header.index
                    );
                }
                frame::validate_header(&header)?;
            }

            if header.crc != frame::header_crc(&header_buf) {
                if !commit_checked {
                    return errdata!("commit item header crc mismatch at {item_pos:#x}");
                }
                warn!("header crc mismatch at {item_pos:#x}, truncating");
                truncated = true;
                break 'files;
            }
            if frame::validate_header(&header).is_err()
                || offset + header.total_len as u64 > size
            {
                if !commit_checked {
                    return errdata!("broken commit item at {item_pos:#x}");
                }
                warn!("broken item frame at {item_pos:#x}, truncating");
                truncated = true;
                break 'files;
            }

            let mut rest = vec![0u8; header.total_len as usize - ITEM_HEADER_SIZE];
            handle.read_exact_at(&mut rest, offset + ITEM_HEADER_SIZE as u64)?;
            if let Err(error) = frame::decode_sections(&header, &rest) {
                if !commit_checked {
                    return errdata!("broken commit item payload at {item_pos:#x}: {error}");
                }
                warn!("item payload invalid at {item_pos:#x}, truncating: {error}");
                truncated = true;
                break 'files;
            }

            if commit_checked {
                idx.put(header.index, item_pos);
            } else {
                commit_checked = true;
                if expect_first.is_some_and(|(_, index_it)| index_it) {
                    idx.put(header.index, item_pos);
                }
            }

            // Record per-file first item metadata on the fly.
            if let Some(file) = segs.get_mut(item_pos) {
                if file.first_index == 0 {
                    file.first_index = header.index;
                    file.first_term = header.term;
                }
            }

            prev_index = header.index;
            prev_term = header.term;
            last_index = header.index;
            last_term = header.term;
            offset += header.total_len as u64;
            next_pos = file_start + offset;
        }

        // Less than a header remains; items never span segments, so the
        // next item (if any) starts after the next segment's header.
        file_start += size;
        offset = SEGMENT_HEADER_SIZE;
        if segs.get(file_start).is_none() {
            break;
        }
        next_pos = file_start + offset;
    }

    if truncated {
        segs.delete_after(next_pos)?;
    }
    info!(
        "log restored: last={last_index}@{last_term} next_pos={next_pos:#x} truncated={truncated}"
    );
    Ok(Restored { last_index, last_term, next_pos, truncated })
}

#[cfg(test)]
mod tests {
    use super::super::segment::allocate_file;
    use super::*;
    use crate::fiber::IoExecutor;
    use crate::raft::item::{ItemType, LogItem};

    const SIZE: u64 = 64 * 1024;

    struct Fixture {
        dir: tempfile::TempDir,
        io: IoExecutor,
    }

    impl Fixture {
        fn new() -> Self {
            Self { dir: tempfile::tempdir().expect("tempdir"), io: IoExecutor::new("test-io", 1) }
        }

        fn segs(&self) -> SegmentQueue {
            SegmentQueue::open(self.dir.path().join("log"), SIZE, ".lf").expect("open failed")
        }

        fn idx(&self) -> IdxOps {
            IdxOps::open(self.dir.path().join("idx"), 4096, 0, self.io.handle())
                .expect("open failed")
        }

        /// Writes a chain of items starting at index 1 into fresh segments,
        /// returning the encoded frames' positions.
        fn write_items(&self, items: &[LogItem]) -> Vec<u64> {
            let mut segs = self.segs();
            let file = allocate_file(&segs.next_alloc_path(SEGMENT_HEADER_SIZE), SIZE)
                .expect("allocate failed");
            segs.install(SEGMENT_HEADER_SIZE, file);

            let mut positions = Vec::new();
            let mut pos = SEGMENT_HEADER_SIZE;
            let mut buf = Vec::new();
            for item in items {
                positions.push(pos);
                let start = buf.len();
                frame::encode_item(&mut buf, item).expect("encode failed");
                pos += (buf.len() - start) as u64;
            }
            use std::os::unix::fs::FileExt as _;
            segs.get(SEGMENT_HEADER_SIZE)
                .expect("no segment")
                .file
                .write_all_at(&buf, SEGMENT_HEADER_SIZE)
                .expect("write failed");
            positions
        }
    }

    fn chain(terms: &[u32]) -> Vec<LogItem> {
        let mut items = Vec::new();
        let mut prev = 0;
        for (i, term) in terms.iter().enumerate() {
            let mut item = LogItem::new(ItemType::Normal, i as u64 + 1, *term, prev);
            item.body = format!("cmd-{}", i + 1).into_bytes();
            items.push(item);
            prev = *term;
        }
        items
    }

    #[test]
    fn restore_empty() -> Result<()> {
        let fx = Fixture::new();
        let mut segs = fx.segs();
        let mut idx = fx.idx();
        let restored = restore(&mut segs, &mut idx, 0, 0, 1)?;
        assert_eq!(
            restored,
            Restored { last_index: 0, last_term: 0, next_pos: SEGMENT_HEADER_SIZE, truncated: false }
        );
        Ok(())
    }

    #[test]
    fn restore_full_chain_from_scratch() -> Result<()> {
        let fx = Fixture::new();
        let items = chain(&[1, 1, 2, 2]);
        fx.write_items(&items);

        let mut segs = fx.segs();
        let mut idx = fx.idx();
        let restored = restore(&mut segs, &mut idx, 0, 0, 1)?;
        assert_eq!(restored.last_index, 4);
        assert_eq!(restored.last_term, 2);
        assert!(!restored.truncated);
        // All items are indexed.
        for index in 1..=4 {
            assert!(idx.lookup(index).is_some(), "index {index} missing");
        }
        Ok(())
    }

    #[test]
    fn restore_from_commit_position() -> Result<()> {
        let fx = Fixture::new();
        let items = chain(&[1, 1, 2, 2, 3]);
        let positions = fx.write_items(&items);

        let mut segs = fx.segs();
        let mut idx = fx.idx();
        // Commit index 3: the scan starts at its position and re-indexes
        // everything after it.
        let restored = restore(&mut segs, &mut idx, 3, positions[2], 1)?;
        assert_eq!(restored.last_index, 5);
        assert_eq!(restored.last_term, 3);
        assert_eq!(idx.lookup(4), Some(positions[3]));
        assert_eq!(idx.lookup(5), Some(positions[4]));
        Ok(())
    }

    #[test]
    fn restore_commit_mismatch_is_fatal() {
        let fx = Fixture::new();
        let items = chain(&[1, 1]);
        let positions = fx.write_items(&items);

        let mut segs = fx.segs();
        let mut idx = fx.idx();
        // Claim commit index 7 at item 2's position: fatal.
        assert!(restore(&mut segs, &mut idx, 7, positions[1], 1).is_err());
    }

    #[test]
    fn restore_truncates_torn_body() -> Result<()> {
        let fx = Fixture::new();
        let items = chain(&[1, 1, 1]);
        let positions = fx.write_items(&items);

        // Tear the last item: flip a byte in its body.
        {
            let segs = fx.segs();
            let file = &segs.get(positions[2]).expect("no segment").file;
            let mut byte = [0u8; 1];
            let tear_at = positions[2] + ITEM_HEADER_SIZE as u64 + 12;
            use std::os::unix::fs::FileExt as _;
            file.read_exact_at(&mut byte, tear_at)?;
            byte[0] ^= 0xff;
            file.write_all_at(&byte, tear_at)?;
        }

        let mut segs = fx.segs();
        let mut idx = fx.idx();
        let restored = restore(&mut segs, &mut idx, 0, 0, 1)?;
        // The scan stops exactly before the torn item.
        assert_eq!(restored.last_index, 2);
        assert_eq!(restored.next_pos, positions[2]);
        assert!(restored.truncated);
        Ok(())
    }

    #[test]
    fn restore_stops_at_zero_fill() -> Result<()> {
        let fx = Fixture::new();
        let items = chain(&[1, 2]);
        fx.write_items(&items);

        let mut segs = fx.segs();
        let mut idx = fx.idx();
        let restored = restore(&mut segs, &mut idx, 0, 0, 1)?;
        // The segment is zero-filled after the two items: clean end.
        assert_eq!(restored.last_index, 2);
        assert!(!restored.truncated);
        Ok(())
    }
}
