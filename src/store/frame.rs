//! The on-disk item frame. Each log item is framed as:
//!
//! ```text
//! crc32c(4) | totalLen(4) | headLen(2) | type(1) | _(1) |
//! term(4) | prevLogTerm(4) | index(8) |
//! [header bytes] | [header-crc(4)] |
//! [body bytes]   | [body-crc(4)]
//! ```
//!
//! The leading crc32c covers the 24 header bytes after itself. The header
//! and body sections carry independent CRCs so partial tears are detected
//! per section. headLen is the byte offset at which the body section
//! starts, so totalLen >= headLen > 0 always holds; the header section is
//! always present since it leads with the business type tag and timestamp.
//! A frame of all zeroes is the end-of-data sentinel. All integers are
//! big-endian.

use crate::error::Result;
use crate::raft::item::{ItemType, LogItem};
use crate::{errdata, errinput};

/// The fixed item header size.
pub const ITEM_HEADER_SIZE: usize = 28;

/// The fixed lead-in of the header section: biz_type(2) + timestamp(8).
const HEADER_SECTION_LEAD: usize = 10;

/// The per-section CRC trailer size.
const SECTION_CRC_SIZE: usize = 4;

/// A decoded item header, before payload validation.
#[derive(Debug, PartialEq)]
pub struct ItemHeader {
    pub crc: u32,
    pub total_len: u32,
    pub head_len: u16,
    pub item_type: u8,
    pub term: u32,
    pub prev_log_term: u32,
    pub index: u64,
}

impl ItemHeader {
    /// Returns whether this is the all-zero end-of-data sentinel. Detection
    /// matches restart recovery: a zeroed crc and prevLogTerm suffice.
    pub fn is_end_sentinel(&self) -> bool {
        self.crc == 0 && self.prev_log_term == 0
    }

    /// The length of the header section payload (biz lead-in + user header).
    pub fn header_section_len(&self) -> usize {
        self.head_len as usize - ITEM_HEADER_SIZE - SECTION_CRC_SIZE
    }

    /// The length of the body payload, excluding its CRC trailer.
    pub fn body_len(&self) -> usize {
        let rest = self.total_len as usize - self.head_len as usize;
        rest.saturating_sub(SECTION_CRC_SIZE)
    }
}

/// Returns the total encoded frame length of an item.
pub fn encoded_len(item: &LogItem) -> u64 {
    let mut len = ITEM_HEADER_SIZE + HEADER_SECTION_LEAD + item.header.len() + SECTION_CRC_SIZE;
    if !item.body.is_empty() {
        len += item.body.len() + SECTION_CRC_SIZE;
    }
    len as u64
}

/// Encodes an item frame onto the buffer. Fails if the user header exceeds
/// the u16 headLen field.
pub fn encode_item(buf: &mut Vec<u8>, item: &LogItem) -> Result<()> {
    let head_len = ITEM_HEADER_SIZE + HEADER_SECTION_LEAD + item.header.len() + SECTION_CRC_SIZE;
    if head_len > u16::MAX as usize {
        return errinput!("log item header too large: {} bytes", item.header.len());
    }
    let total_len = encoded_len(item);

    let start = buf.len();
    buf.extend_from_slice(&[0; 4]); // crc placeholder
    buf.extend_from_slice(&(total_len as u32).to_be_bytes());
    buf.extend_from_slice(&(head_len as u16).to_be_bytes());
    buf.push(item.item_type.to_u8());
    buf.push(0);
    buf.extend_from_slice(&item.term.to_be_bytes());
    buf.extend_from_slice(&item.prev_log_term.to_be_bytes());
    buf.extend_from_slice(&item.index.to_be_bytes());
    let crc = crc32c::crc32c(&buf[start + 4..start + ITEM_HEADER_SIZE]);
    buf[start..start + 4].copy_from_slice(&crc.to_be_bytes());

    // Header section: biz type tag, timestamp, then the opaque header bytes.
    let section_start = buf.len();
    buf.extend_from_slice(&item.biz_type.to_be_bytes());
    buf.extend_from_slice(&item.timestamp.to_be_bytes());
    buf.extend_from_slice(&item.header);
    let crc = crc32c::crc32c(&buf[section_start..]);
    buf.extend_from_slice(&crc.to_be_bytes());

    // Body section, if any.
    if !item.body.is_empty() {
        let crc = crc32c::crc32c(&item.body);
        buf.extend_from_slice(&item.body);
        buf.extend_from_slice(&crc.to_be_bytes());
    }
    Ok(())
}

/// Writes an all-zero end-of-data sentinel header.
pub fn write_end_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0; ITEM_HEADER_SIZE]);
}

/// Decodes an item header from exactly ITEM_HEADER_SIZE bytes, without
/// validating the CRC (the caller decides whether a mismatch is a clean end
/// of data or corruption).
pub fn decode_header(bytes: &[u8]) -> ItemHeader {
    assert_eq!(bytes.len(), ITEM_HEADER_SIZE, "invalid item header length");
    let u32_at = |i: usize| u32::from_be_bytes(bytes[i..i + 4].try_into().expect("sliced 4"));
    ItemHeader {
        crc: u32_at(0),
        total_len: u32_at(4),
        head_len: u16::from_be_bytes(bytes[8..10].try_into().expect("sliced 2")),
        item_type: bytes[10],
        term: u32_at(12),
        prev_log_term: u32_at(16),
        index: u64::from_be_bytes(bytes[20..28].try_into().expect("sliced 8")),
    }
}

/// Computes the expected header CRC over the 24 bytes after the CRC field.
pub fn header_crc(bytes: &[u8]) -> u32 {
    assert_eq!(bytes.len(), ITEM_HEADER_SIZE, "invalid item header length");
    crc32c::crc32c(&bytes[4..])
}

/// Validates a header's field invariants: totalLen >= headLen > 0, a known
/// type, term > 0.
pub fn validate_header(header: &ItemHeader) -> Result<()> {
    if (header.head_len as usize) < ITEM_HEADER_SIZE + HEADER_SECTION_LEAD + SECTION_CRC_SIZE {
        return errdata!("item headLen {} too small", header.head_len);
    }
    if header.total_len < header.head_len as u32 {
        return errdata!("item totalLen {} < headLen {}", header.total_len, header.head_len);
    }
    if header.term == 0 {
        return errdata!("item term 0 at index {}", header.index);
    }
    ItemType::from_u8(header.item_type)?;
    Ok(())
}

/// Decodes the payload sections of an item whose header has been read,
/// verifying the per-section CRCs. `rest` holds the bytes after the item
/// header, of length totalLen - ITEM_HEADER_SIZE.
pub fn decode_sections(header: &ItemHeader, rest: &[u8]) -> Result<LogItem> {
    let expect = header.total_len as usize - ITEM_HEADER_SIZE;
    if rest.len() != expect {
        return errdata!("item section length {} != {expect}", rest.len());
    }

    let section_len = header.header_section_len() + SECTION_CRC_SIZE;
    let (head_section, body_section) = rest.split_at(section_len);
    let (head_payload, head_crc) = head_section.split_at(header.header_section_len());
    if u32::from_be_bytes(head_crc.try_into().expect("sliced 4")) != crc32c::crc32c(head_payload) {
        return errdata!("item header section crc mismatch at index {}", header.index);
    }
    let biz_type = u16::from_be_bytes(head_payload[0..2].try_into().expect("sliced 2"));
    let timestamp = i64::from_be_bytes(head_payload[2..10].try_into().expect("sliced 8"));
    let user_header = head_payload[HEADER_SECTION_LEAD..].to_vec();

    let body = if body_section.is_empty() {
        Vec::new()
    } else {
        let (body_payload, body_crc) = body_section.split_at(header.body_len());
        if u32::from_be_bytes(body_crc.try_into().expect("sliced 4"))
            != crc32c::crc32c(body_payload)
        {
            return errdata!("item body section crc mismatch at index {}", header.index);
        }
        body_payload.to_vec()
    };

    Ok(LogItem {
        index: header.index,
        term: header.term,
        prev_log_term: header.prev_log_term,
        item_type: ItemType::from_u8(header.item_type)?,
        biz_type,
        timestamp,
        header: user_header,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::item::ItemType;

    fn item(index: u64, term: u32, prev: u32, body: &[u8]) -> LogItem {
        let mut item = LogItem::new(ItemType::Normal, index, term, prev);
        item.biz_type = 7;
        item.timestamp = 12345;
        item.body = body.to_vec();
        item
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let item = item(3, 2, 1, b"command");
        let mut buf = Vec::new();
        encode_item(&mut buf, &item)?;
        assert_eq!(buf.len() as u64, encoded_len(&item));

        let header = decode_header(&buf[..ITEM_HEADER_SIZE]);
        assert_eq!(header.crc, header_crc(&buf[..ITEM_HEADER_SIZE]));
        validate_header(&header)?;
        assert_eq!(header.index, 3);
        assert_eq!(header.term, 2);
        assert_eq!(header.prev_log_term, 1);
        // headLen is the body section offset: 28 header + 10 lead-in + 4 CRC.
        assert_eq!(hex::encode(&buf[8..10]), "002a");

        let decoded = decode_sections(&header, &buf[ITEM_HEADER_SIZE..])?;
        assert_eq!(decoded, item);
        Ok(())
    }

    #[test]
    fn roundtrip_empty_body() -> Result<()> {
        let item = LogItem::new(ItemType::NoOp, 1, 1, 0);
        let mut buf = Vec::new();
        encode_item(&mut buf, &item)?;
        let header = decode_header(&buf[..ITEM_HEADER_SIZE]);
        validate_header(&header)?;
        let decoded = decode_sections(&header, &buf[ITEM_HEADER_SIZE..])?;
        assert_eq!(decoded.item_type, ItemType::NoOp);
        assert_eq!(decoded.body, Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn end_sentinel() {
        let mut buf = Vec::new();
        write_end_header(&mut buf);
        let header = decode_header(&buf);
        assert!(header.is_end_sentinel());
    }

    #[test]
    fn body_tear_detected() -> Result<()> {
        // Corrupting any trailing byte of the body section must fail the
        // body CRC while the header section still validates.
        let item = item(1, 1, 0, b"payload");
        let mut buf = Vec::new();
        encode_item(&mut buf, &item)?;
        let header = decode_header(&buf[..ITEM_HEADER_SIZE]);

        for k in 1..=b"payload".len() + SECTION_CRC_SIZE {
            let mut torn = buf.clone();
            let len = torn.len();
            torn[len - k] ^= 0xff;
            assert!(decode_sections(&header, &torn[ITEM_HEADER_SIZE..]).is_err(), "tear {k}");
        }
        Ok(())
    }

    #[test]
    fn header_crc_detects_corruption() -> Result<()> {
        let item = item(1, 1, 0, b"x");
        let mut buf = Vec::new();
        encode_item(&mut buf, &item)?;
        buf[20] ^= 0xff; // flip a bit in the index field
        let header = decode_header(&buf[..ITEM_HEADER_SIZE]);
        assert_ne!(header.crc, header_crc(&buf[..ITEM_HEADER_SIZE]));
        Ok(())
    }
}
