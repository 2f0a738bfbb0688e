//! The per-object record stored inline at the start of each bucket slot.
//!
//! # Bucket element layout
//!
//! ```text
//! +------------------------------------+  <- header.offset
//! | Header (HEADER_SIZE bytes)         |
//! +------------------------------------+  <- header.data_offset()
//! | payload (header.length bytes)      |
//! +------------------------------------+
//! ```
//!
//! All four fields are varints packed consecutively into the fixed
//! 32-byte slot; unused trailing bytes are undefined on write and
//! ignored on read. The fixed slot keeps the bucket layout O(1) to
//! address while small field values still pack into single bytes.

use crate::index::Link;
use crate::varint;

/// Serialised size of a [`Header`] slot.
pub const HEADER_SIZE: usize = 32;

/// Describes one stored object. Reading `HEADER_SIZE` bytes at the
/// object's offset and decoding them yields the header; the payload
/// follows at [`Header::data_offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: i64,
    pub offset: i64,
    pub length: i32,
    pub timestamp: i64,
}

impl Header {
    /// Widens the payload length for offset arithmetic.
    pub fn length64(&self) -> i64 {
        i64::from(self.length)
    }

    /// Projects the index entry for this header.
    pub fn link(&self) -> Link {
        Link {
            id: self.id,
            offset: self.offset,
        }
    }

    /// Returns the offset of the payload associated with this header.
    pub fn data_offset(&self) -> i64 {
        self.offset + HEADER_SIZE as i64
    }

    /// Encodes the header into `buf`, returning the number of bytes
    /// used. On-disk field order is id, length, offset, timestamp.
    ///
    /// Panics if `buf` is shorter than `HEADER_SIZE`.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        n += varint::put_varint(&mut buf[n..HEADER_SIZE], self.id);
        n += varint::put_varint(&mut buf[n..HEADER_SIZE], self.length64());
        n += varint::put_varint(&mut buf[n..HEADER_SIZE], self.offset);
        n += varint::put_varint(&mut buf[n..HEADER_SIZE], self.timestamp);
        n
    }

    /// Decodes a header from `buf`. Corrupt input decodes to arbitrary
    /// field values and is caught downstream by the id cross-check.
    pub fn decode(buf: &[u8]) -> Header {
        let mut n = 0;
        let (id, read) = varint::varint(&buf[n..]);
        n += read;
        let (length, read) = varint::varint(&buf[n..]);
        n += read;
        let (offset, read) = varint::varint(&buf[n..]);
        n += read;
        let (timestamp, _) = varint::varint(&buf[n..]);
        Header {
            id,
            offset,
            length: length as i32,
            timestamp,
        }
    }
}
