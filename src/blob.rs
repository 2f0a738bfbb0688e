//! A standalone data file with a checksummed, capacity-aware header.
//!
//! # Header layout
//!
//! ```text
//! +---------------------------+  0
//! | magic (8 bytes)           |
//! | size (varint, 8 bytes)    |
//! | capacity (varint, 8 bytes)|
//! | crc32 (varint, 8 bytes)   |
//! +---------------------------+  BLOB_HEADER_SIZE
//! | data slices               |
//! +---------------------------+
//! ```
//!
//! The CRC-32/IEEE checksum covers the first 24 header bytes, so a
//! corrupted or foreign file is rejected at open instead of producing
//! garbage offsets. Allocation is a bare atomic reservation; regions
//! handed to concurrent callers are disjoint by construction.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crc::{Crc, CRC_32_ISO_HDLC};
use log::debug;

use crate::backend::{Backend, FileBackend};
use crate::error::Result;
use crate::varint;
use crate::Error;

/// Serialised size of the blob header.
pub const BLOB_HEADER_SIZE: usize = 32;

/// Initial capacity for a newly created blob.
pub const DEFAULT_BLOB_SIZE: i64 = 1024;

const MAGIC: [u8; 8] = [0xbb, 0xba, 0xbd, 0xbb, 0x13, 0x37, 0x20, 0x16];

/// CRC-32/IEEE, as used for the header checksum.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Persisted blob state: logical size and preallocated capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobHeader {
    pub size: i64,
    pub capacity: i64,
}

impl BlobHeader {
    /// Encodes the header into `buf`, returning the number of bytes
    /// written. Each numeric field occupies a fixed 8-byte slot.
    ///
    /// Panics if `buf` is shorter than `BLOB_HEADER_SIZE`.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[..8].copy_from_slice(&MAGIC);
        buf[8..BLOB_HEADER_SIZE].fill(0);
        varint::put_varint(&mut buf[8..16], self.size);
        varint::put_varint(&mut buf[16..24], self.capacity);
        let crc = CRC32.checksum(&buf[..24]);
        varint::put_uvarint(&mut buf[24..BLOB_HEADER_SIZE], u64::from(crc));
        BLOB_HEADER_SIZE
    }

    /// Decodes and validates a header: magic first, checksum second.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOB_HEADER_SIZE || buf[..8] != MAGIC {
            return Err(Error::BadMagic);
        }
        let (size, _) = varint::varint(&buf[8..16]);
        let (capacity, _) = varint::varint(&buf[16..24]);
        let expected = CRC32.checksum(&buf[..24]);
        let (crc, _) = varint::uvarint(&buf[24..BLOB_HEADER_SIZE]);
        if crc != u64::from(expected) {
            return Err(Error::BadCrc);
        }
        Ok(Self { size, capacity })
    }
}

/// Configuration for blob creation.
#[derive(Debug, Clone, Copy)]
pub struct BlobOptions {
    /// Capacity given to a newly created blob (default: 1024).
    pub initial_size: i64,
}

impl Default for BlobOptions {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_BLOB_SIZE,
        }
    }
}

impl BlobOptions {
    /// Set the initial capacity for blob creation.
    pub fn initial_size(mut self, size: i64) -> Self {
        self.initial_size = size;
        self
    }
}

/// A set of data slices on top of a [`Backend`], with a checksummed
/// header tracking the logical size.
pub struct Blob<B: Backend> {
    backend: B,
    size: AtomicI64,
    capacity: AtomicI64,
    header_buf: Mutex<[u8; BLOB_HEADER_SIZE]>,
}

impl<B: Backend> std::fmt::Debug for Blob<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("size", &self.size.load(Ordering::SeqCst))
            .field("capacity", &self.capacity.load(Ordering::SeqCst))
            .finish()
    }
}

impl<B: Backend> Blob<B> {
    /// Opens a blob over `backend`, creating it when the backend is
    /// empty and validating the header otherwise.
    pub fn open(backend: B, options: BlobOptions) -> Result<Self> {
        let len = backend.size()?;
        let blob = Self {
            backend,
            size: AtomicI64::new(0),
            capacity: AtomicI64::new(len),
            header_buf: Mutex::new([0; BLOB_HEADER_SIZE]),
        };
        if len == 0 {
            blob.truncate(options.initial_size)?;
            debug!("created blob, capacity {}", options.initial_size);
        } else {
            blob.read_header()?;
        }
        Ok(blob)
    }

    fn read_header(&self) -> Result<()> {
        let mut buf = self.header_buf.lock()?;
        self.backend.read_at(&mut buf[..], 0)?;
        let header = BlobHeader::decode(&buf[..])?;
        if header.capacity > self.capacity.load(Ordering::SeqCst) {
            return Err(Error::BadCapacity);
        }
        self.size.store(header.size, Ordering::SeqCst);
        Ok(())
    }

    /// Rewrites the header with a fresh checksum. The first header
    /// write after creation claims the header bytes: a zero size is
    /// forced to `BLOB_HEADER_SIZE`.
    fn write_header(&self, buf: &mut [u8; BLOB_HEADER_SIZE]) -> Result<()> {
        let header = BlobHeader {
            size: self.size.load(Ordering::SeqCst),
            capacity: self.capacity.load(Ordering::SeqCst),
        };
        header.encode(&mut buf[..]);
        self.backend.write_at(&buf[..], 0)?;
        if self.size.load(Ordering::SeqCst) == 0 {
            self.size.store(BLOB_HEADER_SIZE as i64, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Reserves `size` bytes and returns their offset. After
    /// allocation it is safe to `write_at` the returned offset.
    ///
    /// Safe to call concurrently; reservations are atomic and
    /// disjoint.
    pub fn allocate(&self, size: i64) -> Result<i64> {
        Ok(self.size.fetch_add(size, Ordering::SeqCst))
    }

    /// Changes the capacity of the blob and persists the header.
    pub fn truncate(&self, size: i64) -> Result<()> {
        let mut buf = self.header_buf.lock()?;
        self.backend.truncate(size)?;
        self.capacity.store(size, Ordering::SeqCst);
        self.write_header(&mut buf)
    }

    /// Persists the header and commits the blob contents to stable
    /// storage.
    pub fn sync(&self) -> Result<()> {
        let mut buf = self.header_buf.lock()?;
        self.write_header(&mut buf)?;
        self.backend.sync()?;
        Ok(())
    }

    /// Syncs and closes the blob, rendering it unusable for changes.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        self.backend.close()?;
        Ok(())
    }

    /// Logical size, including the header bytes.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Capacity the backing store has been extended to.
    pub fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// The underlying backend, for positional data access.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl Blob<FileBackend> {
    /// Opens or creates a blob at `path`.
    pub fn open_path(path: impl AsRef<Path>, options: BlobOptions) -> Result<Self> {
        Self::open(FileBackend::open(path)?, options)
    }
}
