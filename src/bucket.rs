//! The append-only data region holding `(Header, payload)` records.
//!
//! Offsets are handed out by [`Bucket::allocate`]: an atomic reservation
//! on the logical size, with coarse preallocation that keeps at least
//! [`MIN_FREE_RATE`] of the capacity free. Concurrent callers therefore
//! own disjoint regions and write without coordination; only the
//! capacity-growing truncate is serialised.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::backend::Backend;
use crate::bufpool;
use crate::error::{Result, Site};
use crate::header::{Header, HEADER_SIZE};
use crate::index::Link;
use crate::Error;

/// Minimum fraction of the capacity kept free; crossing it triggers
/// preallocation to twice the used size.
pub const MIN_FREE_RATE: f64 = 0.2;

/// The data region of a volume.
pub struct Bucket<B: Backend> {
    backend: B,
    size: AtomicI64,
    capacity: AtomicI64,
    grow_lock: Mutex<()>,
}

impl<B: Backend> std::fmt::Debug for Bucket<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("size", &self.size.load(Ordering::SeqCst))
            .field("capacity", &self.capacity.load(Ordering::SeqCst))
            .finish()
    }
}

impl<B: Backend> Bucket<B> {
    /// Opens a bucket over `backend`, deriving the capacity from the
    /// backend length. The logical size starts at zero; restoring the
    /// append position of an existing bucket is the caller's concern
    /// (see [`Bucket::set_size`]).
    pub fn new(backend: B) -> Result<Self> {
        let capacity = backend
            .size()
            .map_err(|err| Error::backend(err, Site::Bucket))?;
        Ok(Self {
            backend,
            size: AtomicI64::new(0),
            capacity: AtomicI64::new(capacity),
            grow_lock: Mutex::new(()),
        })
    }

    /// Reserves `size` bytes and returns their offset.
    ///
    /// Safe under concurrent callers: each reservation is an atomic add,
    /// so the returned regions are disjoint. When the used fraction
    /// crosses the growth threshold the backend is preallocated to twice
    /// the used size; on preallocation failure the reservation is rolled
    /// back. The payload must subsequently be written at the returned
    /// offset.
    pub fn allocate(&self, size: i64) -> Result<i64> {
        let used = self.size.fetch_add(size, Ordering::SeqCst) + size;
        if self.low_free(used) {
            if let Err(err) = self.preallocate(used * 2) {
                self.size.fetch_sub(size, Ordering::SeqCst);
                return Err(err);
            }
        }
        Ok(used - size)
    }

    fn low_free(&self, used: i64) -> bool {
        let capacity = self.capacity.load(Ordering::SeqCst);
        if capacity == 0 {
            return true;
        }
        ((capacity - used) as f64) / (capacity as f64) < MIN_FREE_RATE
    }

    /// Grows the backend to `size` bytes ahead of demand.
    pub fn preallocate(&self, size: i64) -> Result<()> {
        let _guard = self.grow_lock.lock()?;
        self.backend
            .truncate(size)
            .map_err(|err| Error::backend(err, Site::Bucket))?;
        debug!("bucket preallocated to {size} bytes");
        self.capacity.store(size, Ordering::SeqCst);
        Ok(())
    }

    /// Reads the header referenced by `link` and cross-checks its id.
    pub fn read_header(&self, link: Link, buf: &mut Vec<u8>) -> Result<Header> {
        buf.resize(HEADER_SIZE, 0);
        self.backend
            .read_at(&mut buf[..HEADER_SIZE], link.offset)
            .map_err(|err| Error::backend(err, Site::Bucket))?;
        let header = Header::decode(&buf[..HEADER_SIZE]);
        if header.id != link.id {
            return Err(Error::id_mismatch(header.id, link.id, Site::Bucket));
        }
        Ok(header)
    }

    /// Reads the raw header at a bucket offset, without a link
    /// cross-check. Used when scanning the bucket to rebuild an index.
    pub fn header_at(&self, offset: i64, buf: &mut Vec<u8>) -> Result<Header> {
        buf.resize(HEADER_SIZE, 0);
        self.backend
            .read_at(&mut buf[..HEADER_SIZE], offset)
            .map_err(|err| Error::backend(err, Site::Bucket))?;
        Ok(Header::decode(&buf[..HEADER_SIZE]))
    }

    /// Reads `header.length` payload bytes into `buf`.
    pub fn read_data(&self, header: &Header, buf: &mut Vec<u8>) -> Result<()> {
        buf.resize(header.length as usize, 0);
        self.backend
            .read_at(buf, header.data_offset())
            .map_err(|err| Error::backend(err, Site::Bucket))?;
        Ok(())
    }

    /// Writes `header` and the payload in `data` to the bucket.
    ///
    /// The header is serialised over the first `HEADER_SIZE` bytes of
    /// `data` for the header write and the original bytes are restored
    /// before the payload write, so the same buffer serves both writes
    /// without an extra allocation. `data` is byte-for-byte intact on
    /// return, success or failure. Payloads shorter than `HEADER_SIZE`
    /// are staged through a pooled copy first.
    ///
    /// Panics if `header.length` exceeds `data.len()`.
    pub fn write(&self, header: &Header, data: &mut [u8]) -> Result<()> {
        let length = header.length as usize;
        if data.len() < HEADER_SIZE {
            let mut staged = bufpool::acquire_data_buffer();
            staged.extend_from_slice(data);
            staged.resize(HEADER_SIZE, 0);
            return self.write_overlayed(header, &mut staged, length);
        }
        self.write_overlayed(header, data, length)
    }

    fn write_overlayed(&self, header: &Header, data: &mut [u8], length: usize) -> Result<()> {
        let mut saved = [0u8; HEADER_SIZE];
        saved.copy_from_slice(&data[..HEADER_SIZE]);
        header.encode(&mut data[..HEADER_SIZE]);
        let written = self.backend.write_at(&data[..HEADER_SIZE], header.offset);
        data[..HEADER_SIZE].copy_from_slice(&saved);
        written.map_err(|err| Error::backend(err, Site::Bucket))?;
        self.backend
            .write_at(&data[..length], header.data_offset())
            .map_err(|err| Error::backend(err, Site::Bucket))?;
        Ok(())
    }

    /// Logical next-allocation offset.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Bytes preallocated on disk.
    pub fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Restores the logical append position, e.g. when reopening a
    /// bucket whose size is tracked by external metadata.
    pub fn set_size(&self, size: i64) {
        self.size.store(size, Ordering::SeqCst);
    }
}
