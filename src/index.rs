//! The lookup table mapping object ids to bucket offsets.
//!
//! The index is a fixed-stride array of [`Link`] slots in its backend,
//! so slot `k` lives at byte `k * LINK_SIZE` and every lookup is a
//! single positional read. Ids are assigned by atomically incrementing
//! `last_id`; the backing file is grown ahead of demand by doubling
//! whenever the highest id comes within [`MIN_INDEX_FREE`] slots of the
//! preallocated capacity.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::backend::Backend;
use crate::bufpool;
use crate::error::{Result, Site};
use crate::varint;
use crate::Error;

/// Serialised size of a [`Link`] slot.
pub const LINK_SIZE: usize = 16;

/// Minimum number of free slots kept between `last_id` and capacity.
pub const MIN_INDEX_FREE: i64 = 10;

/// Capacity growth factor applied on preallocation.
const PREALLOCATE_RATE: i64 = 2;

/// An index entry linking an object id to the bucket offset of its
/// header. The collection of links defines the O(1) mapping
/// `id -> offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Link {
    pub id: i64,
    pub offset: i64,
}

impl Link {
    /// Encodes the link into `buf`, returning the number of bytes used.
    ///
    /// Panics if `buf` is shorter than `LINK_SIZE`.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        n += varint::put_varint(&mut buf[n..LINK_SIZE], self.id);
        n += varint::put_varint(&mut buf[n..LINK_SIZE], self.offset);
        n
    }

    /// Decodes a link from `buf`.
    pub fn decode(buf: &[u8]) -> Link {
        let (id, read) = varint::varint(buf);
        let (offset, _) = varint::varint(&buf[read..]);
        Link { id, offset }
    }
}

/// Returns the byte offset of slot `id`. Ids start from 0, so
/// `slot_offset(0) == 0` and `slot_offset(1) == LINK_SIZE`.
pub fn slot_offset(id: i64) -> i64 {
    id * LINK_SIZE as i64
}

/// The id-to-offset lookup table of a volume.
pub struct Index<B: Backend> {
    backend: B,
    last_id: AtomicI64,
    capacity: AtomicI64,
    grow_lock: Mutex<()>,
}

impl<B: Backend> std::fmt::Debug for Index<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("last_id", &self.last_id.load(Ordering::SeqCst))
            .field("capacity", &self.capacity.load(Ordering::SeqCst))
            .finish()
    }
}

impl<B: Backend> Index<B> {
    /// Opens an index over `backend`, deriving the preallocated
    /// capacity from the backend length.
    pub fn new(backend: B) -> Result<Self> {
        let size = backend
            .size()
            .map_err(|err| Error::backend(err, Site::Index))?;
        Ok(Self {
            backend,
            last_id: AtomicI64::new(0),
            capacity: AtomicI64::new(size / LINK_SIZE as i64),
            grow_lock: Mutex::new(()),
        })
    }

    /// Claims a new id, growing the index ahead of demand.
    ///
    /// Safe to call concurrently: the id is reserved with an atomic
    /// increment and preallocation serialises on the index mutex. If
    /// preallocation fails the reservation is rolled back. Does not
    /// sync the backend.
    pub fn next_id(&self) -> Result<i64> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.near_capacity(id) {
            return Ok(id);
        }
        if let Err(err) = self.preallocate(id * PREALLOCATE_RATE) {
            self.last_id.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        Ok(id)
    }

    fn near_capacity(&self, id: i64) -> bool {
        id + MIN_INDEX_FREE >= self.capacity.load(Ordering::SeqCst)
    }

    /// Grows the backing file to hold `count` links. Durability is the
    /// caller's concern.
    pub fn preallocate(&self, count: i64) -> Result<()> {
        let _guard = self.grow_lock.lock()?;
        self.backend
            .truncate(count * LINK_SIZE as i64)
            .map_err(|err| Error::backend(err, Site::Index))?;
        debug!("index preallocated to {count} slots");
        self.capacity.store(count, Ordering::SeqCst);
        Ok(())
    }

    /// Reads the link stored under `id` through `buf`.
    pub fn read(&self, id: i64, buf: &mut Vec<u8>) -> Result<Link> {
        buf.resize(LINK_SIZE, 0);
        self.backend
            .read_at(&mut buf[..LINK_SIZE], slot_offset(id))
            .map_err(|err| Error::backend(err, Site::Index))?;
        Ok(Link::decode(&buf[..LINK_SIZE]))
    }

    /// Writes `link` into its slot through `buf`.
    pub fn write(&self, link: Link, buf: &mut Vec<u8>) -> Result<()> {
        buf.resize(LINK_SIZE, 0);
        link.encode(&mut buf[..LINK_SIZE]);
        self.backend
            .write_at(&buf[..LINK_SIZE], slot_offset(link.id))
            .map_err(|err| Error::backend(err, Site::Index))?;
        Ok(())
    }

    /// Invokes `f` for every link in `0..=until_id`, reusing one pooled
    /// buffer across the iteration.
    pub fn walk<F>(&self, until_id: i64, mut f: F) -> Result<()>
    where
        F: FnMut(i64, Link) -> Result<()>,
    {
        let mut buf = bufpool::acquire_index_buffer();
        for id in 0..=until_id {
            let link = self.read(id, &mut buf)?;
            f(id, link)?;
        }
        Ok(())
    }

    /// Highest assigned id.
    pub fn last_id(&self) -> i64 {
        self.last_id.load(Ordering::SeqCst)
    }

    /// Number of slots preallocated on disk.
    pub fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Restores the id counter, e.g. after an index rebuild.
    pub fn set_last_id(&self, id: i64) {
        self.last_id.store(id, Ordering::SeqCst);
    }
}
