//! An auto-extending file: a backend prefixed with a `{magic, size}`
//! header and stepped capacity growth.
//!
//! # File layout
//!
//! ```text
//! +--------------------------+  0
//! | magic (8 bytes)          |
//! | size (big-endian i64)    |
//! +--------------------------+  FILE_HEADER_SIZE
//! | data region              |
//! +--------------------------+  FILE_HEADER_SIZE + size
//! | preallocated tail        |
//! +--------------------------+  capacity
//! ```
//!
//! Appends reserve their region with an atomic add on the logical size,
//! so concurrent appenders write to disjoint ranges without locking.
//! Capacity is installed by compare-and-swap and grows along a stepped
//! ladder that keeps at least a quarter of the file free, amortising
//! truncate calls. Only the header rewrite and the truncate itself are
//! serialised.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::backend::Backend;
use crate::error::Result;
use crate::Error;

/// Serialised size of the file header.
pub const FILE_HEADER_SIZE: usize = 16;

/// Capacity given to a freshly created file.
pub const INITIAL_CAP: i64 = 1024;

const MAGIC: [u8; 8] = [0xfa, 0xaf, 0x10, 0x94, 0x10, 0x28, 0x06, 0x16];

const S64MB: i64 = 64 << 20;
const S128MB: i64 = 128 << 20;
const S512MB: i64 = 512 << 20;
const S1GB: i64 = 1 << 30;
const S5GB: i64 = 5 << 30;
const S10GB: i64 = 10 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FileHeader {
    size: i64,
}

impl FileHeader {
    fn encode(&self, buf: &mut [u8; FILE_HEADER_SIZE]) {
        buf[..8].copy_from_slice(&MAGIC);
        BigEndian::write_i64(&mut buf[8..], self.size);
    }

    fn decode(buf: &[u8; FILE_HEADER_SIZE]) -> Result<Self> {
        if buf[..8] != MAGIC {
            return Err(Error::BadMagic);
        }
        Ok(Self {
            size: BigEndian::read_i64(&buf[8..]),
        })
    }
}

/// Returns the smallest capacity on the growth ladder that holds `need`
/// with at least a quarter of it left free.
fn nearest_cap(current: i64, need: i64) -> i64 {
    if current >= need && current - need >= current / 4 {
        return current;
    }
    if current >= S10GB {
        return nearest_cap(current + S5GB, need);
    }
    if current >= S1GB {
        return nearest_cap(current + S512MB, need);
    }
    if current >= S512MB {
        return nearest_cap(current + S128MB, need);
    }
    if current >= S64MB {
        return nearest_cap(current + S64MB, need);
    }
    let mut next = (need / 2) * 2;
    if next <= current {
        next = if current > 0 { current * 2 } else { INITIAL_CAP };
    }
    nearest_cap(next, need)
}

/// An auto-extending file over a [`Backend`].
pub struct File<B: Backend> {
    backend: B,
    size: AtomicI64,
    capacity: AtomicI64,
    header_buf: Mutex<[u8; FILE_HEADER_SIZE]>,
}

impl<B: Backend> std::fmt::Debug for File<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("size", &self.size.load(Ordering::SeqCst))
            .field("capacity", &self.capacity.load(Ordering::SeqCst))
            .finish()
    }
}

impl<B: Backend> File<B> {
    /// Opens a file over `backend`, initialising it if the backend is
    /// shorter than a header.
    pub fn open(backend: B) -> Result<Self> {
        let len = backend.size()?;
        let file = Self {
            backend,
            size: AtomicI64::new(0),
            capacity: AtomicI64::new(len),
            header_buf: Mutex::new([0; FILE_HEADER_SIZE]),
        };
        if len < FILE_HEADER_SIZE as i64 {
            file.backend.truncate(INITIAL_CAP)?;
            file.capacity.store(INITIAL_CAP, Ordering::SeqCst);
            file.write_header()?;
            debug!("created auto-extending file, capacity {INITIAL_CAP}");
            return Ok(file);
        }
        let mut buf = [0u8; FILE_HEADER_SIZE];
        file.backend.read_at(&mut buf, 0)?;
        let header = FileHeader::decode(&buf)?;
        file.size.store(header.size, Ordering::SeqCst);
        Ok(file)
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = self.header_buf.lock()?;
        let header = FileHeader {
            size: self.size.load(Ordering::SeqCst),
        };
        header.encode(&mut buf);
        self.backend.write_at(&buf[..], 0)?;
        Ok(())
    }

    /// Appends `bytes` to the data region and returns their offset.
    ///
    /// Safe under concurrent callers: each append owns the region it
    /// reserved with the atomic add on the size, so the writes land at
    /// disjoint ranges. On allocation or write failure the reservation
    /// is rolled back.
    pub fn append(&self, bytes: &[u8]) -> Result<i64> {
        let len = bytes.len() as i64;
        let end = self.size.fetch_add(len, Ordering::SeqCst) + len;
        if let Err(err) = self.alloc(end) {
            self.size.fetch_sub(len, Ordering::SeqCst);
            return Err(err);
        }
        let offset = end - len;
        if let Err(err) = self.backend.write_at(bytes, FILE_HEADER_SIZE as i64 + offset) {
            self.size.fetch_sub(len, Ordering::SeqCst);
            return Err(err.into());
        }
        self.write_header()?;
        Ok(offset)
    }

    /// Ensures the capacity holds `need` data bytes, growing along the
    /// step ladder. The new capacity is installed by compare-and-swap;
    /// a losing racer retries against the fresh value. The truncate is
    /// serialised with header rewrites and always targets the newest
    /// capacity, so the backing file never shrinks.
    fn alloc(&self, need: i64) -> Result<()> {
        loop {
            let current = self.capacity.load(Ordering::SeqCst);
            let next = nearest_cap(current, need);
            if next == current {
                return Ok(());
            }
            if self
                .capacity
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            debug!("extending file capacity {current} -> {next}");
            let _guard = self.header_buf.lock()?;
            let target = self.capacity.load(Ordering::SeqCst);
            self.backend.truncate(target)?;
            return Ok(());
        }
    }

    /// Reads `buf.len()` bytes from `offset` in the data region.
    /// Fails with [`Error::ShortRead`] when the range extends past the
    /// logical size.
    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<()> {
        if offset + buf.len() as i64 > self.size.load(Ordering::SeqCst) {
            return Err(Error::ShortRead);
        }
        self.backend.read_at(buf, FILE_HEADER_SIZE as i64 + offset)?;
        Ok(())
    }

    /// Writes `buf` at `offset` in the data region, extending the
    /// capacity if needed. Does not move the logical size; regions past
    /// it belong to in-flight appends.
    pub fn write_at(&self, buf: &[u8], offset: i64) -> Result<usize> {
        self.alloc(offset + buf.len() as i64)?;
        Ok(self
            .backend
            .write_at(buf, FILE_HEADER_SIZE as i64 + offset)?)
    }

    /// Persists the header and syncs the backend. After sync returns,
    /// all writes submitted before the call are durable.
    pub fn sync(&self) -> Result<()> {
        self.write_header()?;
        self.backend.sync()?;
        Ok(())
    }

    /// Persists the header and closes the backend.
    pub fn close(&self) -> Result<()> {
        self.write_header()?;
        self.backend.close()?;
        Ok(())
    }

    /// Logical size of the data region.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Length the backing file has been extended to.
    pub fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, ZeroBackend};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader { size: 104005 };
        let mut buf = [0u8; FILE_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(FileHeader::decode(&buf).expect("decode"), header);

        buf[2] += 1;
        assert_eq!(FileHeader::decode(&buf), Err(Error::BadMagic));
    }

    #[test]
    fn test_nearest_cap_steps() {
        assert_eq!(nearest_cap(0, 1025), 2048);
        // Enough slack already: capacity stays put.
        assert_eq!(nearest_cap(2048, 1025), 2048);
        assert_eq!(nearest_cap(1024, 100), 1024);
        // Above 64 MiB the ladder grows linearly.
        assert_eq!(nearest_cap(S64MB, S64MB), S64MB * 2);
        assert_eq!(nearest_cap(S1GB, S1GB), S1GB + S512MB);
    }

    #[test]
    fn test_nearest_cap_keeps_quarter_free() {
        let mut rng = StdRng::seed_from_u64(666);
        for _ in 0..1000 {
            let need = rng.gen_range(1..S1GB);
            let cap = nearest_cap(0, need);
            assert!(cap >= need);
            assert!(cap - need >= cap / 4, "cap {cap} need {need}");
        }
    }

    #[test]
    fn test_create_empty_then_append() {
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let file = File::open(FileBackend::open(tmp.path()).unwrap()).expect("open");
        assert_eq!(file.size(), 0);
        assert_eq!(file.capacity(), INITIAL_CAP);

        file.append(&[7u8; 5012]).expect("append");
        assert_eq!(file.size(), 5012);
        assert!(file.capacity() >= 5012);

        let mut buf = [0u8; 1024];
        file.read_at(&mut buf, 2048).expect("read");
        assert_eq!(buf, [7u8; 1024]);

        file.close().expect("close");
        let reopened = File::open(FileBackend::open(tmp.path()).unwrap()).expect("reopen");
        assert_eq!(reopened.size(), 5012);
    }

    #[test]
    fn test_sync_persists_size() {
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let file = File::open(FileBackend::open(tmp.path()).unwrap()).expect("open");
        file.append(&[1u8; 512]).expect("append");
        file.sync().expect("sync");

        // A second handle over the same path sees the synced size.
        let reopened = File::open(FileBackend::open(tmp.path()).unwrap()).expect("reopen");
        assert_eq!(reopened.size(), 512);
    }

    #[test]
    fn test_read_past_size() {
        let file = File::open(ZeroBackend).expect("open");
        file.append(&[0u8; 100]).expect("append");

        let mut buf = [0u8; 64];
        assert_eq!(file.read_at(&mut buf, 64), Err(Error::ShortRead));
        file.read_at(&mut buf, 36).expect("read inside size");
    }

    #[test]
    fn test_bad_magic_on_foreign_file() {
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let backend = FileBackend::open(tmp.path()).unwrap();
        backend
            .write_at(b"definitely not a silo file header", 0)
            .unwrap();
        assert_eq!(File::open(backend).unwrap_err(), Error::BadMagic);
    }

    #[test]
    fn test_write_at_extends_capacity() {
        let file = File::open(ZeroBackend).expect("open");
        file.write_at(&[1u8; 128], 4096).expect("write_at");
        assert!(file.capacity() >= 4096 + 128);
    }

    #[test]
    fn test_append_parallel() {
        use std::sync::atomic::AtomicUsize;

        let mut rng = StdRng::seed_from_u64(666);
        let sizes: Vec<usize> = (0..1024).map(|_| rng.gen_range(0..1024 * 1024)).collect();
        let sum: i64 = sizes.iter().map(|&s| s as i64).sum();
        let max = sizes.iter().copied().max().unwrap_or(0);

        let file = File::open(ZeroBackend).expect("open");
        let next = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..20 {
                scope.spawn(|| {
                    let buf = vec![0u8; max];
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        if i >= sizes.len() {
                            break;
                        }
                        file.append(&buf[..sizes[i]]).expect("append");
                    }
                });
            }
        });

        assert_eq!(file.size(), sum);
        assert!(file.capacity() >= file.size());
    }
}
