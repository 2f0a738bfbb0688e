//! Positional byte stores that the storage components run on.
//!
//! A [`Backend`] is safe for concurrent positional reads and writes to
//! non-overlapping regions; `truncate` and `sync` are serialised by the
//! calling component.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

/// Abstract positional IO used by every storage component.
pub trait Backend {
    /// Fills `buf` from `offset`, or fails. A short read is an error.
    fn read_at(&self, buf: &mut [u8], offset: i64) -> io::Result<()>;

    /// Writes all of `buf` at `offset`, returning the number of bytes
    /// written.
    fn write_at(&self, buf: &[u8], offset: i64) -> io::Result<usize>;

    /// Changes the size of the store, zero-filling on growth.
    fn truncate(&self, size: i64) -> io::Result<()>;

    /// Commits the current contents to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Releases the store. Operations after close may fail.
    fn close(&self) -> io::Result<()>;

    /// Returns the current size of the store in bytes.
    fn size(&self) -> io::Result<i64>;
}

/// An OS file backend using positional reads and writes.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Opens (or creates) the file at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Wraps an already-open file handle.
    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl Backend for FileBackend {
    fn read_at(&self, buf: &mut [u8], offset: i64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset as u64)
    }

    fn write_at(&self, buf: &[u8], offset: i64) -> io::Result<usize> {
        self.file.write_all_at(buf, offset as u64)?;
        Ok(buf.len())
    }

    fn truncate(&self, size: i64) -> io::Result<()> {
        self.file.set_len(size as u64)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn close(&self) -> io::Result<()> {
        // The descriptor itself is released on drop; close guarantees
        // everything written so far has reached the device.
        self.file.sync_all()
    }

    fn size(&self) -> io::Result<i64> {
        Ok(self.file.metadata()?.len() as i64)
    }
}

/// An in-memory backend for hermetic tests.
///
/// A failure injected with [`MemBackend::fail_with`] is returned by
/// every subsequent operation until cleared, which makes error paths
/// reachable without a faulty disk.
#[derive(Debug, Default)]
pub struct MemBackend {
    data: Mutex<Vec<u8>>,
    fail: Mutex<Option<String>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a backend over existing bytes, e.g. a snapshot of
    /// another backend.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            fail: Mutex::new(None),
        }
    }

    /// Makes every subsequent operation fail with `cause`.
    pub fn fail_with(&self, cause: &str) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = Some(cause.to_string());
        }
    }

    /// Clears an injected failure.
    pub fn clear_failure(&self) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = None;
        }
    }

    /// Returns a copy of the stored bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().map(|data| data.clone()).unwrap_or_default()
    }

    fn check(&self) -> io::Result<()> {
        let fail = self
            .fail
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "backend mutex poisoned"))?;
        match &*fail {
            Some(cause) => Err(io::Error::new(io::ErrorKind::Other, cause.clone())),
            None => Ok(()),
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.data
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "backend mutex poisoned"))
    }
}

impl Backend for MemBackend {
    fn read_at(&self, buf: &mut [u8], offset: i64) -> io::Result<()> {
        self.check()?;
        let data = self.lock()?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of memory backend",
            ));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: i64) -> io::Result<usize> {
        self.check()?;
        let mut data = self.lock()?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, size: i64) -> io::Result<()> {
        self.check()?;
        let mut data = self.lock()?;
        data.resize(size as usize, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.check()
    }

    fn close(&self) -> io::Result<()> {
        self.check()
    }

    fn size(&self) -> io::Result<i64> {
        self.check()?;
        Ok(self.lock()?.len() as i64)
    }
}

/// A sink that accepts every write and reads back zeroes.
///
/// Used by allocation-heavy benchmarks and concurrency tests where the
/// stored bytes are irrelevant.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroBackend;

impl Backend for ZeroBackend {
    fn read_at(&self, buf: &mut [u8], _offset: i64) -> io::Result<()> {
        buf.fill(0);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], _offset: i64) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn truncate(&self, _size: i64) -> io::Result<()> {
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn size(&self) -> io::Result<i64> {
        Ok(0)
    }
}
