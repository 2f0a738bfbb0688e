//! Pooled growable byte buffers.
//!
//! Two independent pools keep capacities distinct: a data-sized pool for
//! payload staging and an index-sized pool for link slots. Buffers are
//! handed out as [`PoolBuf`] guards; dropping the guard resets the
//! buffer to zero length and returns it to its pool, so released bytes
//! cannot be referenced afterwards.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Initial capacity of data-pool buffers.
const DATA_BUFFER_SIZE: usize = 300 * 1024;

/// Initial capacity of index-pool buffers.
const INDEX_BUFFER_SIZE: usize = 128;

static DATA_POOL: Pool = Pool::new(DATA_BUFFER_SIZE);
static INDEX_POOL: Pool = Pool::new(INDEX_BUFFER_SIZE);

/// Returns an empty buffer from the data pool.
pub fn acquire_data_buffer() -> PoolBuf {
    DATA_POOL.get()
}

/// Returns an empty buffer from the index pool.
pub fn acquire_index_buffer() -> PoolBuf {
    INDEX_POOL.get()
}

struct Pool {
    initial: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Pool {
    const fn new(initial: usize) -> Self {
        Pool {
            initial,
            free: Mutex::new(Vec::new()),
        }
    }

    fn get(&'static self) -> PoolBuf {
        let buf = match self.free.lock() {
            Ok(mut free) => free
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(self.initial)),
            Err(_) => Vec::with_capacity(self.initial),
        };
        PoolBuf { buf, pool: self }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }
}

/// A pooled buffer, exclusively owned until dropped.
pub struct PoolBuf {
    buf: Vec<u8>,
    pool: &'static Pool,
}

impl Deref for PoolBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
