use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Largest backing store a ring will ever allocate.
pub const MAX_CAPACITY: usize = isize::MAX as usize;

const MIN_CAPACITY: usize = 2;

struct Inner {
    storage: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Inner {
    fn size(&self) -> usize {
        self.storage.len()
    }

    fn count(&self) -> usize {
        let size = self.size();
        (self.head + size - self.tail) % size
    }

    fn space_left(&self) -> usize {
        self.size() - 1 - self.count()
    }

    /// Copy the stored bytes into a fresh store of `new_size`, oldest first.
    fn relocate(&mut self, new_size: usize) {
        let stored = self.count();
        let mut storage = vec![0u8; new_size];
        let (first, second) = self.segments(stored);
        storage[..first.len()].copy_from_slice(first);
        storage[first.len()..stored].copy_from_slice(second);
        self.storage = storage;
        self.tail = 0;
        self.head = stored;
    }

    /// The first `len` readable bytes, split at the wrap point.
    fn segments(&self, len: usize) -> (&[u8], &[u8]) {
        let size = self.size();
        let first_len = len.min(size - self.tail);
        (
            &self.storage[self.tail..self.tail + first_len],
            &self.storage[..len - first_len],
        )
    }

    fn push(&mut self, data: &[u8]) {
        let size = self.size();
        let first_len = data.len().min(size - self.head);
        self.storage[self.head..self.head + first_len].copy_from_slice(&data[..first_len]);
        self.storage[..data.len() - first_len].copy_from_slice(&data[first_len..]);
        self.head = (self.head + data.len()) % size;
    }
}

/// Growable circular byte buffer shared between one producer and one consumer.
///
/// One slot of the backing store is always left unused so that `head == tail`
/// means empty and `head + 1 == tail` means full. Writes never block and never
/// drop data: when a write does not fit, the store is doubled (saturating at
/// the maximum capacity) before copying. Every operation takes the
/// per-instance lock, so the buffer can sit behind an `Arc` with the encoder
/// writing on one thread and a sink draining it on another.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    max_capacity: usize,
}

impl RingBuffer {
    /// Create a ring with a backing store of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::with_max_capacity(capacity, MAX_CAPACITY)
    }

    /// Create a ring that refuses to grow past `max_capacity` bytes.
    pub fn with_max_capacity(capacity: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(MIN_CAPACITY);
        let capacity = capacity.clamp(MIN_CAPACITY, max_capacity);
        Self {
            inner: Mutex::new(Inner {
                storage: vec![0u8; capacity],
                head: 0,
                tail: 0,
            }),
            max_capacity,
        }
    }

    /// Append `data`, growing the backing store first if it does not fit.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.space_left() < data.len() {
            let needed = inner
                .count()
                .checked_add(data.len() + 1)
                .ok_or(Error::AtMaximum {
                    capacity: self.max_capacity,
                })?;
            self.grow(&mut inner, needed)?;
        }
        inner.push(data);
        trace!("ring: wrote {} bytes, {} stored", data.len(), inner.count());
        Ok(())
    }

    /// Append as much of `data` as fits without growing. Returns the number
    /// of bytes accepted.
    pub fn write_available(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let accepted = data.len().min(inner.space_left());
        inner.push(&data[..accepted]);
        accepted
    }

    /// Copy up to `buf.len()` bytes out, oldest first. Returns 0 when empty.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let len = buf.len().min(inner.count());
        if len == 0 {
            return 0;
        }
        let (first, second) = inner.segments(len);
        buf[..first.len()].copy_from_slice(first);
        buf[first.len()..len].copy_from_slice(second);
        inner.tail = (inner.tail + len) % inner.size();
        len
    }

    /// Move the stored bytes into a backing store of `new_size` bytes.
    ///
    /// The new store must keep every stored byte plus the unused slot, and
    /// may not exceed the maximum capacity.
    pub fn resize(&self, new_size: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let stored = inner.count();
        if new_size <= stored {
            return Err(Error::Capacity {
                requested: new_size,
                stored,
            });
        }
        if new_size > self.max_capacity {
            return Err(Error::AtMaximum {
                capacity: self.max_capacity,
            });
        }
        inner.relocate(new_size);
        Ok(())
    }

    /// Discard everything currently stored.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.tail = inner.head;
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.head == inner.tail
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        (inner.head + 1) % inner.size() == inner.tail
    }

    /// Bytes that can be written without growing.
    pub fn space_left(&self) -> usize {
        self.inner.lock().space_left()
    }

    /// Bytes stored and not yet read.
    pub fn count(&self) -> usize {
        self.inner.lock().count()
    }

    /// Size of the backing store, including the unused slot.
    pub fn capacity(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn can_write(&self, count: usize) -> bool {
        self.space_left() >= count
    }

    fn grow(&self, inner: &mut Inner, needed: usize) -> Result<()> {
        let mut new_size = inner.size();
        while new_size < needed {
            if new_size >= self.max_capacity {
                return Err(Error::AtMaximum {
                    capacity: self.max_capacity,
                });
            }
            new_size = new_size
                .checked_mul(2)
                .map_or(self.max_capacity, |doubled| doubled.min(self.max_capacity));
        }
        debug!("ring: growing from {} to {} bytes", inner.size(), new_size);
        inner.relocate(new_size);
        Ok(())
    }
}
