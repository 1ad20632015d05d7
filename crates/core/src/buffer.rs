//! Shared buffer pool
//!
//! All I/O in Crystal moves bytes through pooled buffers:
//!
//! - [`BufferPool::rent`] hands out a uniquely owned, writable [`BufferOwner`]
//!   whose capacity is rounded up to a power-of-two size class.
//! - [`BufferOwner::freeze`] turns it into an immutable, reference-counted
//!   [`SharedBuffer`]. Clones share the same bytes.
//! - The backing allocation goes back to its size class only when the last
//!   holder drops. Each class keeps at most `max_per_class` buffers; surplus
//!   buffers are freed.
//!
//! Renting never fails: an empty class or an oversized request falls back to a
//! fresh allocation.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Smallest size class (64 B)
pub const MIN_CLASS_SHIFT: u32 = 6;

/// Largest pooled size class (16 MiB)
pub const MAX_CLASS_SHIFT: u32 = 24;

/// Default number of cached buffers per size class
pub const DEFAULT_MAX_PER_CLASS: usize = 32;

const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

static GLOBAL_POOL: Lazy<BufferPool> = Lazy::new(|| BufferPool::new(DEFAULT_MAX_PER_CLASS));

/// Size class index for a requested length, `None` when too large to pool
fn class_of(len: usize) -> Option<usize> {
    let shift = len.max(1).next_power_of_two().trailing_zeros().max(MIN_CLASS_SHIFT);
    if shift > MAX_CLASS_SHIFT {
        None
    } else {
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}

fn class_capacity(class: usize) -> usize {
    1usize << (class as u32 + MIN_CLASS_SHIFT)
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total `rent` calls
    pub rented: u64,
    /// Rents served from a cached buffer
    pub reused: u64,
    /// Buffers accepted back into a class
    pub returned: u64,
    /// Buffers freed because their class was full
    pub discarded: u64,
}

struct PoolInner {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    max_per_class: usize,
    rented: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn take(&self, class: usize) -> Vec<u8> {
        self.rented.fetch_add(1, Ordering::Relaxed);
        if let Some(buf) = self.classes[class].lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        Vec::with_capacity(class_capacity(class))
    }

    fn give_back(&self, class: usize, mut buf: Vec<u8>) {
        // Only exact-capacity buffers re-enter the class; anything that grew is freed.
        if buf.capacity() != class_capacity(class) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        let mut slot = self.classes[class].lock();
        if slot.len() < self.max_per_class {
            slot.push(buf);
            self.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Size-classed pool of byte buffers
///
/// Cloning a `BufferPool` yields another handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool caching at most `max_per_class` buffers per class
    pub fn new(max_per_class: usize) -> Self {
        let classes = (0..CLASS_COUNT).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            inner: Arc::new(PoolInner {
                classes,
                max_per_class,
                rented: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide pool
    pub fn global() -> &'static BufferPool {
        &GLOBAL_POOL
    }

    /// Buffers cached per size class before returns are discarded
    pub fn max_per_class(&self) -> usize {
        self.inner.max_per_class
    }

    /// Rent an empty buffer with capacity for at least `min_len` bytes
    pub fn rent(&self, min_len: usize) -> BufferOwner {
        match class_of(min_len) {
            Some(class) => BufferOwner {
                data: self.inner.take(class),
                class: Some(class),
                pool: Arc::clone(&self.inner),
            },
            None => {
                self.inner.rented.fetch_add(1, Ordering::Relaxed);
                BufferOwner {
                    data: Vec::with_capacity(min_len),
                    class: None,
                    pool: Arc::clone(&self.inner),
                }
            }
        }
    }

    /// Rent a buffer, fill it with `bytes` and freeze it
    pub fn copy_from(&self, bytes: &[u8]) -> SharedBuffer {
        let mut owner = self.rent(bytes.len());
        owner.extend_from_slice(bytes);
        owner.freeze()
    }

    /// Number of buffers currently cached for a given request length
    pub fn cached_for(&self, len: usize) -> usize {
        class_of(len)
            .map(|class| self.inner.classes[class].lock().len())
            .unwrap_or(0)
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.inner.rented.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_per_class", &self.inner.max_per_class)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Uniquely held, writable pooled buffer
///
/// Dropping it returns the allocation to the pool.
pub struct BufferOwner {
    data: Vec<u8>,
    class: Option<usize>,
    pool: Arc<PoolInner>,
}

impl BufferOwner {
    /// Current length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated capacity
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Append bytes
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Resize, zero-filling new bytes
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Shorten to `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Writable view of the content
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read-only view of the content
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Make the buffer immutable and shareable
    pub fn freeze(mut self) -> SharedBuffer {
        let data = std::mem::take(&mut self.data);
        SharedBuffer {
            inner: Arc::new(SharedInner {
                data,
                class: self.class.take(),
                pool: Some(Arc::clone(&self.pool)),
            }),
        }
    }
}

impl Drop for BufferOwner {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            self.pool.give_back(class, std::mem::take(&mut self.data));
        }
    }
}

impl io::Write for BufferOwner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for BufferOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferOwner")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

struct SharedInner {
    data: Vec<u8>,
    class: Option<usize>,
    pool: Option<Arc<PoolInner>>,
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        if let (Some(class), Some(pool)) = (self.class, self.pool.as_ref()) {
            pool.give_back(class, std::mem::take(&mut self.data));
        }
    }
}

/// Immutable, reference-counted byte buffer
///
/// Equality compares content, never identity.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<SharedInner>,
}

impl SharedBuffer {
    /// A buffer with no content
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Wrap an unpooled vector
    pub fn from_vec(data: Vec<u8>) -> Self {
        SharedBuffer {
            inner: Arc::new(SharedInner {
                data,
                class: None,
                pool: None,
            }),
        }
    }

    /// Another handle to the same bytes
    pub fn share(&self) -> SharedBuffer {
        self.clone()
    }

    /// Number of holders currently sharing these bytes
    pub fn sharers(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles point at the same allocation
    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Content view
    pub fn as_slice(&self) -> &[u8] {
        &self.inner.data
    }

    /// Copy into a freshly rented, writable buffer
    pub fn to_owner(&self, pool: &BufferPool) -> BufferOwner {
        let mut owner = pool.rent(self.len());
        owner.extend_from_slice(self.as_slice());
        owner
    }
}

impl Deref for SharedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner.data
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner.data
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.as_slice() == other.as_slice()
    }
}

impl Eq for SharedBuffer {}

impl From<Vec<u8>> for SharedBuffer {
    fn from(data: Vec<u8>) -> Self {
        SharedBuffer::from_vec(data)
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("sharers", &self.sharers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_class_of() {
        assert_eq!(class_of(0), Some(0));
        assert_eq!(class_of(64), Some(0));
        assert_eq!(class_of(65), Some(1));
        assert_eq!(class_of(16 * 1024), Some(8));
        assert_eq!(class_of(16 * 1024 * 1024), Some(CLASS_COUNT - 1));
        assert_eq!(class_of(16 * 1024 * 1024 + 1), None);
    }

    #[test]
    fn test_rent_has_requested_capacity() {
        let pool = BufferPool::new(4);
        for len in [1, 63, 64, 100, 4096, 70_000] {
            let owner = pool.rent(len);
            assert!(owner.capacity() >= len);
            assert!(owner.is_empty());
        }
    }

    #[test]
    fn test_oversized_rent_is_unpooled() {
        let pool = BufferPool::new(4);
        let len = (1 << MAX_CLASS_SHIFT) + 1;
        drop(pool.rent(len));
        assert_eq!(pool.stats().returned, 0);
        assert_eq!(pool.stats().rented, 1);
    }

    #[test]
    fn test_owner_drop_returns_to_pool() {
        let pool = BufferPool::new(4);
        let owner = pool.rent(100);
        drop(owner);
        assert_eq!(pool.cached_for(100), 1);

        let again = pool.rent(128);
        assert_eq!(pool.stats().reused, 1);
        drop(again);
    }

    #[test]
    fn test_shared_returns_only_after_last_holder() {
        let pool = BufferPool::new(4);
        let mut owner = pool.rent(10);
        owner.extend_from_slice(b"hello");
        let shared = owner.freeze();
        let second = shared.share();
        assert_eq!(shared.sharers(), 2);

        drop(shared);
        assert_eq!(pool.cached_for(10), 0);

        drop(second);
        assert_eq!(pool.cached_for(10), 1);
    }

    #[test]
    fn test_class_limit_discards_surplus() {
        let pool = BufferPool::new(2);
        let owners: Vec<_> = (0..5).map(|_| pool.rent(32)).collect();
        drop(owners);
        assert_eq!(pool.cached_for(32), 2);
        assert_eq!(pool.stats().discarded, 3);
    }

    #[test]
    fn test_grown_buffer_not_pooled() {
        let pool = BufferPool::new(2);
        let mut owner = pool.rent(64);
        owner.extend_from_slice(&[0u8; 1000]);
        drop(owner);
        assert_eq!(pool.cached_for(64), 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_content_equality_ignores_identity() {
        let pool = BufferPool::new(2);
        let a = pool.copy_from(&[0, 1, 2]);
        let b = SharedBuffer::from_vec(vec![0, 1, 2]);
        let c = SharedBuffer::from_vec(vec![0, 1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn test_to_owner_copies() {
        let pool = BufferPool::new(2);
        let shared = pool.copy_from(b"abc");
        let mut owner = shared.to_owner(&pool);
        owner.as_mut_slice()[0] = b'x';
        assert_eq!(&shared[..], b"abc");
        assert_eq!(owner.as_slice(), b"xbc");
    }

    #[test]
    fn test_owner_implements_write() {
        let pool = BufferPool::new(2);
        let mut owner = pool.rent(16);
        owner.write_all(&[7, 8, 9]).unwrap();
        assert_eq!(owner.freeze().as_slice(), &[7, 8, 9]);
    }

    #[test]
    fn test_concurrent_rent_and_release() {
        let pool = BufferPool::new(8);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for j in 0..200 {
                        let buf = pool.copy_from(&[i as u8; 40]);
                        let shared = buf.share();
                        assert_eq!(shared.len(), 40);
                        if j % 2 == 0 {
                            drop(buf);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.rented, 800);
        assert_eq!(stats.returned + stats.discarded, 800);
        assert!(pool.cached_for(40) <= 8);
    }
}
