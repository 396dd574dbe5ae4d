//! Pooled byte buffers for encode and decode scratch space
//!
//! Two tiers:
//! - a single thread-confined slot of [`THREAD_SLOT_SIZE`] bytes, handed out
//!   without locking when it is free;
//! - a shared, size-bucketed pool used when the slot is busy (a nested call
//!   on the same thread), when the request is larger than the slot, or when
//!   the caller asks for it explicitly.
//!
//! A rented buffer is returned when its [`PooledBuffer`] guard drops, so it
//! goes back on every exit path, including `?` early returns.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Size of the per-thread fast-path buffer.
pub const THREAD_SLOT_SIZE: usize = 65535;

/// Default minimum length requested by the serializers
pub const DEFAULT_MINIMUM_LENGTH: usize = THREAD_SLOT_SIZE;

/// Smallest bucket in the shared pool (256 bytes)
const MIN_BUCKET_SHIFT: u32 = 8;

/// Largest bucket in the shared pool (16MB); larger rents are not pooled
const MAX_BUCKET_SHIFT: u32 = 24;

/// Buffers retained per bucket by default
pub const DEFAULT_RETAINED_PER_BUCKET: usize = 16;

struct ThreadSlot {
    busy: Cell<bool>,
    buffer: RefCell<Option<Vec<u8>>>,
}

thread_local! {
    static THREAD_SLOT: ThreadSlot = const {
        ThreadSlot {
            busy: Cell::new(false),
            buffer: RefCell::new(None),
        }
    };
}

impl ThreadSlot {
    /// Take the slot buffer, or `None` if it is already rented on this thread.
    fn acquire() -> Option<Vec<u8>> {
        THREAD_SLOT
            .try_with(|slot| {
                if slot.busy.replace(true) {
                    return None;
                }
                let buffer = slot
                    .buffer
                    .borrow_mut()
                    .take()
                    .unwrap_or_else(|| vec![0u8; THREAD_SLOT_SIZE]);
                Some(buffer)
            })
            .ok()
            .flatten()
    }

    fn restore(mut buffer: Vec<u8>) {
        buffer.resize(THREAD_SLOT_SIZE, 0);
        buffer.shrink_to(THREAD_SLOT_SIZE);
        // Thread teardown: the slot is gone, let the buffer drop.
        let _ = THREAD_SLOT.try_with(|slot| {
            *slot.buffer.borrow_mut() = Some(buffer);
            slot.busy.set(false);
        });
    }
}

#[derive(Clone, Copy)]
enum Origin<'a> {
    ThreadSlot,
    Shared(&'a BufferPool),
    Unpooled,
}

/// A rented buffer. Derefs to `Vec<u8>`; its length is the usable capacity.
///
/// Dropping the guard returns the buffer to where it came from. The guard is
/// neither `Send` nor `Sync`: a thread-slot buffer must come back to the
/// thread that rented it.
pub struct PooledBuffer<'a> {
    buffer: Vec<u8>,
    origin: Origin<'a>,
    clear_on_return: bool,
    _not_send: PhantomData<*const ()>,
}

impl PooledBuffer<'_> {
    /// Whether this buffer is the calling thread's fast-path slot.
    pub fn is_thread_slot(&self) -> bool {
        matches!(self.origin, Origin::ThreadSlot)
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        if self.clear_on_return {
            buffer.fill(0);
        }
        match self.origin {
            Origin::ThreadSlot => ThreadSlot::restore(buffer),
            Origin::Shared(pool) => pool.release(buffer),
            Origin::Unpooled => {}
        }
    }
}

/// Size-bucketed buffer pool with a per-thread fast path.
///
/// # Examples
/// ```
/// use msgpack_lz4::BufferPool;
///
/// let pool = BufferPool::new();
/// let outer = pool.rent(1024);
/// let inner = pool.rent(1024); // slot busy: served by the shared buckets
/// assert!(outer.is_thread_slot());
/// assert!(!inner.is_thread_slot());
/// ```
pub struct BufferPool {
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
    retained_per_bucket: usize,
}

impl BufferPool {
    /// Create a pool retaining [`DEFAULT_RETAINED_PER_BUCKET`] buffers per bucket
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_PER_BUCKET)
    }

    /// Create a pool retaining at most `retained_per_bucket` buffers per bucket
    pub fn with_retention(retained_per_bucket: usize) -> Self {
        let buckets = (MIN_BUCKET_SHIFT..=MAX_BUCKET_SHIFT)
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            buckets,
            retained_per_bucket,
        }
    }

    /// The process-wide pool used by the serializers by default
    pub fn shared() -> &'static BufferPool {
        static SHARED: OnceLock<BufferPool> = OnceLock::new();
        SHARED.get_or_init(BufferPool::new)
    }

    /// Rent a buffer of at least `minimum_length` bytes.
    pub fn rent(&self, minimum_length: usize) -> PooledBuffer<'_> {
        self.rent_with(minimum_length, false)
    }

    /// Rent a buffer, optionally zeroing it when it is returned.
    ///
    /// Tries the thread slot first; falls through to the shared buckets when
    /// the slot is already rented on this thread or too small.
    pub fn rent_with(&self, minimum_length: usize, clear_on_return: bool) -> PooledBuffer<'_> {
        if minimum_length <= THREAD_SLOT_SIZE {
            if let Some(buffer) = ThreadSlot::acquire() {
                return PooledBuffer {
                    buffer,
                    origin: Origin::ThreadSlot,
                    clear_on_return,
                    _not_send: PhantomData,
                };
            }
            trace_event!("thread slot busy, renting {} bytes from shared pool", minimum_length);
        }
        self.rent_shared(minimum_length, clear_on_return)
    }

    /// Rent from the shared buckets only, bypassing the thread slot.
    pub fn rent_shared(&self, minimum_length: usize, clear_on_return: bool) -> PooledBuffer<'_> {
        let (buffer, origin) = match rent_bucket(minimum_length) {
            Some(index) => {
                let size = bucket_size(index);
                let reused = self.buckets[index]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop();
                (reused.unwrap_or_else(|| vec![0u8; size]), Origin::Shared(self))
            }
            None => (vec![0u8; minimum_length], Origin::Unpooled),
        };
        PooledBuffer {
            buffer,
            origin,
            clear_on_return,
            _not_send: PhantomData,
        }
    }

    /// Number of buffers currently held by the shared buckets
    pub fn retained(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    fn release(&self, mut buffer: Vec<u8>) {
        let Some(index) = return_bucket(buffer.len()) else {
            return;
        };
        // A grown buffer is filed under the largest bucket it still covers.
        buffer.truncate(bucket_size(index));
        let mut bucket = self.buckets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if bucket.len() < self.retained_per_bucket {
            bucket.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_size(index: usize) -> usize {
    1usize << (MIN_BUCKET_SHIFT as usize + index)
}

/// Smallest bucket whose buffers hold `len` bytes.
fn rent_bucket(len: usize) -> Option<usize> {
    let shift = len.max(1).checked_next_power_of_two()?.trailing_zeros();
    let shift = shift.max(MIN_BUCKET_SHIFT);
    (shift <= MAX_BUCKET_SHIFT).then(|| (shift - MIN_BUCKET_SHIFT) as usize)
}

/// Largest bucket whose size does not exceed `len`.
fn return_bucket(len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let shift = usize::BITS - 1 - len.leading_zeros();
    (MIN_BUCKET_SHIFT..=MAX_BUCKET_SHIFT)
        .contains(&shift)
        .then(|| (shift - MIN_BUCKET_SHIFT) as usize)
}
