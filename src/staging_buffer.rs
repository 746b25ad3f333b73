use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Single-producer/single-consumer byte ring that log calls stage records in.
///
/// Each record is framed by a `u32` length and padded to 4 bytes. When a
/// record does not fit in the space left before the end of the ring, the
/// producer writes a padding marker there and continues at offset zero.
///
/// Both cursors increase monotonically and are reduced modulo the capacity
/// only when addressing memory, so `write - read` is always the number of
/// bytes in use. The producer publishes with a release store of the write
/// cursor; the consumer frees space with a release store of the read cursor.

const FRAME_HEADER: usize = 4;
const ALIGN: usize = 4;
const PADDING_MARKER: u32 = u32::MAX;
const MIN_CAPACITY: usize = 64;
const MAX_CAPACITY: usize = 1 << 30;

#[inline(always)]
const fn framed_len(len: usize) -> usize {
    (FRAME_HEADER + len + ALIGN - 1) & !(ALIGN - 1)
}

struct Ring {
    data: *mut u8,
    layout: Layout,
    capacity: usize,
    /// Bytes ever published by the producer.
    write: AtomicUsize,
    /// Bytes ever released by the consumer.
    read: AtomicUsize,
    /// Read position whose records have reached durable storage.
    persisted: AtomicUsize,
    producer_alive: AtomicBool,
    consumer_alive: AtomicBool,
    thread_id: u32,
}

// The producer only touches bytes in [write, read + capacity) and the consumer
// only bytes in [read, write); the cursors' acquire/release pairs order them.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    #[inline(always)]
    unsafe fn write_u32(&self, offset: usize, value: u32) {
        std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.data.add(offset), 4);
    }

    #[inline(always)]
    unsafe fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        std::ptr::copy_nonoverlapping(self.data.add(offset), bytes.as_mut_ptr(), 4);
        u32::from_le_bytes(bytes)
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.data, self.layout) }
    }
}

/// Creates a ring of at least `capacity` bytes and returns its two ends.
pub struct StagingBuffer;

impl StagingBuffer {
    pub fn new(capacity: usize, thread_id: u32) -> (Producer, Consumer) {
        let capacity = capacity
            .clamp(MIN_CAPACITY, MAX_CAPACITY)
            .next_multiple_of(ALIGN);
        let layout = match Layout::from_size_align(capacity, 8) {
            Ok(layout) => layout,
            Err(_) => alloc::handle_alloc_error(Layout::new::<u64>()),
        };
        let data = unsafe { alloc::alloc_zeroed(layout) };
        if data.is_null() {
            alloc::handle_alloc_error(layout);
        }

        let ring = Arc::new(Ring {
            data,
            layout,
            capacity,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            persisted: AtomicUsize::new(0),
            producer_alive: AtomicBool::new(true),
            consumer_alive: AtomicBool::new(true),
            thread_id,
        });

        (
            Producer {
                ring: ring.clone(),
                cached_read: 0,
            },
            Consumer { ring },
        )
    }
}

/// Writing end, owned by the logging thread.
pub struct Producer {
    ring: Arc<Ring>,
    /// Last observed read cursor; refreshed only when space looks short.
    cached_read: usize,
}

impl Producer {
    /// Largest record body this ring can ever accept.
    pub fn max_record_len(&self) -> usize {
        self.ring.capacity - FRAME_HEADER
    }

    /// True once the consumer side is gone and nothing will drain the ring.
    pub fn is_orphaned(&self) -> bool {
        !self.ring.consumer_alive.load(Ordering::Acquire)
    }

    pub fn thread_id(&self) -> u32 {
        self.ring.thread_id
    }

    /// Stages one record of `len` bytes, letting `fill` write it in place.
    ///
    /// Returns the closure back when the ring has no room, so the caller can
    /// retry without rebuilding it.
    #[inline]
    pub fn try_push_with<F: FnOnce(&mut [u8])>(&mut self, len: usize, fill: F) -> Result<(), F> {
        let ring = &*self.ring;
        let needed = framed_len(len);
        if needed > ring.capacity {
            return Err(fill);
        }

        let write = ring.write.load(Ordering::Relaxed);
        let offset = write % ring.capacity;
        let tail = ring.capacity - offset;

        if tail < needed {
            // Skip the tail first; the record goes in once the consumer has
            // released the start of the ring.
            if !has_room(ring, &mut self.cached_read, write, tail) {
                return Err(fill);
            }
            unsafe { ring.write_u32(offset, PADDING_MARKER) };
            ring.write.store(write + tail, Ordering::Release);
            return self.try_push_with(len, fill);
        }

        if !has_room(ring, &mut self.cached_read, write, needed) {
            return Err(fill);
        }

        unsafe {
            ring.write_u32(offset, len as u32);
            let body = std::slice::from_raw_parts_mut(ring.data.add(offset + FRAME_HEADER), len);
            fill(body);
        }
        ring.write.store(write + needed, Ordering::Release);
        Ok(())
    }

    /// Copies `record` into the ring. Returns false when it does not fit now.
    pub fn try_push(&mut self, record: &[u8]) -> bool {
        self.try_push_with(record.len(), |slot| slot.copy_from_slice(record))
            .is_ok()
    }
}

#[inline(always)]
fn has_room(ring: &Ring, cached_read: &mut usize, write: usize, needed: usize) -> bool {
    if write + needed - *cached_read <= ring.capacity {
        return true;
    }
    *cached_read = ring.read.load(Ordering::Acquire);
    write + needed - *cached_read <= ring.capacity
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.ring.producer_alive.store(false, Ordering::Release);
    }
}

/// Reading end, owned by the background writer.
pub struct Consumer {
    ring: Arc<Ring>,
}

impl Consumer {
    /// Hands every published record to `visit` in FIFO order, then releases
    /// their space to the producer. Returns `(records, bytes released)`.
    ///
    /// The spans are only valid during the callback.
    pub fn drain_ready<F: FnMut(&[u8])>(&mut self, mut visit: F) -> (usize, usize) {
        let ring = &*self.ring;
        let start = ring.read.load(Ordering::Relaxed);
        let end = ring.write.load(Ordering::Acquire);
        let mut pos = start;
        let mut records = 0;

        while pos < end {
            let offset = pos % ring.capacity;
            let header = unsafe { ring.read_u32(offset) };
            if header == PADDING_MARKER {
                pos += ring.capacity - offset;
                continue;
            }
            let len = header as usize;
            let body = unsafe { std::slice::from_raw_parts(ring.data.add(offset + FRAME_HEADER), len) };
            visit(body);
            records += 1;
            pos += framed_len(len);
        }

        ring.read.store(pos, Ordering::Release);
        (records, pos - start)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read.load(Ordering::Relaxed) == self.ring.write.load(Ordering::Acquire)
    }

    /// True once the producing thread has exited.
    pub fn is_abandoned(&self) -> bool {
        !self.ring.producer_alive.load(Ordering::Acquire)
    }

    pub fn thread_id(&self) -> u32 {
        self.ring.thread_id
    }

    /// Read cursor after the last drain.
    pub fn drained_cursor(&self) -> usize {
        self.ring.read.load(Ordering::Relaxed)
    }

    /// Records that everything before `cursor` is durably stored.
    pub fn mark_persisted(&self, cursor: usize) {
        self.ring.persisted.store(cursor, Ordering::Release);
    }

    /// A shareable view of the cursors, used by `sync` callers.
    pub fn progress(&self) -> RingProgress {
        RingProgress {
            ring: self.ring.clone(),
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.ring.consumer_alive.store(false, Ordering::Release);
    }
}

/// Read-only cursor snapshot handle for one ring.
#[derive(Clone)]
pub struct RingProgress {
    ring: Arc<Ring>,
}

impl RingProgress {
    /// Bytes published by the producer so far.
    pub fn produced(&self) -> usize {
        self.ring.write.load(Ordering::Acquire)
    }

    /// Bytes whose records are known to be durable.
    pub fn persisted(&self) -> usize {
        self.ring.persisted.load(Ordering::Acquire)
    }

    /// True when nothing will ever advance `persisted` again.
    pub fn is_detached(&self) -> bool {
        !self.ring.consumer_alive.load(Ordering::Acquire)
    }
}
