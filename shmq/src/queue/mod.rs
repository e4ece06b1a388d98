//! Bounded MPMC ring of descriptor slots over the region header.
//!
//! The ring occupies the front of the region: four 32-bit header words
//! (read cursor, write cursor, overflow counter, slot count) followed by
//! the slot array. Each slot packs a FREE/USED state bit with the allocator
//! descriptor it publishes. Producers and consumers race on the slots
//! directly; the cursors are advanced cooperatively and are never required
//! for progress, so a stalled peer cannot wedge the others.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::alloc::{VariableAllocator, CHUNK_SIZE, NODE_SIZE, RETRY_LIMIT};

const SLOT_FREE: u32 = 0;
const SLOT_USED: u32 = 1;

const HEADER_SIZE: usize = 4 * mem::size_of::<u32>();

#[repr(C)]
struct Header {
    read_pos: AtomicU32,
    write_pos: AtomicU32,
    overflow_count: AtomicU32,
    entry_count: AtomicU32,
}

fn slot_pack(state: u32, value: u32) -> u32 {
    (value << 1) | state
}

fn slot_state(word: u32) -> u32 {
    word & 1
}

fn slot_value(word: u32) -> u32 {
    word >> 1
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Bytes the header and slot array occupy, padded so the node array that
/// follows stays 8-aligned.
fn ring_size(entry_count: usize) -> usize {
    align_up(HEADER_SIZE + mem::size_of::<u32>() * entry_count, NODE_SIZE)
}

/// Region bytes needed for an `entry_count`-slot ring able to hold at least
/// one message of `payload_size` bytes.
pub fn required_byte_size(entry_count: usize, payload_size: usize) -> usize {
    let chunks = (mem::size_of::<usize>() + payload_size).div_ceil(CHUNK_SIZE);
    // Sentinel, the surviving run head the strict search insists on, and
    // the run itself.
    ring_size(entry_count) + (chunks + 2) * (NODE_SIZE + CHUNK_SIZE)
}

/// One process's view of the queue in a shared region.
pub struct RingQueue {
    header: *const Header,
    slots: *const AtomicU32,
    entry_count: u32,
    alloc: VariableAllocator,
}

// SAFETY: the header words and slots are accessed only through atomics;
// payload bytes are written before the publishing slot CAS (release) and
// read after the claiming slot load (acquire).
unsafe impl Send for RingQueue {}
unsafe impl Sync for RingQueue {}

impl RingQueue {
    /// Builds a view of the queue occupying `size` bytes at `base`, with
    /// `entry_count` ring slots. All peers must agree on both values.
    ///
    /// # Safety
    /// `base` must be 8-aligned and point to at least `size` bytes that stay
    /// mapped, shared and writable for the lifetime of the view.
    pub unsafe fn new(base: *mut u8, size: usize, entry_count: usize) -> RingQueue {
        let head = ring_size(entry_count);
        RingQueue {
            header: base as *const Header,
            slots: base.add(HEADER_SIZE) as *const AtomicU32,
            entry_count: entry_count as u32,
            alloc: VariableAllocator::new(base.add(head), size.saturating_sub(head)),
        }
    }

    /// False when the slot count or the remaining allocator area is too
    /// small to operate on.
    pub fn is_valid(&self) -> bool {
        self.entry_count >= 2 && self.alloc.is_valid()
    }

    /// One-time region initialization. Exactly one process runs this before
    /// any peer enqueues or dequeues.
    pub fn init(&self) {
        self.alloc.init();
        let h = self.header();
        h.read_pos.store(0, Ordering::Release);
        h.write_pos.store(0, Ordering::Release);
        h.overflow_count.store(0, Ordering::Release);
        h.entry_count.store(self.entry_count, Ordering::Release);
        for i in 0..self.entry_count {
            self.slot(i).store(slot_pack(SLOT_FREE, 0), Ordering::Release);
        }
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Copies `data` into freshly allocated chunks and publishes the run's
    /// descriptor into the next write slot. Returns false, after counting
    /// one overflow, when the ring is full, the allocator is exhausted, or
    /// the publish retry budget runs out.
    pub fn enqueue(&self, data: &[u8]) -> bool {
        if self.is_full() {
            self.count_overflow();
            return false;
        }

        let total = mem::size_of::<usize>() + data.len();
        if total > u32::MAX as usize {
            self.count_overflow();
            return false;
        }
        let descriptor = self.alloc.allocate(total as u32);
        if descriptor == 0 {
            self.count_overflow();
            return false;
        }

        // Payload must be fully written before the slot CAS publishes it.
        unsafe {
            ptr::write_unaligned(self.alloc.ptr(descriptor, 0) as *mut usize, data.len());
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.alloc.ptr(descriptor, mem::size_of::<usize>()),
                data.len(),
            );
        }

        if !self.publish(descriptor) {
            self.count_overflow();
            self.alloc.release(descriptor);
            return false;
        }
        true
    }

    /// Claims the next published message and returns a copy of its payload,
    /// or `None` when the queue is empty. The chunk run is released before
    /// returning.
    pub fn dequeue(&self) -> Option<Vec<u8>> {
        let descriptor = self.claim()?;

        let message = unsafe {
            let size = ptr::read_unaligned(self.alloc.ptr(descriptor, 0) as *const usize);
            let mut buf = vec![0u8; size];
            ptr::copy_nonoverlapping(
                self.alloc.ptr(descriptor, mem::size_of::<usize>()) as *const u8,
                buf.as_mut_ptr(),
                size,
            );
            buf
        };

        let released = self.alloc.release(descriptor);
        debug_assert!(released);
        Some(message)
    }

    pub fn is_empty(&self) -> bool {
        let h = self.header();
        h.read_pos.load(Ordering::Acquire) == h.write_pos.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let h = self.header();
        h.read_pos.load(Ordering::Acquire) == self.next_pos(h.write_pos.load(Ordering::Acquire))
    }

    pub fn overflow_count(&self) -> u32 {
        self.header().overflow_count.load(Ordering::Acquire)
    }

    pub fn reset_overflow_count(&self) {
        self.header().overflow_count.store(0, Ordering::Release);
    }

    fn publish(&self, descriptor: u32) -> bool {
        let h = self.header();
        for _ in 0..RETRY_LIMIT {
            let read = h.read_pos.load(Ordering::Acquire);
            let write = h.write_pos.load(Ordering::Acquire);
            let next_write = self.next_pos(write);
            if read == next_write {
                // Filled up between the caller's check and now.
                return false;
            }

            let slot = self.slot(write);
            let observed = slot.load(Ordering::Acquire);
            if slot_state(observed) != SLOT_FREE {
                // A peer committed this slot but has not advanced the
                // cursor yet; help it along and retry.
                let _ = h
                    .write_pos
                    .compare_exchange(write, next_write, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }

            if slot
                .compare_exchange(
                    observed,
                    slot_pack(SLOT_USED, descriptor),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            // Cooperative advance; a failure means a peer already moved it.
            let _ = h
                .write_pos
                .compare_exchange(write, next_write, Ordering::AcqRel, Ordering::Acquire);
            return true;
        }
        false
    }

    fn claim(&self) -> Option<u32> {
        let h = self.header();
        for _ in 0..RETRY_LIMIT {
            let read = h.read_pos.load(Ordering::Acquire);
            let write = h.write_pos.load(Ordering::Acquire);
            if read == write {
                return None;
            }
            let next_read = self.next_pos(read);

            let slot = self.slot(read);
            let observed = slot.load(Ordering::Acquire);
            if slot_state(observed) == SLOT_FREE {
                // The producer that reserved this position has not
                // committed yet; skip-help the cursor and look again.
                let _ = h
                    .read_pos
                    .compare_exchange(read, next_read, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }

            if slot
                .compare_exchange(
                    observed,
                    slot_pack(SLOT_FREE, 0),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            let _ = h
                .read_pos
                .compare_exchange(read, next_read, Ordering::AcqRel, Ordering::Acquire);
            return Some(slot_value(observed));
        }
        None
    }

    fn header(&self) -> &Header {
        unsafe { &*self.header }
    }

    fn slot(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.entry_count);
        unsafe { &*self.slots.add(index as usize) }
    }

    fn next_pos(&self, pos: u32) -> u32 {
        (pos + 1) % self.entry_count
    }

    fn count_overflow(&self) {
        self.header().overflow_count.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn region(bytes: usize) -> Vec<u64> {
        vec![0u64; bytes.div_ceil(8)]
    }

    fn queue(buf: &mut [u64], entry_count: usize) -> RingQueue {
        let size = buf.len() * 8;
        let q = unsafe { RingQueue::new(buf.as_mut_ptr() as *mut u8, size, entry_count) };
        assert!(q.is_valid());
        q.init();
        q
    }

    #[test]
    fn fresh_queue_is_empty() {
        let mut buf = region(required_byte_size(8, 1024));
        let q = queue(&mut buf, 8);

        assert!(q.is_empty());
        assert!(!q.is_full());
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.overflow_count(), 0);
    }

    #[test]
    fn single_message_round_trip() {
        let mut buf = region(required_byte_size(8, 1024));
        let q = queue(&mut buf, 8);

        assert!(q.enqueue(b"hello"));
        assert!(!q.is_empty());
        assert_eq!(q.dequeue().as_deref(), Some(&b"hello"[..]));
        assert!(q.is_empty());
        assert_eq!(q.overflow_count(), 0);
    }

    #[test]
    fn empty_payload_round_trip() {
        let mut buf = region(required_byte_size(8, 1024));
        let q = queue(&mut buf, 8);

        assert!(q.enqueue(b""));
        assert_eq!(q.dequeue().as_deref(), Some(&b""[..]));
    }

    #[test]
    fn fill_then_drain_in_order() {
        // Five slots leave room for four in-flight messages; the ring
        // declares itself full one short of the slot count.
        let mut buf = region(required_byte_size(5, 64 * 1024));
        let q = queue(&mut buf, 5);

        let messages: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 8]).collect();
        for m in &messages {
            assert!(q.enqueue(m));
        }
        assert!(q.is_full());
        assert!(!q.enqueue(&[9u8; 8]));
        assert_eq!(q.overflow_count(), 1);

        for m in &messages {
            assert_eq!(q.dequeue().as_deref(), Some(&m[..]));
        }
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn allocator_exhaustion_overflows_then_recovers() {
        // Chunk math: a 64-byte payload plus its length word takes 3
        // chunks; 10 free chunks (11 nodes) serve exactly 3 such runs.
        let payload = [7u8; 64];
        let chunks_per_message = 3;
        let bytes = ring_size(8) + (3 * chunks_per_message + 2) * (NODE_SIZE + CHUNK_SIZE);
        let mut buf = region(bytes);
        let q = queue(&mut buf, 8);

        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..5 {
            if q.enqueue(&payload) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(rejected, 2);
        assert!(q.overflow_count() >= 2);

        for _ in 0..accepted {
            assert_eq!(q.dequeue().as_deref(), Some(&payload[..]));
        }
        assert!(q.enqueue(&payload));
        assert_eq!(q.dequeue().as_deref(), Some(&payload[..]));
    }

    #[test]
    fn overflow_counter_is_monotone_and_resettable() {
        let mut buf = region(required_byte_size(2, 1024));
        let q = queue(&mut buf, 2);

        assert!(q.enqueue(b"only"));
        assert!(q.is_full());
        let mut last = q.overflow_count();
        assert_eq!(last, 0);
        for _ in 0..3 {
            assert!(!q.enqueue(b"spill"));
            let now = q.overflow_count();
            assert!(now > last);
            last = now;
        }

        q.reset_overflow_count();
        assert_eq!(q.overflow_count(), 0);
        assert_eq!(q.dequeue().as_deref(), Some(&b"only"[..]));
        assert_eq!(q.overflow_count(), 0);
    }

    #[test]
    fn repeated_round_trips_do_not_leak_chunks() {
        let mut buf = region(required_byte_size(4, 256));
        let q = queue(&mut buf, 4);

        for turn in 0u32..1000 {
            let payload = turn.to_le_bytes();
            assert!(q.enqueue(&payload), "leaked chunks by turn {}", turn);
            assert_eq!(q.dequeue().as_deref(), Some(&payload[..]));
        }
    }

    #[test]
    fn required_byte_size_is_sufficient() {
        let payload = [0xABu8; 100];
        let mut buf = region(required_byte_size(4, payload.len()));
        let q = queue(&mut buf, 4);
        assert!(q.enqueue(&payload));
        assert_eq!(q.dequeue().as_deref(), Some(&payload[..]));
    }

    #[test]
    fn spsc_preserves_fifo() {
        let mut buf = region(required_byte_size(16, 4 * 1024));
        let q = queue(&mut buf, 16);

        thread::scope(|s| {
            let q = &q;
            s.spawn(move || {
                for i in 0u32..500 {
                    while !q.enqueue(&i.to_le_bytes()) {
                        thread::yield_now();
                    }
                }
            });

            let mut expected = 0u32;
            while expected < 500 {
                match q.dequeue() {
                    Some(bytes) => {
                        let got = u32::from_le_bytes(bytes.as_slice().try_into().unwrap());
                        assert_eq!(got, expected);
                        expected += 1;
                    }
                    None => thread::yield_now(),
                }
            }
        });
    }

    #[test]
    fn mpsc_delivers_every_message_exactly_once() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 100;

        let mut buf = region(required_byte_size(64, 64 * 1024));
        let q = queue(&mut buf, 64);

        thread::scope(|s| {
            let q = &q;
            for producer in 0..PRODUCERS {
                s.spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let mut payload = [0u8; 8];
                        payload[..4].copy_from_slice(&producer.to_le_bytes());
                        payload[4..].copy_from_slice(&seq.to_le_bytes());
                        while !q.enqueue(&payload) {
                            thread::yield_now();
                        }
                    }
                });
            }

            let mut next_seq = [0u32; PRODUCERS as usize];
            let mut received = 0;
            while received < PRODUCERS * PER_PRODUCER {
                match q.dequeue() {
                    Some(bytes) => {
                        let producer =
                            u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
                        let seq = u32::from_le_bytes(bytes[4..].try_into().unwrap());
                        assert_eq!(seq, next_seq[producer], "producer {} out of order", producer);
                        next_seq[producer] += 1;
                        received += 1;
                    }
                    None => thread::yield_now(),
                }
            }
        });

        assert!(q.is_empty());
    }
}
