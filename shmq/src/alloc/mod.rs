//! Lock-free variable-size allocator over fixed 32-byte chunks.
//!
//! The allocator owns the trailing bulk of the shared region, split into a
//! node array and a chunk array of equal element count. Free space is a
//! singly-linked list of runs, sorted by index, threaded through the nodes
//! and headed by the permanent sentinel at node 0. An allocation carves its
//! run from the *tail* of a free run, which leaves the list linkage intact;
//! a release re-links the run (or re-absorbs it into a physically adjacent
//! predecessor). Adjacent free runs encountered during any walk are
//! coalesced with a two-phase mark-then-join protocol so that each phase is
//! a single CAS.
//!
//! Callers hold *descriptors*: node indices, valid in every mapping of the
//! region. Descriptor 0 means "no allocation".

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::atomic::Snapshot;

/// Fixed payload granularity in bytes.
pub const CHUNK_SIZE: usize = 32;
/// Bytes per free-list node.
pub const NODE_SIZE: usize = mem::size_of::<u64>();

/// Bounded restarts before a traversal or an operation reports failure.
pub(crate) const RETRY_LIMIT: u32 = 32;
const FAST_RETRY_LIMIT: u32 = 1;
const NODE_COUNT_LIMIT: u64 = 0x0100_0000;

const NEXT_BITS: u32 = 26;
const VERSION_BITS: u32 = 6;
const COUNT_BITS: u32 = 30;

const NEXT_MASK: u64 = (1 << NEXT_BITS) - 1;
const VERSION_MASK: u64 = (1 << VERSION_BITS) - 1;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const STATUS_MASK: u64 = 0b11;

const AVAILABLE: u32 = 0;
const JOIN_HEAD: u32 = 1;
const JOIN_TAIL: u32 = 2;

/// One free-list record packed into a single CAS word: successor index,
/// ABA version, run length in chunks, and the transient coalescing marks.
///
/// Any logical mutation produces a whole new word with `version` bumped;
/// splitting the word into independently written fields would break the
/// CAS protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Node(u64);

impl Node {
    fn pack(next: u32, version: u32, count: u32, status: u32) -> Node {
        Node(
            (u64::from(next) & NEXT_MASK)
                | ((u64::from(version) & VERSION_MASK) << NEXT_BITS)
                | ((u64::from(count) & COUNT_MASK) << (NEXT_BITS + VERSION_BITS))
                | ((u64::from(status) & STATUS_MASK) << (NEXT_BITS + VERSION_BITS + COUNT_BITS)),
        )
    }

    fn next(self) -> u32 {
        (self.0 & NEXT_MASK) as u32
    }

    fn version(self) -> u32 {
        ((self.0 >> NEXT_BITS) & VERSION_MASK) as u32
    }

    fn count(self) -> u32 {
        ((self.0 >> (NEXT_BITS + VERSION_BITS)) & COUNT_MASK) as u32
    }

    fn status(self) -> u32 {
        ((self.0 >> (NEXT_BITS + VERSION_BITS + COUNT_BITS)) & STATUS_MASK) as u32
    }

    fn is_available(self) -> bool {
        self.status() == AVAILABLE
    }

    fn is_join_head(self) -> bool {
        self.status() & JOIN_HEAD != 0
    }

    fn is_join_tail(self) -> bool {
        self.status() & JOIN_TAIL != 0
    }

    /// The record that absorbs the adjacent `tail` run, clearing the mark
    /// each endpoint carried while preserving any foreign mark.
    fn join(self, tail: Node) -> Node {
        Node::pack(
            tail.next(),
            tail.version().wrapping_add(1),
            self.count() + tail.count(),
            (self.status() & !JOIN_HEAD) | (tail.status() & !JOIN_TAIL),
        )
    }

    fn with_next(self, next: u32) -> Node {
        Node::pack(next, self.version().wrapping_add(1), self.count(), self.status())
    }

    fn with_count(self, count: u32) -> Node {
        Node::pack(self.next(), self.version().wrapping_add(1), count, self.status())
    }

    fn with_status(self, status: u32) -> Node {
        Node::pack(self.next(), self.version().wrapping_add(1), self.count(), status)
    }
}

fn node_of(snap: &Snapshot<'_>) -> Node {
    Node(snap.value())
}

/// The allocator view of one shared region. Cheap to construct; every
/// process maps the region and builds its own view over the same bytes.
pub struct VariableAllocator {
    node_count: u32,
    nodes: *const AtomicU64,
    chunks: *mut u8,
}

// SAFETY: all cross-thread state lives in the node words, which are only
// read and written through atomics; chunk bytes are touched only by the
// holder of a live descriptor, and the slot/node CAS edges order those
// accesses.
unsafe impl Send for VariableAllocator {}
unsafe impl Sync for VariableAllocator {}

impl VariableAllocator {
    /// Builds a view over `size` bytes at `base`.
    ///
    /// # Safety
    /// `base` must be 8-aligned and point to at least `size` bytes that stay
    /// mapped, shared and writable for the lifetime of the allocator and all
    /// descriptors handed out from it.
    pub unsafe fn new(base: *mut u8, size: usize) -> VariableAllocator {
        let node_count = (size / (NODE_SIZE + CHUNK_SIZE)) as u32;
        VariableAllocator {
            node_count,
            nodes: base as *const AtomicU64,
            chunks: base.add(node_count as usize * NODE_SIZE),
        }
    }

    /// False when the region is too small (or absurdly large) to operate on.
    pub fn is_valid(&self) -> bool {
        !self.nodes.is_null()
            && self.node_count > 2
            && u64::from(self.node_count) < NODE_COUNT_LIMIT
    }

    /// Writes the initial free list: the sentinel at node 0 pointing at one
    /// maximal run at node 1. Exactly one process may do this, before any
    /// peer touches the region.
    pub fn init(&self) {
        if self.is_valid() {
            self.node_ref(0)
                .store(Node::pack(1, 0, 0, AVAILABLE).0, Ordering::Release);
            self.node_ref(1).store(
                Node::pack(self.node_count, 0, self.node_count - 1, AVAILABLE).0,
                Ordering::Release,
            );
        }
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Reserves a run large enough for `size` bytes and returns its
    /// descriptor, or 0 on invalid input or out-of-memory.
    pub fn allocate(&self, size: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        let need = size.div_ceil(CHUNK_SIZE as u32);

        for _ in 0..RETRY_LIMIT {
            // Strictly greater: a split always leaves the victim's own head
            // node in place, so the list linkage never needs repair.
            let mut cand = match self.find_candidate(
                |c| node_of(c).is_available() && node_of(c).count() > need,
                RETRY_LIMIT,
            ) {
                Some(c) => c,
                None => return 0,
            };
            let victim = node_of(&cand);
            let new_count = victim.count() - need;
            if !cand.compare_and_swap(victim.with_count(new_count).0) {
                continue;
            }

            // The carved run starts right past what remains of the victim.
            // It is unreachable until its descriptor escapes, so a plain
            // store suffices; the version bump shields the first CAS a later
            // release will attempt on this node.
            let index = self.index_of(&cand) + new_count;
            let head = self.node_ref(index);
            let old = Node(head.load(Ordering::Relaxed));
            head.store(
                Node::pack(old.next(), victim.version().wrapping_add(1), need, AVAILABLE).0,
                Ordering::Release,
            );
            return index;
        }
        0
    }

    /// Returns the run behind `descriptor` to the free list. Retries on
    /// contention up to the budget; failure leaves the run leaked until a
    /// caller tries again.
    pub fn release(&self, descriptor: u32) -> bool {
        self.release_impl(descriptor, RETRY_LIMIT, false)
    }

    /// Single-attempt release: abandons on the first conflict and returns
    /// false with the region untouched, for callers that bound latency over
    /// reclamation.
    pub fn fast_release(&self, descriptor: u32) -> bool {
        self.release_impl(descriptor, FAST_RETRY_LIMIT, true)
    }

    /// A pointer `offset` bytes into the payload of a held descriptor. Valid
    /// only in this mapping and only while the descriptor is held; peers
    /// exchange descriptors, never pointers.
    pub fn ptr(&self, descriptor: u32, offset: usize) -> *mut u8 {
        debug_assert!(descriptor != 0 && descriptor < self.node_count);
        unsafe { self.chunks.add(descriptor as usize * CHUNK_SIZE + offset) }
    }

    fn node_ref(&self, index: u32) -> &AtomicU64 {
        debug_assert!(index < self.node_count);
        unsafe { &*self.nodes.add(index as usize) }
    }

    fn index_of(&self, snap: &Snapshot<'_>) -> u32 {
        let offset = snap.place() as *const AtomicU64 as usize - self.nodes as usize;
        (offset / NODE_SIZE) as u32
    }

    /// A run is joinable with its successor iff the two are physically
    /// adjacent.
    fn is_joinable(&self, snap: &Snapshot<'_>) -> bool {
        let n = node_of(snap);
        n.next() == self.index_of(snap) + n.count()
    }

    /// Walks the free list from the sentinel until `accept` matches the
    /// current node, coalescing adjacent free pairs on the way. Any conflict
    /// restarts the walk from the head; after `retry_limit` restarts the
    /// walk gives up.
    fn find_candidate<F>(&self, accept: F, retry_limit: u32) -> Option<Snapshot<'_>>
    where
        F: Fn(&Snapshot<'_>) -> bool,
    {
        let mut restarts = 0;
        'walk: while restarts <= retry_limit {
            let mut pred = Snapshot::new(self.node_ref(0));
            let mut steps = 0;
            loop {
                if node_of(&pred).next() == self.node_count {
                    // Terminal index: nothing matched.
                    return None;
                }
                // A sound list reaches the terminal within node_count hops;
                // anything longer is a cycle through corrupt words.
                steps += 1;
                if steps > self.node_count {
                    restarts += 1;
                    continue 'walk;
                }

                let mut curr = Snapshot::new(self.node_ref(node_of(&pred).next()));
                if pred.is_modified() {
                    restarts += 1;
                    continue 'walk;
                }
                debug_assert!(!node_of(&curr).is_join_head() || self.is_joinable(&curr));
                // A tail mark without its partner's head mark is an
                // abandoned coalesce; restart and let a later pass repair it.
                if !node_of(&pred).is_join_head() && node_of(&curr).is_join_tail() {
                    restarts += 1;
                    continue 'walk;
                }

                // Mark phase: flag both endpoints of an adjacent free pair.
                if self.is_joinable(&pred) {
                    let p = node_of(&pred);
                    let c = node_of(&curr);
                    if !(pred.compare_and_swap(p.with_status(p.status() | JOIN_HEAD).0)
                        && curr.compare_and_swap(c.with_status(c.status() | JOIN_TAIL).0))
                    {
                        restarts += 1;
                        continue 'walk;
                    }
                }

                // Join phase: one CAS on the head folds the tail into it.
                if node_of(&pred).is_join_head() && node_of(&curr).is_join_tail() {
                    debug_assert!(self.is_joinable(&pred));
                    let joined = node_of(&pred).join(node_of(&curr));
                    if !pred.compare_and_swap(joined.0) {
                        restarts += 1;
                        continue 'walk;
                    }
                    curr = pred;
                }

                if accept(&curr) {
                    return Some(curr);
                }
                pred = curr;
            }
        }
        None
    }

    fn release_impl(&self, descriptor: u32, retry_limit: u32, fast: bool) -> bool {
        if descriptor == 0 || descriptor >= self.node_count {
            debug_assert!(descriptor < self.node_count);
            return true;
        }

        for _ in 0..retry_limit.max(1) {
            let mut pred =
                match self.find_candidate(|c| descriptor < node_of(c).next(), retry_limit) {
                    Some(p) => p,
                    None => return false,
                };
            let pred_node = node_of(&pred);
            debug_assert!(descriptor >= self.index_of(&pred) + pred_node.count());
            if !pred_node.is_available() {
                // The predecessor is an endpoint of an in-flight coalesce;
                // it must not change under its partner's feet. Walk again.
                if fast {
                    return false;
                }
                continue;
            }

            let head = self.node_ref(descriptor);
            let node = Node(head.load(Ordering::Acquire));
            let new_pred = if descriptor == self.index_of(&pred) + pred_node.count() {
                // Physically adjacent: the returned chunks are re-absorbed.
                pred_node.with_count(pred_node.count() + node.count())
            } else {
                // Link the run in front of pred's successor. The run is not
                // reachable until pred's CAS lands, so the plain store is
                // safe.
                head.store(
                    Node::pack(pred_node.next(), node.version(), node.count(), node.status()).0,
                    Ordering::Release,
                );
                pred_node.with_next(descriptor)
            };

            if pred.compare_and_swap(new_pred.0) {
                return true;
            }
            if fast {
                return false;
            }
        }
        false
    }
}
