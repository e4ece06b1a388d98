//! A lock-free message queue (`shmq`) living entirely inside one fixed-size
//! region of shared memory, for low-latency IPC between cooperating
//! processes (or threads) that map the same region.
//!
//! # Overview
//! The region is carved into three areas: a ring of descriptor slots with
//! read/write cursors, a node array describing runs of payload chunks, and
//! the chunk array itself. Two lock-free structures cooperate over it:
//!
//! - [`VariableAllocator`](alloc::VariableAllocator): a free-list allocator
//!   over fixed 32-byte chunks. Allocation carves a run from the tail of a
//!   free run; release re-links (or re-absorbs) the run, and adjacent free
//!   runs are coalesced with a two-phase mark-then-join protocol.
//! - [`RingQueue`](queue::RingQueue): a bounded MPMC ring whose producers
//!   publish allocator descriptors into slots and whose consumers claim
//!   them, with cursors advanced cooperatively.
//!
//! On top sits the process-facing layer:
//!
//! - [`QueueConfig`](core::QueueConfig): sizing and file-link parameters,
//!   constructed via [`QueueConfig::builder()`](core::QueueConfig::builder).
//! - [`MessageQueue`](core::MessageQueue): owns the mapping, exposes
//!   enqueue/dequeue, and shuts the handle down on termination signals.
//! - [`ShmqError`](errors::ShmqError): the crate error type. Only the setup
//!   layer returns errors; the queue operations themselves report full/empty
//!   conditions through booleans and `Option`.
//!
//! # Concurrency model
//!
//! There are no mutexes and no blocking waits anywhere on the message path.
//! Every shared word is a single machine word mutated only by
//! compare-and-swap:
//!
//! - Free-list nodes pack `next`/`version`/`count`/`status` into one 64-bit
//!   word. Any logical change installs a whole new word with the version
//!   bumped, so a stale observation can never CAS successfully (ABA).
//! - Ring slots pack `state`/`value` into one 32-bit word. A producer's slot
//!   CAS is the release point for the payload bytes it wrote; a consumer's
//!   acquire load of the slot is the matching edge.
//! - Cursor advances are opportunistic. A stalled producer cannot wedge a
//!   consumer: consumers look at slot state, not at who moved the cursor.
//!
//! Conflicts are retried a bounded number of times and then surface as a
//! failed operation (`false` / `None`), never as a blocked caller. A full
//! ring or exhausted allocator increments the region's overflow counter and
//! fails the enqueue; callers wanting durability retry with their own
//! backoff.
//!
//! Everything that crosses a process boundary is an index relative to the
//! region base, never a pointer, so peers may map the region at different
//! addresses.
//!
//! # User responsibilities
//!
//! - Exactly one process calls `init` (done by [`MessageQueue::create`] when
//!   it creates the backing file); attachers must wait for the creator.
//! - Peers are trusted: the queue has no defense against a process that
//!   scribbles over the region.

pub mod errors;
pub mod atomic;
pub mod alloc;
pub mod queue;
pub mod core;

#[cfg(test)]
mod tests;

pub use crate::core::{MessageQueue, QueueConfig};
pub use crate::errors::ShmqError;
pub use crate::queue::required_byte_size;
