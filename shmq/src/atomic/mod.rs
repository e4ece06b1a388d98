//! The one synchronization primitive the shared structures are built on.
//!
//! Every word the peers share is mutated by compare-and-swap only.
//! [`Snapshot`] captures a single atomic observation of such a word and
//! later offers it as the expected value of a CAS, so any foreign mutation
//! between the observation and the install makes the install fail.

use std::sync::atomic::{AtomicU64, Ordering};

/// A locally cached observation of one shared 64-bit word.
///
/// Snapshots have value semantics: copying one copies the observation, not
/// the word. A successful [`compare_and_swap`](Snapshot::compare_and_swap)
/// moves the snapshot forward to the installed value so the caller can keep
/// chaining CASes off it.
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    place: &'a AtomicU64,
    value: u64,
}

impl<'a> Snapshot<'a> {
    pub fn new(place: &'a AtomicU64) -> Snapshot<'a> {
        Snapshot {
            place,
            value: place.load(Ordering::Acquire),
        }
    }

    /// Re-points the snapshot at `place` and observes it again.
    pub fn update(&mut self, place: &'a AtomicU64) {
        self.place = place;
        self.value = place.load(Ordering::Acquire);
    }

    /// The observed value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The observed word itself, for address arithmetic by the owner of the
    /// surrounding array.
    pub fn place(&self) -> &'a AtomicU64 {
        self.place
    }

    /// True if the shared word no longer holds the observed value.
    pub fn is_modified(&self) -> bool {
        self.place.load(Ordering::Acquire) != self.value
    }

    /// Installs `new` if the word still holds the observed value.
    pub fn compare_and_swap(&mut self, new: u64) -> bool {
        match self
            .place
            .compare_exchange(self.value, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.value = new;
                true
            }
            Err(_) => false,
        }
    }
}
