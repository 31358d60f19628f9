//! The intrusive promise record.
//!
//! A [`PromiseRecord`] is the unit a thread registry links into its live
//! and free lists. It carries the three cells the inspector cares about
//! (`state`, `waiter`, current `line`) as independent atomics, plus the
//! list pointers the collection protocol is built on. Records are
//! allocated by [`ThreadRegistry::add`] and reclaimed exclusively by
//! garbage collection; nothing else ever frees one.
//!
//! [`ThreadRegistry::add`]: crate::registry::ThreadRegistry::add

use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, Ordering};

use crossbeam_utils::atomic::AtomicCell;

use crate::{
    registry::ThreadRegistry,
    snapshot::{PromiseId, PromiseSnapshot, PromiseState, SourceLocation, ThreadInfo, Waiter},
};

/// One in-flight promise, as tracked by its owning thread's registry.
///
/// The record's address doubles as its [`PromiseId`], so records are
/// never moved once linked.
pub struct PromiseRecord {
    /// Owning thread, captured at construction and immutable.
    thread: ThreadInfo,
    file: &'static str,
    function: &'static str,
    /// Current source line; advanced at suspension points.
    line: AtomicU32,
    /// Raw [`PromiseState`] discriminant.
    state: AtomicU8,
    /// Tagged waiter cell; replaced wholesale, never observed torn.
    waiter: AtomicCell<Waiter>,
    /// Owning registry. The record is created holding one strong
    /// reference to it; that reference is given back when the record is
    /// retired, after which only this raw pointer remains.
    pub(crate) registry: *const ThreadRegistry,
    /// Successor in the live list. Written by the owner thread only:
    /// once before the record is published, afterwards only during
    /// collection, under the iteration lock.
    pub(crate) next: AtomicPtr<PromiseRecord>,
    /// Back-pointer to the record linked in front of this one. Assigned
    /// away from null at most once, when a successor is inserted; may be
    /// observed stale by collection (see the unlink rule in the registry
    /// module).
    pub(crate) previous: AtomicPtr<PromiseRecord>,
    /// Successor in the free list; written by the marking thread right
    /// before the record is pushed, read only by collection.
    pub(crate) next_to_free: AtomicPtr<PromiseRecord>,
}

// SAFETY: every mutable field is an atomic cell, and the raw pointers
// are only dereferenced under the registry's protocol (owner-thread
// rules plus the iteration lock).
unsafe impl Send for PromiseRecord {}
unsafe impl Sync for PromiseRecord {}

impl PromiseRecord {
    pub(crate) fn new(
        thread: ThreadInfo,
        source: SourceLocation,
        registry: *const ThreadRegistry,
        next: *mut PromiseRecord,
    ) -> Self {
        Self {
            thread,
            file: source.file,
            function: source.function,
            line: AtomicU32::new(source.line),
            state: AtomicU8::new(PromiseState::Running as u8),
            waiter: AtomicCell::new(Waiter::None),
            registry,
            next: AtomicPtr::new(next),
            previous: AtomicPtr::new(std::ptr::null_mut()),
            next_to_free: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// The promise's identity: the record address.
    #[inline]
    pub fn id(&self) -> PromiseId {
        PromiseId::from_addr(self as *const Self as usize)
    }

    /// The owning thread's name and platform id.
    #[inline]
    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    /// The call site, with the line the coroutine last reported.
    pub fn source_location(&self) -> SourceLocation {
        SourceLocation::new(self.file, self.function, self.line.load(Ordering::Acquire))
    }

    /// The promise's current execution state.
    #[inline]
    pub fn state(&self) -> PromiseState {
        PromiseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The party currently waiting on this promise.
    #[inline]
    pub fn waiter(&self) -> Waiter {
        self.waiter.load()
    }

    /// Advances the execution state. Re-reporting the current state is
    /// allowed and harmless.
    ///
    /// # Panics
    ///
    /// Panics if the transition regresses the state machine. A
    /// regression means two call sites disagree about the promise's
    /// lifetime, which is an instrumentation bug.
    pub fn update_state(&self, next: PromiseState) {
        let current = self.state();
        assert!(
            current.can_advance_to(next),
            "promise state may not go back from {current} to {next}"
        );
        self.state.store(next as u8, Ordering::Release);
    }

    /// Terminal transition, written by `mark_for_deletion` only.
    pub(crate) fn set_deleted(&self) {
        debug_assert!(
            self.state() != PromiseState::Deleted,
            "record marked for deletion twice"
        );
        self.state.store(PromiseState::Deleted as u8, Ordering::Release);
    }

    /// Records the line the coroutine currently executes at.
    #[inline]
    pub fn update_line(&self, line: u32) {
        self.line.store(line, Ordering::Release);
    }

    /// Replaces the waiter.
    #[inline]
    pub fn set_waiter(&self, waiter: Waiter) {
        self.waiter.store(waiter);
    }

    /// Captures a by-value view of the record.
    ///
    /// Each field is read independently; the result is consistent per
    /// field but not across fields, which is all the inspector needs.
    pub fn snapshot(&self) -> PromiseSnapshot {
        PromiseSnapshot {
            id: self.id(),
            thread: self.thread.clone(),
            source_location: self.source_location(),
            waiter: self.waiter(),
            state: self.state(),
        }
    }
}
