//! # Per-thread promise registry
//!
//! A [`ThreadRegistry`] tracks every in-flight promise of one worker
//! thread. The registry is the concurrency core of the crate; its whole
//! point is that the instrumentation hot path never takes a lock.
//!
//! ## Design at a glance
//!
//! • **Live list** – an intrusive singly-linked list through
//!   [`PromiseRecord::next`], headed by `live_head`. Only the owner
//!   thread inserts, so publishing a record is a plain release store of
//!   the new head; snapshot walkers acquire-load it from any thread.
//!
//! • **Free list** – records marked for deletion are pushed onto a
//!   second intrusive list through `next_to_free` with a release CAS
//!   loop. Marking may happen on any thread; it flags the record
//!   `Deleted` first, so a walker that races the mark still sees a
//!   coherent record on the live list.
//!
//! • **Garbage collection** – the owner thread claims the whole free
//!   chain with one exchange, then unlinks and destroys each claimed
//!   record. Unlinking leans on the best-effort back-pointer
//!   [`PromiseRecord::previous`] to stay O(1); a record whose
//!   back-pointer turns out stale is pushed back and reclaimed on a
//!   later pass.
//!
//! • **Iteration vs. collection** – a mutex serializes [`for_promise`]
//!   against [`garbage_collect`], and nothing else. Insertion, marking
//!   and the per-record mutators never touch it.
//!
//! • **Lifetime** – the registry is shared through [`Arc`]. The
//!   directory, the thread-local slot and every live record hold one
//!   strong reference each; a record gives its reference back when it is
//!   retired. Whoever drops the last reference runs the terminal
//!   collection, wherever that thread may be.
//!
//! [`for_promise`]: ThreadRegistry::for_promise
//! [`garbage_collect`]: ThreadRegistry::garbage_collect

use std::{
    alloc::{self, Layout},
    ptr::{self, NonNull},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicPtr, Ordering},
    },
    thread::{self, ThreadId},
};

use crossbeam_utils::CachePadded;

use crate::{
    record::PromiseRecord,
    snapshot::{SourceLocation, ThreadInfo},
};

/// Failure to insert a new promise record.
#[derive(Debug, thiserror::Error)]
pub enum AddError {
    /// The record allocation failed. Nothing was inserted; the caller
    /// may continue without instrumentation.
    #[error("out of memory while allocating a promise record")]
    OutOfMemory,
}

/// Registry of the in-flight promises of a single worker thread.
///
/// See the module docs for the concurrency protocol. Constructed with
/// [`ThreadRegistry::for_current_thread`], which makes the calling
/// thread the owner: the only thread allowed to insert and (short of
/// the terminal path) to collect.
pub struct ThreadRegistry {
    owner: ThreadInfo,
    owner_key: ThreadId,
    /// Head of the live list; null when the registry is empty.
    live_head: CachePadded<AtomicPtr<PromiseRecord>>,
    /// Head of the free list: marked records awaiting reclamation.
    free_head: CachePadded<AtomicPtr<PromiseRecord>>,
    /// Serializes snapshot iteration against garbage collection.
    /// Neither insertion nor marking takes it.
    iter_lock: Mutex<()>,
}

impl ThreadRegistry {
    /// Creates a registry owned by the calling thread.
    pub fn for_current_thread() -> Arc<Self> {
        let owner = ThreadInfo::current();
        log::debug!(
            "creating promise registry for thread `{}` ({})",
            owner.name(),
            owner.id()
        );
        Arc::new(Self {
            owner,
            owner_key: thread::current().id(),
            live_head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            free_head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            iter_lock: Mutex::new(()),
        })
    }

    /// The owning thread's name and platform id.
    #[inline]
    pub fn owner(&self) -> &ThreadInfo {
        &self.owner
    }

    /// Allocates a record for `source` and links it at the head of the
    /// live list.
    ///
    /// The record holds a strong reference back to the registry until
    /// it is retired, and the returned pointer stays valid until the
    /// matching [`retire`] call.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread other than the owner.
    ///
    /// # Errors
    ///
    /// [`AddError::OutOfMemory`] when the record cannot be allocated.
    /// The insert is all-or-nothing: on error the registry is untouched.
    ///
    /// [`retire`]: ThreadRegistry::retire
    pub fn add(
        this: &Arc<Self>,
        source: SourceLocation,
    ) -> Result<NonNull<PromiseRecord>, AddError> {
        this.assert_owner("add");

        let layout = Layout::new::<PromiseRecord>();
        // SAFETY: `PromiseRecord` is not zero-sized.
        let raw = unsafe { alloc::alloc(layout) }.cast::<PromiseRecord>();
        let Some(record) = NonNull::new(raw) else {
            return Err(AddError::OutOfMemory);
        };

        // Only the owner inserts, so the head cannot move under us and a
        // relaxed read is enough.
        let old_head = this.live_head.load(Ordering::Relaxed);
        let registry = Arc::into_raw(Arc::clone(this));
        // SAFETY: `record` is a fresh, properly aligned allocation.
        unsafe {
            record
                .as_ptr()
                .write(PromiseRecord::new(this.owner.clone(), source, registry, old_head));
        }
        if let Some(old_head) = unsafe { old_head.as_ref() } {
            // The unpublished record is the sole writer of the old head's
            // back-pointer: it assigns it away from null exactly once.
            old_head.previous.store(record.as_ptr(), Ordering::Relaxed);
        }
        // Publish the fully constructed record to concurrent walkers.
        this.live_head.store(record.as_ptr(), Ordering::Release);
        Ok(record)
    }

    /// Flags `record` as deleted and links it onto the free list.
    ///
    /// May be called from any thread. The `Deleted` state is published
    /// before the record becomes reachable through `free_head`, so a
    /// walker that races this call sees a coherent deleted record still
    /// on the live list. Once this returns, the owner thread is free to
    /// reclaim the record at any moment; the caller must not touch it
    /// again.
    ///
    /// # Panics
    ///
    /// Panics if `record` belongs to a different registry.
    pub fn mark_for_deletion(&self, record: &PromiseRecord) {
        assert!(
            ptr::eq(record.registry, self),
            "record retired into a foreign registry"
        );
        record.set_deleted();
        self.push_free(ptr::from_ref(record).cast_mut());
    }

    /// Marks `record` and gives back the strong registry reference it
    /// was created with. This is the tear-down path used by
    /// registration handles; releasing the last reference runs the
    /// terminal collection.
    ///
    /// # Safety
    ///
    /// `record` must come from [`ThreadRegistry::add`] and must not be
    /// used in any way after this call.
    pub unsafe fn retire(record: NonNull<PromiseRecord>) {
        // Take the registry reference back before marking: after the
        // mark the owner may reclaim the record at any moment.
        // SAFETY: per the caller's contract the record is still live.
        let registry = unsafe { Arc::from_raw(record.as_ref().registry) };
        // SAFETY: same lifetime argument; the borrow ends with the call.
        registry.mark_for_deletion(unsafe { record.as_ref() });
        // Possibly the last reference; dropping it may tear the whole
        // registry down, records and all.
        drop(registry);
    }

    /// Runs `f` over every record currently on the live list, newest
    /// first.
    ///
    /// Holds the iteration lock for the whole walk, which keeps
    /// collection from unlinking records underneath the callback; it
    /// may therefore be called from any thread. Records that are
    /// already marked are still visited and report a `Deleted` state.
    pub fn for_promise<F>(&self, mut f: F)
    where
        F: FnMut(&PromiseRecord),
    {
        let _guard = self.iter_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cursor = self.live_head.load(Ordering::Acquire);
        // SAFETY: linked records are destroyed only under `iter_lock`,
        // which we hold; the acquire loads pair with the release
        // publishes, so each record is fully constructed.
        while let Some(record) = unsafe { cursor.as_ref() } {
            f(record);
            cursor = record.next.load(Ordering::Acquire);
        }
    }

    /// Reclaims every record that was marked for deletion before the
    /// call. Marks that race the pass are left for the next one.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread other than the owner. The
    /// terminal collection that runs when the last reference goes away
    /// takes the [`Drop`] path instead and is exempt.
    pub fn garbage_collect(&self) {
        self.assert_owner("garbage_collect");
        self.collect();
    }

    /// One collection pass: claim the free chain, then unlink and
    /// destroy each claimed record under the iteration lock.
    fn collect(&self) {
        // Claim the chain before taking the lock; concurrent marks land
        // on the fresh free list and wait for the next pass.
        let mut chain = self.free_head.swap(ptr::null_mut(), Ordering::Acquire);
        if chain.is_null() {
            return;
        }

        let _guard = self.iter_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut reclaimed = 0usize;
        while let Some(record) = NonNull::new(chain) {
            // SAFETY: claimed records stay alive until destroyed below.
            chain = unsafe { record.as_ref() }.next_to_free.load(Ordering::Relaxed);
            // SAFETY: we hold the iteration lock and the record came off
            // the claimed chain, so it is still linked and unobserved.
            if unsafe { self.unlink(record) } {
                // SAFETY: fully unlinked; nothing can reach it any more.
                unsafe { destroy(record) };
                reclaimed += 1;
            } else {
                // Stale back-pointer; retry once the stale predecessor
                // has been reclaimed.
                self.push_free(record.as_ptr());
            }
        }
        log::trace!(
            "reclaimed {reclaimed} promise records on `{}`",
            self.owner.name()
        );
    }

    /// Unlinks `record` from the live list, returning whether it is now
    /// unreachable and may be destroyed.
    ///
    /// The back-pointer is assigned away from null at most once and can
    /// therefore lag behind the list: a record that is actually the
    /// head may still name a predecessor. In that case the named
    /// predecessor is itself on its way to the free list, and this
    /// record becomes reclaimable on the pass after it; the caller
    /// re-queues it.
    ///
    /// # Safety
    ///
    /// Must run under `iter_lock`, with `record` claimed from the free
    /// chain and still linked on the live list.
    unsafe fn unlink(&self, record: NonNull<PromiseRecord>) -> bool {
        let record_ptr = record.as_ptr();
        // SAFETY: guaranteed live by the caller.
        let record = unsafe { record.as_ref() };
        let previous = record.previous.load(Ordering::Acquire);
        let next = record.next.load(Ordering::Relaxed);

        if previous.is_null() {
            debug_assert!(ptr::eq(self.live_head.load(Ordering::Relaxed), record_ptr));
            // Head of the live list; republish for concurrent walkers.
            self.live_head.store(next, Ordering::Release);
            if let Some(next) = unsafe { next.as_ref() } {
                next.previous.store(ptr::null_mut(), Ordering::Relaxed);
            }
            true
        } else if ptr::eq(self.live_head.load(Ordering::Relaxed), record_ptr) {
            // The back-pointer is stale: the record became the head when
            // the named predecessor was marked. Not reclaimable yet.
            false
        } else {
            // SAFETY: a named predecessor is never reclaimed before this
            // record: unlinking it would have rewritten our back-pointer
            // under this same lock.
            unsafe { (*previous).next.store(next, Ordering::Relaxed) };
            if let Some(next) = unsafe { next.as_ref() } {
                next.previous.store(previous, Ordering::Relaxed);
            }
            true
        }
    }

    /// Pushes `record` onto the free list with a release CAS loop.
    fn push_free(&self, record: *mut PromiseRecord) {
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `record` is live; only the pushing thread writes
            // its `next_to_free` until collection claims the chain.
            unsafe { (*record).next_to_free.store(head, Ordering::Relaxed) };
            match self.free_head.compare_exchange_weak(
                head,
                record,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    #[track_caller]
    fn assert_owner(&self, operation: &str) {
        assert!(
            thread::current().id() == self.owner_key,
            "`{operation}` may only run on the owning thread `{}`",
            self.owner.name(),
        );
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        // The last strong reference is gone, which means every record
        // has been marked: the directory, the thread-local slot and all
        // live records held one each. Drain the free list completely; a
        // pass may defer a record with a stale back-pointer to the next
        // one.
        while !self.free_head.load(Ordering::Acquire).is_null() {
            self.collect();
        }
        debug_assert!(
            self.live_head.load(Ordering::Relaxed).is_null(),
            "records survived the terminal collection"
        );
        log::debug!(
            "promise registry for thread `{}` destroyed",
            self.owner.name()
        );
    }
}

/// Drops and deallocates a record created by [`ThreadRegistry::add`].
///
/// # Safety
///
/// `record` must be fully unlinked and unreachable by any other thread.
unsafe fn destroy(record: NonNull<PromiseRecord>) {
    // SAFETY: per the caller's contract we hold the last pointer.
    unsafe {
        ptr::drop_in_place(record.as_ptr());
        alloc::dealloc(record.as_ptr().cast(), Layout::new::<PromiseRecord>());
    }
}
