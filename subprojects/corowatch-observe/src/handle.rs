//! Scoped registration of a single promise.

use std::{fmt, ptr::NonNull};

use corowatch_registry::{
    AddError, PromiseId, PromiseRecord, PromiseState, SourceLocation, ThreadRegistry, Waiter,
};

use crate::current;

/// Scoped handle tying one promise to the calling thread's registry.
///
/// Constructed at the top of an instrumented coroutine frame, mutated
/// as the frame progresses, and dropped with it; dropping marks the
/// underlying record for deletion. A `Registration` is not clonable:
/// exactly one handle owns a record. A detached handle (the [`Default`]
/// value, or any attach that could not complete) ignores every
/// operation.
pub struct Registration {
    record: Option<NonNull<PromiseRecord>>,
}

// SAFETY: every operation on the underlying record is an independent
// atomic update, and retirement is an any-thread operation by the
// registry's contract.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

impl Registration {
    /// Registers a promise at `source` with the calling thread's
    /// registry, creating the registry if this is the thread's first
    /// instrumented frame.
    ///
    /// Attachment degrades to a detached handle when the thread's
    /// registry slot has already been torn down.
    ///
    /// # Errors
    ///
    /// [`AddError::OutOfMemory`] if the record allocation fails. The
    /// caller may swallow the error and continue uninstrumented;
    /// [`register_promise!`](crate::register_promise) does exactly that.
    pub fn attach(source: SourceLocation) -> Result<Self, AddError> {
        match current::current_registry() {
            Some(registry) => {
                let record = ThreadRegistry::add(&registry, source)?;
                Ok(Self {
                    record: Some(record),
                })
            }
            None => Ok(Self::detached()),
        }
    }

    /// A handle that observes nothing.
    #[inline]
    pub const fn detached() -> Self {
        Self { record: None }
    }

    /// Whether this handle actually tracks a record.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.record.is_some()
    }

    /// The tracked promise's identity, or [`PromiseId::NULL`] when
    /// detached.
    pub fn id(&self) -> PromiseId {
        self.record().map_or(PromiseId::NULL, PromiseRecord::id)
    }

    /// Advances the promise's execution state.
    ///
    /// # Panics
    ///
    /// Panics if the transition regresses the state machine.
    pub fn update_state(&self, state: PromiseState) {
        if let Some(record) = self.record() {
            record.update_state(state);
        }
    }

    /// Records the line the coroutine currently executes at; file and
    /// function are fixed at attachment.
    pub fn update_line(&self, line: u32) {
        if let Some(record) = self.record() {
            record.update_line(line);
        }
    }

    /// Points the waiter at another registered promise.
    pub fn set_async_waiter(&self, waiter: PromiseId) {
        self.set_waiter(Waiter::Async(waiter));
    }

    /// Points the waiter at a synchronously parked thread.
    pub fn set_sync_waiter(&self, thread_id: u64) {
        self.set_waiter(Waiter::Sync(thread_id));
    }

    /// Clears the waiter once the awaited dependency has resolved.
    pub fn clear_waiter(&self) {
        self.set_waiter(Waiter::None);
    }

    fn set_waiter(&self, waiter: Waiter) {
        if let Some(record) = self.record() {
            record.set_waiter(waiter);
        }
    }

    fn record(&self) -> Option<&PromiseRecord> {
        // SAFETY: an attached record stays alive until `Drop` retires
        // it; this handle is the only retirer.
        self.record.map(|record| unsafe { record.as_ref() })
    }
}

impl Default for Registration {
    fn default() -> Self {
        Self::detached()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id()).finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            // SAFETY: the record came from `add` and is not touched
            // again after retirement.
            unsafe { ThreadRegistry::retire(record) };
        }
    }
}
