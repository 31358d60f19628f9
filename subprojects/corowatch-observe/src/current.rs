//! Per-thread registry lifecycle.
//!
//! Worker threads get their registry lazily: the first instrumented
//! frame creates it, publishes it to the process directory and parks a
//! strong reference in a `thread_local!` slot. The slot's destructor is
//! the per-thread finalizer: it runs one last owner-thread collection
//! and withdraws the directory's reference. Records still held
//! elsewhere keep the registry alive past thread exit; the final retire
//! then runs the terminal collection on whichever thread performs it.

use std::{cell::RefCell, sync::Arc};

use corowatch_registry::{ThreadRegistry, process_directory};

thread_local! {
    static SLOT: RefCell<Option<ThreadSlot>> = const { RefCell::new(None) };
}

/// Returns the calling thread's registry, creating and publishing it on
/// first use.
///
/// Returns `None` once the thread-local slot has been torn down
/// (instrumentation running during thread exit); callers degrade to a
/// detached handle in that case.
pub fn current_registry() -> Option<Arc<ThreadRegistry>> {
    SLOT.try_with(|slot| {
        let mut slot = slot.borrow_mut();
        let slot = slot.get_or_insert_with(ThreadSlot::init);
        Arc::clone(&slot.registry)
    })
    .ok()
}

/// Runs a collection pass on the calling thread's registry, if it has
/// one. Hosts call this periodically from each worker thread.
pub fn collect_garbage() {
    let _ = SLOT.try_with(|slot| {
        if let Some(slot) = slot.borrow().as_ref() {
            slot.registry.garbage_collect();
        }
    });
}

/// The thread-local strong reference, plus init/fini behavior.
struct ThreadSlot {
    registry: Arc<ThreadRegistry>,
}

impl ThreadSlot {
    fn init() -> Self {
        let registry = ThreadRegistry::for_current_thread();
        process_directory().register(Arc::clone(&registry));
        log::trace!(
            "instrumentation slot initialised on thread `{}`",
            registry.owner().name()
        );
        Self { registry }
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        log::trace!(
            "instrumentation slot finalising on thread `{}`",
            self.registry.owner().name()
        );
        // Thread-local teardown runs on the owning thread, so this is a
        // legal owner-side collection.
        self.registry.garbage_collect();
        process_directory().unregister(&self.registry);
    }
}
