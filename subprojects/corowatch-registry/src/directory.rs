//! # Registry directory (process-wide)
//!
//! A thread-safe collection of strong references to every live
//! [`ThreadRegistry`], so an inspector can enumerate all of them without
//! knowing which worker threads exist.
//!
//! ## Design at a glance
//!
//! • **Storage** – registries are not linked intrusively themselves;
//!   every entry is a heap-allocated `Box<Node>` that pairs the
//!   intrusive [`LinkedListLink`] with a strong [`Arc`] to the registry.
//!   The node is created on `register` and destroyed on `unregister`.
//!
//! • **Locking** – a `Mutex<RegistryList>` serializes all mutations and
//!   the enumeration snapshot. The list is lazily initialised on first
//!   use so the directory can live in a `static`.
//!
//! • **Enumeration** – [`Directory::for_each`] clones the current set of
//!   strong references under the lock and invokes the callback outside
//!   it. A registry therefore cannot be torn down mid-callback, and the
//!   callback is free to call back into the directory.
//!
//! All operations are `O(n)` in the number of live registries, which
//! tracks the thread count and stays small in practice.

use std::{
    ptr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use intrusive_collections::{LinkedList, LinkedListLink, intrusive_adapter};

use crate::registry::ThreadRegistry;

/// The process-wide default directory, used by the instrumentation
/// layer's thread-local slots.
static PROCESS: Directory = Directory::new();

/// Returns the process-wide registry directory.
#[inline]
pub fn process_directory() -> &'static Directory {
    &PROCESS
}

/// A mutex-protected set of strong references to live registries.
pub struct Directory {
    inner: Mutex<RegistryList>,
}

impl Directory {
    /// Creates an empty directory.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryList::new_uninit()),
        }
    }

    /// Adds a strong reference to `registry`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `registry` is already present.
    pub fn register(&self, registry: Arc<ThreadRegistry>) {
        log::debug!(
            "registering promise registry of thread `{}`",
            registry.owner().name()
        );
        self.lock().insert(registry);
    }

    /// Drops the directory's strong reference to `registry`.
    ///
    /// If that was the last reference, the registry runs its terminal
    /// collection and deallocates before this returns. Unknown
    /// registries are ignored in release builds and panic in debug
    /// builds.
    pub fn unregister(&self, registry: &ThreadRegistry) {
        log::debug!(
            "unregistering promise registry of thread `{}`",
            registry.owner().name()
        );
        let node = self.lock().remove(registry);
        // The node's strong reference is released outside the lock, so a
        // terminal collection cannot stall other directory users.
        drop(node);
    }

    /// Runs `f` once per live registry.
    ///
    /// The set is captured under the directory lock; the callback runs
    /// outside it, holding a strong reference to the registry it is
    /// given.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ThreadRegistry>),
    {
        let snapshot = self.lock().collect_refs();
        for registry in &snapshot {
            f(registry);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryList> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazily initialised linked list of registry references.
struct RegistryList(Option<LinkedList<NodeAdapter>>);

impl RegistryList {
    const fn new_uninit() -> Self {
        Self(None)
    }

    #[inline]
    fn get_or_init(&mut self) -> &mut LinkedList<NodeAdapter> {
        self.0
            .get_or_insert_with(|| LinkedList::new(NodeAdapter::new()))
    }

    fn insert(&mut self, registry: Arc<ThreadRegistry>) {
        let list = self.get_or_init();

        debug_assert!(
            !list.iter().any(|node| Arc::ptr_eq(&node.registry, &registry)),
            "thread registry registered twice"
        );

        list.push_front(Box::new(Node {
            link: LinkedListLink::new(),
            registry,
        }));
    }

    /// Detaches the node holding `registry` and returns it, so the
    /// caller can release the strong reference outside the lock.
    fn remove(&mut self, registry: &ThreadRegistry) -> Option<Box<Node>> {
        let list = self.0.as_mut()?;

        let mut cursor = list.front_mut();
        while let Some(node) = cursor.get() {
            if ptr::eq(Arc::as_ptr(&node.registry), registry) {
                return cursor.remove();
            }
            cursor.move_next();
        }

        debug_assert!(false, "unregistered a thread registry that was never registered");
        None
    }

    fn collect_refs(&self) -> Vec<Arc<ThreadRegistry>> {
        match &self.0 {
            Some(list) => list.iter().map(|node| Arc::clone(&node.registry)).collect(),
            None => Vec::new(),
        }
    }
}

// Teach the intrusive list where the link lives inside `Node`.
intrusive_adapter!(NodeAdapter = Box<Node>: Node { link: LinkedListLink });

/// Wrapper stored inside the intrusive list; attaches a link to the
/// strong registry reference.
struct Node {
    link: LinkedListLink,
    registry: Arc<ThreadRegistry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_sees_registered_registries() {
        let directory = Directory::new();
        let registry = ThreadRegistry::for_current_thread();

        directory.register(Arc::clone(&registry));
        let mut seen = Vec::new();
        directory.for_each(|registry| seen.push(registry.owner().id()));
        assert_eq!(seen, vec![registry.owner().id()]);

        directory.unregister(&registry);
        let mut count = 0;
        directory.for_each(|_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn unregister_releases_the_directory_reference() {
        let directory = Directory::new();
        let registry = ThreadRegistry::for_current_thread();
        let weak = Arc::downgrade(&registry);

        directory.register(Arc::clone(&registry));
        drop(registry);
        assert!(weak.upgrade().is_some(), "directory keeps the registry alive");

        // Revive a strong reference briefly so unregister can identify
        // the registry.
        let registry = weak.upgrade().unwrap();
        directory.unregister(&registry);
        drop(registry);
        assert!(weak.upgrade().is_none(), "last reference tears the registry down");
    }
}
