//! End-to-end lifecycle behavior of a single thread registry.

use std::{
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::Duration,
};

use corowatch_registry::{
    PromiseId, PromiseRecord, PromiseState, SourceLocation, ThreadRegistry,
};

fn location(line: u32) -> SourceLocation {
    SourceLocation::new(file!(), "lifecycle", line)
}

fn ids(registry: &ThreadRegistry) -> Vec<PromiseId> {
    let mut out = Vec::new();
    registry.for_promise(|record| out.push(record.id()));
    out
}

fn record_at(addr: usize) -> NonNull<PromiseRecord> {
    NonNull::new(addr as *mut PromiseRecord).unwrap()
}

#[test]
fn insertion_is_lifo_and_collection_removes_marked_records() {
    let registry = ThreadRegistry::for_current_thread();
    let a = ThreadRegistry::add(&registry, location(1)).unwrap();
    let b = ThreadRegistry::add(&registry, location(2)).unwrap();
    let c = ThreadRegistry::add(&registry, location(3)).unwrap();
    let (id_a, id_b, id_c) = unsafe { (a.as_ref().id(), b.as_ref().id(), c.as_ref().id()) };

    assert_eq!(ids(&registry), vec![id_c, id_b, id_a]);

    // Marking alone must not change what iteration sees.
    unsafe { ThreadRegistry::retire(b) };
    assert_eq!(ids(&registry), vec![id_c, id_b, id_a]);
    registry.for_promise(|record| {
        if record.id() == id_b {
            assert_eq!(record.state(), PromiseState::Deleted);
        }
    });

    registry.garbage_collect();
    assert_eq!(ids(&registry), vec![id_c, id_a]);

    unsafe {
        ThreadRegistry::retire(a);
        ThreadRegistry::retire(c);
    }
    registry.garbage_collect();
    assert_eq!(ids(&registry), Vec::new());
}

#[test]
fn marks_from_other_threads_wait_for_the_owner_to_collect() {
    let registry = ThreadRegistry::for_current_thread();
    let record = ThreadRegistry::add(&registry, location(10)).unwrap();
    let id = unsafe { record.as_ref() }.id();
    let addr = record.as_ptr() as usize;

    std::thread::spawn(move || {
        // SAFETY: sole retire of this record.
        unsafe { ThreadRegistry::retire(record_at(addr)) };
    })
    .join()
    .unwrap();

    // A third thread still sees the marked record on the live list.
    let observer = {
        let registry = Arc::clone(&registry);
        std::thread::spawn(move || ids(&registry))
    };
    assert_eq!(observer.join().unwrap(), vec![id]);

    registry.garbage_collect();
    assert_eq!(ids(&registry), Vec::new());
}

#[test]
fn iteration_excludes_collection() {
    let (tx, rx) = mpsc::channel();
    let start_gc = Arc::new(AtomicBool::new(false));
    let gc_done = Arc::new(AtomicBool::new(false));

    let owner = {
        let start_gc = Arc::clone(&start_gc);
        let gc_done = Arc::clone(&gc_done);
        std::thread::spawn(move || {
            let registry = ThreadRegistry::for_current_thread();
            let record = ThreadRegistry::add(&registry, location(20)).unwrap();
            // SAFETY: sole retire of this record.
            unsafe { ThreadRegistry::retire(record) };
            tx.send(Arc::clone(&registry)).unwrap();
            while !start_gc.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            registry.garbage_collect();
            gc_done.store(true, Ordering::Release);
        })
    };

    let registry = rx.recv().unwrap();
    let mut visited = 0;
    registry.for_promise(|record| {
        visited += 1;
        start_gc.store(true, Ordering::Release);
        std::thread::sleep(Duration::from_millis(100));
        // We hold the iteration lock, so the owner's collection cannot
        // have completed and the marked record is still intact.
        assert!(!gc_done.load(Ordering::Acquire));
        assert_eq!(record.state(), PromiseState::Deleted);
    });
    assert_eq!(visited, 1);

    owner.join().unwrap();
    assert!(gc_done.load(Ordering::Acquire));
    assert_eq!(ids(&registry), Vec::new());
}
