//! Concurrency stress: racing marks against iteration and collection,
//! and hammering the per-record mutators while snapshots are taken.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use corowatch_registry::{PromiseRecord, SourceLocation, ThreadRegistry, Waiter};
use crossbeam_utils::thread;
use rand::seq::SliceRandom;

fn location(line: u32) -> SourceLocation {
    SourceLocation::new(file!(), "stress", line)
}

fn record_at(addr: usize) -> NonNull<PromiseRecord> {
    NonNull::new(addr as *mut PromiseRecord).unwrap()
}

#[test]
fn concurrent_marks_iteration_and_collection() {
    const RECORDS: usize = 1_000;
    const MARKERS: usize = 4;

    let registry = ThreadRegistry::for_current_thread();
    let mut records: Vec<usize> = (0..RECORDS)
        .map(|line| {
            ThreadRegistry::add(&registry, location(line as u32)).unwrap().as_ptr() as usize
        })
        .collect();
    records.shuffle(&mut rand::thread_rng());

    let registry_ref = &*registry;
    thread::scope(|scope| {
        for chunk in records.chunks(RECORDS / MARKERS) {
            scope.spawn(move |_| {
                for &addr in chunk {
                    // SAFETY: the chunks are disjoint, so each record is
                    // retired exactly once.
                    unsafe { ThreadRegistry::retire(record_at(addr)) };
                }
            });
        }
        for _ in 0..2 {
            scope.spawn(move |_| {
                for _ in 0..50 {
                    let mut walked = 0;
                    registry_ref.for_promise(|record| {
                        let _ = record.snapshot();
                        walked += 1;
                    });
                    assert!(walked <= RECORDS);
                }
            });
        }
        // The owner keeps collecting while the marks come in.
        for _ in 0..20 {
            registry_ref.garbage_collect();
            std::thread::yield_now();
        }
    })
    .unwrap();

    registry.garbage_collect();
    let mut survivors = 0;
    registry.for_promise(|_| survivors += 1);
    assert_eq!(survivors, 0);
}

#[test]
fn waiter_writes_never_tear() {
    const ROUNDS: usize = 10_000;

    let registry = ThreadRegistry::for_current_thread();
    let record = ThreadRegistry::add(&registry, location(1)).unwrap();
    // SAFETY: the record outlives the scope below and is retired after.
    let record_ref = unsafe { record.as_ref() };
    let async_target = Waiter::Async(record_ref.id());
    let sync_target = Waiter::Sync(0xDEAD);
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|_| {
            for _ in 0..ROUNDS {
                record_ref.set_waiter(async_target);
            }
            done.store(true, Ordering::Release);
        });
        scope.spawn(|_| {
            for _ in 0..ROUNDS {
                record_ref.set_waiter(sync_target);
            }
        });
        scope.spawn(|_| {
            while !done.load(Ordering::Acquire) {
                let waiter = record_ref.snapshot().waiter;
                assert!(
                    waiter == Waiter::None || waiter == async_target || waiter == sync_target,
                    "torn waiter observed: {waiter:?}"
                );
            }
        });
    })
    .unwrap();

    // SAFETY: sole retire of this record.
    unsafe { ThreadRegistry::retire(record) };
    registry.garbage_collect();
}

#[test]
fn line_updates_never_tear() {
    const LINES: [u32; 3] = [10, 20, 30];

    let registry = ThreadRegistry::for_current_thread();
    let record = ThreadRegistry::add(&registry, location(LINES[0])).unwrap();
    // SAFETY: the record outlives the scope below and is retired after.
    let record_ref = unsafe { record.as_ref() };
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|_| {
            for _ in 0..5_000 {
                for line in LINES {
                    record_ref.update_line(line);
                }
            }
            done.store(true, Ordering::Release);
        });
        scope.spawn(|_| {
            while !done.load(Ordering::Acquire) {
                let line = record_ref.snapshot().source_location.line;
                assert!(LINES.contains(&line), "torn line observed: {line}");
            }
        });
    })
    .unwrap();

    // SAFETY: sole retire of this record.
    unsafe { ThreadRegistry::retire(record) };
    registry.garbage_collect();
}
