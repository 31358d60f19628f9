//! # corowatch-registry
//!
//! Per-thread registries of in-flight promises, built for diagnostic
//! snapshotting of a long-running multi-threaded server.
//!
//! Each worker thread owns a [`ThreadRegistry`] holding one intrusive
//! [`PromiseRecord`] per live promise. Insertion and reclamation are
//! restricted to the owning thread; marking a record for deletion and
//! walking the registry for a snapshot are allowed from anywhere. The
//! [`Directory`] ties the per-thread registries together so an
//! inspector can enumerate the whole process.
//!
//! The instrumentation-facing API (scoped registration handles, the
//! thread-local registry slot, call-site macros) lives in the
//! `corowatch-observe` crate; this crate is the concurrency core plus
//! the snapshot value types.

mod directory;
mod record;
mod registry;
mod snapshot;

pub use directory::{Directory, process_directory};
pub use record::PromiseRecord;
pub use registry::{AddError, ThreadRegistry};
pub use snapshot::{PromiseId, PromiseSnapshot, PromiseState, SourceLocation, ThreadInfo, Waiter};
