//! # corowatch-observe
//!
//! Instrumentation layer over `corowatch-registry`: the scoped
//! [`Registration`] handle a coroutine frame carries, the thread-local
//! registry slot with its per-thread initializer and finalizer, the
//! call-site capture macros, and the whole-process snapshot aggregator
//! a diagnostic endpoint feeds from.
//!
//! Typical instrumentation:
//!
//! ```
//! use corowatch_observe::{PromiseState, register_promise};
//!
//! fn handle_request() {
//!     let observed = register_promise!();
//!     // ... run until the first suspension point ...
//!     observed.update_state(PromiseState::Suspended);
//!     observed.update_line(line!());
//!     // ... resume, resolve ...
//!     observed.update_state(PromiseState::Running);
//!     observed.update_state(PromiseState::Resolved);
//! } // dropping `observed` marks the record for deletion
//! ```

mod current;
mod handle;
mod inspect;
mod macros;

pub use corowatch_registry::{
    AddError, PromiseId, PromiseSnapshot, PromiseState, SourceLocation, ThreadInfo,
    ThreadRegistry, Waiter,
};
pub use current::{collect_garbage, current_registry};
pub use handle::Registration;
pub use inspect::snapshot_all;
