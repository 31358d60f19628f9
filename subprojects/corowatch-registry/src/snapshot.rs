//! Value types shared between the registry core and its inspectors.
//!
//! Everything here is plain data: identities, the promise state machine,
//! the tagged waiter union, thread descriptors, call-site locations and
//! the by-value [`PromiseSnapshot`] an iteration callback hands to a
//! serializer.

use std::{fmt, sync::Arc, thread};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Opaque identity of a registered promise.
///
/// Stable for the lifetime of the underlying record. Realized as the
/// record's address so it can be serialized as a plain integer without a
/// process-wide counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(transparent))]
pub struct PromiseId(u64);

impl PromiseId {
    /// Sentinel reported by detached registration handles.
    pub const NULL: PromiseId = PromiseId(0);

    pub(crate) fn from_addr(addr: usize) -> Self {
        Self(addr as u64)
    }

    /// Returns the raw integer value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the detached-handle sentinel.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Execution state of a registered promise.
///
/// Transitions only advance: `Running` and `Suspended` alternate while
/// the coroutine executes, `Resolved` follows once a value is produced,
/// and `Deleted` is terminal: it is set when the record is marked for
/// deletion and is the one state instrumentation can never write itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum PromiseState {
    Running = 0,
    Suspended = 1,
    Resolved = 2,
    Deleted = 3,
}

impl PromiseState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Suspended,
            2 => Self::Resolved,
            3 => Self::Deleted,
            _ => unreachable!("invalid promise state discriminant {raw}"),
        }
    }

    /// Whether a writer may replace `self` with `next`.
    ///
    /// Re-reporting the current state is allowed: call sites that reach
    /// several suspension points may each publish the same state, and
    /// observers still see a non-decreasing sequence. `Deleted` may
    /// follow any earlier state (a frame can be destroyed without ever
    /// resolving), but nothing new follows `Deleted`.
    pub fn can_advance_to(self, next: PromiseState) -> bool {
        use PromiseState::*;
        self == next
            || matches!(
                (self, next),
                (Running, Suspended)
                    | (Suspended, Running)
                    | (Running | Suspended, Resolved)
                    | (Running | Suspended | Resolved, Deleted)
            )
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Resolved => "Resolved",
            Self::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

/// The party that will be notified when a promise resolves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Waiter {
    /// Nobody is waiting.
    None,
    /// Another registered promise, identified by its [`PromiseId`].
    Async(PromiseId),
    /// A thread parked synchronously, identified by its platform id.
    Sync(u64),
}

/// Name and platform id of a registry's owning thread.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ThreadInfo {
    name: Arc<str>,
    id: u64,
}

impl ThreadInfo {
    /// Captures the calling thread's name and platform id.
    pub fn current() -> Self {
        let thread = thread::current();
        let name = Arc::from(thread.name().unwrap_or("<unnamed>"));
        Self {
            name,
            id: platform_thread_id(),
        }
    }

    /// The thread's name, or `<unnamed>` if it never got one.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The thread's platform-level id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Kernel-level id of the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn platform_thread_id() -> u64 {
    // SAFETY: gettid has no preconditions and cannot fail.
    (unsafe { libc::gettid() }) as u64
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn platform_thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions and cannot fail.
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
pub(crate) fn platform_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

/// A call site: file, enclosing function and current line.
///
/// File and function are captured once at registration and never change;
/// the line is the only part that moves as the coroutine crosses
/// suspension points, and lives in the record as an atomic cell. The
/// same type doubles as the per-field-consistent view returned inside a
/// snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SourceLocation {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

impl SourceLocation {
    pub const fn new(file: &'static str, function: &'static str, line: u32) -> Self {
        Self {
            file,
            function,
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.function, self.file, self.line)
    }
}

/// By-value capture of a single promise record.
///
/// Every field is read from its own atomic cell, so the snapshot is
/// consistent per field but not across fields; an inspector must
/// tolerate e.g. a `Deleted` state paired with a waiter that was set
/// moments earlier.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PromiseSnapshot {
    pub id: PromiseId,
    pub thread: ThreadInfo,
    pub source_location: SourceLocation,
    pub waiter: Waiter,
    pub state: PromiseState,
}

#[cfg(test)]
mod tests {
    use static_assertions::{const_assert, const_assert_eq};

    use super::*;

    // The state discriminant must fit the record's one-byte atomic cell.
    const_assert_eq!(size_of::<PromiseState>(), 1);
    // The waiter union is replaced wholesale through an atomic cell.
    const_assert!(size_of::<Waiter>() <= 16);

    #[test]
    fn state_transitions_only_advance() {
        use PromiseState::*;

        assert!(Running.can_advance_to(Suspended));
        assert!(Suspended.can_advance_to(Running));
        assert!(Running.can_advance_to(Resolved));
        assert!(Suspended.can_advance_to(Resolved));
        assert!(Resolved.can_advance_to(Deleted));
        assert!(Running.can_advance_to(Deleted));

        assert!(!Resolved.can_advance_to(Running));
        assert!(!Resolved.can_advance_to(Suspended));
        assert!(!Deleted.can_advance_to(Running));
        assert!(!Deleted.can_advance_to(Resolved));
    }

    #[test]
    fn repeated_state_reports_are_allowed() {
        use PromiseState::*;

        for state in [Running, Suspended, Resolved, Deleted] {
            assert!(state.can_advance_to(state));
        }
    }

    #[test]
    fn null_id_is_the_sentinel() {
        assert!(PromiseId::NULL.is_null());
        assert_eq!(PromiseId::NULL.as_u64(), 0);
        assert!(!PromiseId::from_addr(0x1000).is_null());
    }

    #[test]
    fn thread_info_captures_the_current_thread() {
        std::thread::Builder::new()
            .name("info-probe".into())
            .spawn(|| {
                let info = ThreadInfo::current();
                assert_eq!(info.name(), "info-probe");
                assert_ne!(info.id(), 0);
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn source_location_formats_with_function_first() {
        let location = SourceLocation::new("src/job.rs", "fetch_block", 42);
        assert_eq!(location.to_string(), "fetch_block (src/job.rs:42)");
    }
}
