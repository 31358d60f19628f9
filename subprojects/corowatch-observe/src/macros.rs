//! Call-site capture macros.

/// Expands to the full path of the enclosing function.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn witness() {}
        fn name_of<T>(_: T) -> &'static str {
            ::core::any::type_name::<T>()
        }
        let name = name_of(witness);
        name.strip_suffix("::witness").unwrap_or(name)
    }};
}

/// Captures the call site as a [`SourceLocation`](crate::SourceLocation).
#[macro_export]
macro_rules! source_location {
    () => {
        $crate::SourceLocation::new(
            ::core::file!(),
            $crate::function_name!(),
            ::core::line!(),
        )
    };
}

/// Registers the enclosing coroutine frame with the calling thread's
/// registry.
///
/// Evaluates to an attached [`Registration`](crate::Registration), or a
/// detached one when the record cannot be allocated or the thread's
/// registry slot is already gone.
#[macro_export]
macro_rules! register_promise {
    () => {
        $crate::Registration::attach($crate::source_location!()).unwrap_or_default()
    };
}
