//! Zero-cost tracing hooks.
//!
//! With the `tracing` feature enabled these macros forward to the `tracing`
//! crate; without it (the default) they compile to nothing. Enable with
//! `cargo test --features tracing` and filter via `RUST_LOG` as usual.

#![allow(unused_macros, unused_imports)]

#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
