//! Optional tracing hooks.
//!
//! The wheel logs two things: where `schedule` places a timer and when a
//! tick climbs to a higher level. Both sit on hot paths, so the macros
//! below compile to nothing unless the `tracing` cargo feature is on; with
//! it they forward to the `tracing` crate.

/// Installs a process-wide subscriber that writes wheel events to stderr.
///
/// Honors `RUST_LOG` when set and defaults to `debug` otherwise. Safe to
/// call more than once; only the first call installs anything.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

/// Without the `tracing` feature there is nothing to install.
#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

// The wheel only ever emits at trace (per-schedule) and debug (per-cascade)
// severity, so only those two names exist here.
#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

#[cfg(not(feature = "tracing"))]
macro_rules! disabled {
    ($($ignored:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use disabled as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use disabled as trace;
