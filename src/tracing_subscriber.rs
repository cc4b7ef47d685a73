//! Log subscriber setup and runtime verbosity control.
//!
//! The verbosity surface speaks syslog levels (0–7) because that is what
//! device tooling expects; they map onto tracing level filters. `RUST_LOG`
//! wins at startup, a later `verbosity_set` over the bus replaces the whole
//! filter.

use std::sync::atomic::{AtomicI32, Ordering};

/// Syslog LOG_WARNING, the daemon's default.
pub const DEFAULT_VERBOSITY: i32 = 4;

static VERBOSITY: AtomicI32 = AtomicI32::new(DEFAULT_VERBOSITY);

#[cfg(all(feature = "tracing-subscriber", not(feature = "console-subscriber")))]
static RELOAD: std::sync::OnceLock<
    tracing_subscriber::reload::Handle<
        tracing_subscriber::EnvFilter,
        tracing_subscriber::Registry,
    >,
> = std::sync::OnceLock::new();

pub fn init() {
    #[cfg(all(feature = "tracing-subscriber", not(feature = "console-subscriber")))]
    {
        use tracing_subscriber::{
            layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter,
        };

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level_directive(DEFAULT_VERBOSITY)));
        let (filter, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        let _ = RELOAD.set(handle);
    }

    #[cfg(feature = "console-subscriber")]
    console_subscriber::init();
}

/// The currently requested syslog-style level.
pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Change the log level at runtime. Out-of-range values are clamped.
pub fn set_verbosity(level: i32) -> bool {
    let level = level.clamp(0, 7);
    VERBOSITY.store(level, Ordering::Relaxed);

    #[cfg(all(feature = "tracing-subscriber", not(feature = "console-subscriber")))]
    if let Some(handle) = RELOAD.get() {
        use tracing_subscriber::EnvFilter;

        if let Err(e) = handle.reload(EnvFilter::new(level_directive(level))) {
            tracing::warn!("failed to reload log filter: {e}");
            return false;
        }
    }

    true
}

fn level_directive(level: i32) -> &'static str {
    match level {
        ..=3 => "error",
        4 => "warn",
        5 => "info",
        6 => "debug",
        _ => "trace",
    }
}
