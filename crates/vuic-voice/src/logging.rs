//! Subscriber setup for hosts. The library itself only emits `tracing` events.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(debug: bool) -> &'static str {
    if debug {
        "vuic=debug,vuic_voice=debug"
    } else {
        "vuic=info,vuic_voice=info"
    }
}

/// Install a fmt subscriber. `RUST_LOG` overrides the default filter.
/// Calling this twice is harmless; the second call is ignored.
pub fn init_tracing(debug: bool) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug).into()))
        .with(tracing_subscriber::fmt::layer().with_target(debug))
        .try_init();
}
