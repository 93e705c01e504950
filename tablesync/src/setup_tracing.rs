use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "TABLESYNC_DEBUG";
/// librdkafka and sqlx drown everything else at debug.
const DEBUG_FILTER: &str = "debug,rdkafka=info,sqlx=info";
const DEFAULT_FILTER: &str = "info";

fn is_enabled(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "yes" | "1")
}

fn panic_payload<'a>(panic_info: &'a PanicHookInfo<'_>) -> Option<&'a str> {
    let payload = panic_info.payload();
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Sends panics to `tracing` so that they show up as a single JSON line next to every other
/// event instead of as free text on stderr.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // only captured with RUST_BACKTRACE or RUST_LIB_BACKTRACE set
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!("{panic_info}\n{backtrace}");
        return;
    }

    match (panic_info.location(), panic_payload(panic_info)) {
        (Some(location), Some(payload)) => {
            let location = format!("{}:{}:{}", location.file(), location.line(), location.column());
            tracing::error!(location, "panicked: {payload}");
        }
        _ => tracing::error!("{panic_info}"),
    }
}

/// Human readable text in debug mode, flattened JSON otherwise.
fn output_layer(debug_mode: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    }
}

/// Installs the global subscriber and the panic hook. RUST_LOG, when set, replaces the default
/// filter.
pub(crate) fn register() {
    let debug_mode = std::env::var(ENV_DEBUG).is_ok_and(|v| is_enabled(&v));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug_mode { DEBUG_FILTER } else { DEFAULT_FILTER })
    });

    tracing_subscriber::registry()
        .with(output_layer(debug_mode))
        .with(filter)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
