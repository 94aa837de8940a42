use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "COMPUTEFLOW_DEBUG";

/// Logs a panic as a single error event, with the backtrace when one was captured.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let location = panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!(location = location.as_deref(), "{panic_info}\n{backtrace}");
    } else {
        tracing::error!(location = location.as_deref(), "{panic_info}");
    }
}

fn debug_mode(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn default_level(debug_mode: bool) -> Level {
    if debug_mode { Level::DEBUG } else { Level::INFO }
}

/// Registers the global subscriber. RUST_LOG sets the level, `info` by default or `debug` in
/// debug mode where the output is plain text instead of flattened JSON.
pub fn register() {
    let debug_mode = debug_mode(std::env::var(ENV_DEBUG).ok().as_deref());

    let filter = EnvFilter::builder()
        .with_default_directive(default_level(debug_mode).into())
        .from_env_lossy();

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
