use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

const ENV_DEBUG: &str = "PROCWIN_DEBUG";

/// Routes panics through `tracing`. By default a panicking partition task interrupts the JSON log
/// stream on stderr with a multi-line plain text report:
/// ```text
/// {"timestamp":"2026-10-19T08:12:03.410Z","level":"INFO","message":"Partition started","partition":0}
///
/// thread 'tokio-runtime-worker' panicked at procwin-core/src/pane.rs:121:13:
/// attempt to subtract with overflow
/// ```
///
/// With the hook installed the report is one more JSON event:
/// ```text
/// {"timestamp":"2026-10-19T08:12:03.411Z","level":"ERROR","message":"procwin-core/src/pane.rs:121:13: attempt to subtract with overflow","target":"procwin::setup_tracing"}
/// ```
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop if the RUST_BACKTRACE or RUST_LIB_BACKTRACE backtrace variables are both not set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        Some(*s)
    } else {
        panic_info
            .payload()
            .downcast_ref::<String>()
            .map(|s| s.as_str())
    };

    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

/// Installs the global subscriber. RUST_LOG can be used to set the log level, the default is
/// `info`. Logs are flattened JSON unless `PROCWIN_DEBUG=true`, which switches to human readable
/// text at `debug` level.
pub(crate) fn register() {
    let debug_mode = std::env::var(ENV_DEBUG).is_ok_and(|v| v.to_lowercase() == "true");
    let default_log_level = if debug_mode { "debug" } else { "info" };

    let filter = EnvFilter::builder()
        .with_default_directive(default_log_level.parse().unwrap_or(Level::INFO.into()))
        .from_env_lossy();

    let layer = if debug_mode {
        // Text format, logs go to stderr so stdout only carries window results
        fmt::layer().with_writer(std::io::stderr).boxed()
    } else {
        // JSON format, flattened
        fmt::layer()
            .with_writer(std::io::stderr)
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
