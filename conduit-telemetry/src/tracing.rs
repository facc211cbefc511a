use std::io;
use std::sync::Once;

use conduit_config::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Env variable that turns on log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

/// Filter used by tests when `RUST_LOG` is not set.
const TEST_DEFAULT_FILTER: &str = "conduit=debug";

static INIT_TEST_TRACING: Once = Once::new();

/// Errors that can occur while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    /// `APP_ENVIRONMENT` holds an unsupported value.
    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),

    /// The `log` bridge could not be installed.
    #[error("failed to install the log tracer: {0}")]
    LogTracer(#[from] tracing_log::log::SetLoggerError),

    /// A global subscriber was already installed.
    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Keeps the non-blocking log writer alive.
///
/// Buffered lines are flushed when the value is dropped, so hold it until `main` returns.
#[must_use = "dropping the flusher stops log output"]
#[derive(Debug)]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global tracing subscriber for a binary.
///
/// Development builds get human-readable output, production builds emit JSON lines.
/// `RUST_LOG` overrides the default filter, which enables `info` for the application
/// and for the conduit core.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;

    LogTracer::init()?;

    let (writer, guard) = tracing_appender::non_blocking(io::stdout());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let target = app_name.replace('-', "_");
        EnvFilter::new(format!("{target}=info,conduit=info"))
    });

    let fmt_layer = match environment {
        Environment::Dev => fmt::layer().pretty().with_writer(writer).boxed(),
        Environment::Prod => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()?;

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test subscriber once per process.
///
/// Output is only produced when `ENABLE_TRACING` is set, so test runs stay quiet by default.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(TEST_DEFAULT_FILTER));

        // Another test harness may have installed a subscriber already.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
