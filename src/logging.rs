use slog::{o, Discard, Drain, Logger};
use slog_async::Async;
use slog_term::{CompactFormat, TermDecorator};

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Root component logger. Collectors, sources and sinks get children of it.
pub fn setup_logger(component: &str) -> Logger {
    let decorator = TermDecorator::new().stderr().build();
    let drain = CompactFormat::new(decorator).build().fuse();
    let drain = Async::new(drain).build().fuse();

    Logger::root(
        drain,
        o!(
            "component" => component.to_string(),
            "version" => env!("CARGO_PKG_VERSION"),
        ),
    )
}

/// A logger that drops everything, for tests and library callers that do not care.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Sets up the process-wide tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate logs at `level`. With `json`
/// the output is one JSON object per line.
pub fn init_tracing(level: Level, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("metric_collector={level},collector={level}")));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_names(true)
                    .with_level(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()
    };

    if let Err(err) = result {
        eprintln!("tracing subscriber already installed: {err}");
    }
}
