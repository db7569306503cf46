use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tradeflow::cli::{self, Cli};
use tradeflow::config::{AppConfig, LoggingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: failed to load config from {} ({}), using defaults", cli.config.display(), e);
            AppConfig::default()
        }
    };

    if cli.command.is_long_running() {
        init_logging(&config.logging);
    } else {
        init_logging_simple();
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        anyhow::bail!("configuration has {} error(s)", errors.len());
    }

    cli::execute(cli, config).await
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tradeflow=debug", logging.level)));

    // TRADEFLOW_LOG_DIR wins over the configured directory; console only when neither is set.
    let log_dir = std::env::var("TRADEFLOW_LOG_DIR")
        .ok()
        .map(std::path::PathBuf::from)
        .or_else(|| logging.dir.clone());

    // `rolling::daily` panics if it cannot create the first file, so check writability first.
    let file_layer = log_dir.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Could not create log directory {} ({}), file logging disabled", dir.display(), e);
            return None;
        }
        let marker = dir.join(".tradeflow_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&marker) {
            Ok(_) => {
                let _ = std::fs::remove_file(&marker);
                let appender = tracing_appender::rolling::daily(dir, "tradeflow.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                // The process lives until shutdown; leaking keeps the writer flushing.
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Warning: Could not write to log directory {} ({}), file logging disabled", dir.display(), e);
                None
            }
        }
    });

    let (json_layer, console_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/tradeflow.log", dir.display());
    } else if logging.dir.is_some() {
        warn!("File logging requested but unavailable");
    }
}

fn init_logging_simple() {
    // One-shot commands only surface warnings
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}
