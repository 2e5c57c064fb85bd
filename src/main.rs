use axum::Router;
use clap::{ArgGroup, Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, PolicyConfig, TollgateConfig};
use tollgate::service::GateServer;

/// Token-bucket admission gate in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
#[command(group(ArgGroup::new("policy").args(["rate", "window_ms"])))]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Bucket capacity (burst size)
    #[arg(long)]
    capacity: Option<u64>,

    /// Refill rate in tokens per second
    #[arg(long)]
    rate: Option<f64>,

    /// Refill window in milliseconds (bucket resets once per window)
    #[arg(long)]
    window_ms: Option<u64>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<CliLogFormat>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Apply command line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut TollgateConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(capacity) = self.capacity {
            config.limiter.capacity = capacity;
        }
        if let Some(per_second) = self.rate {
            config.limiter.policy = PolicyConfig::Rate { per_second };
        }
        if let Some(window_ms) = self.window_ms {
            config.limiter.policy = PolicyConfig::Window {
                window_ms,
                amount: None,
            };
        }
        if let Some(format) = self.log_format {
            config.logging.format = format.into();
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TollgateConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    init_tracing(config.logging.format);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    let gate = Arc::new(config.limiter.build_gate()?);
    info!(
        capacity = gate.bucket().capacity(),
        filters = config.limiter.filters.len(),
        exceptions = config.limiter.exceptions.len(),
        "Admission gate initialized"
    );

    // Placeholder downstream application.
    let router = Router::new().fallback(|| async { "OK" });
    let server = GateServer::new(config.server.listen_addr, gate, router);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
