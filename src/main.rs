//! FileVault -- authenticated file ingestion and retrieval server.
//!
//! Crash-only design: every startup is a recovery.  Stored files are written
//! with temp-fsync-rename, so there is nothing to repair at boot.  SIGTERM and
//! SIGINT stop accepting connections and give in-flight requests a bounded
//! grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, info, warn};

use filevault::config::{Config, LoggingConfig};
use filevault::rate_limit::WINDOW;
use filevault::storage::backend::FileStore;
use filevault::storage::local::LocalFileStore;
use filevault::storage::memory::MemoryFileStore;

/// Command-line arguments for the FileVault server.
#[derive(Parser, Debug)]
#[command(
    name = "filevault",
    version,
    about = "Authenticated file ingestion and retrieval server"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "filevault.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = filevault::config::load_config(&cli.config)?;

    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    if config.auth.jwt_secret == Config::default().auth.jwt_secret {
        warn!("Using the built-in JWT secret; set JWT_SECRET in production");
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        filevault::metrics::init_metrics()?;
        filevault::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let store: Arc<dyn FileStore> = match config.upload.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage; files will not survive a restart");
            Arc::new(MemoryFileStore::new())
        }
        _ => {
            let local = LocalFileStore::new(&config.upload.storage_path)?;
            info!("Local storage initialized at {}", local.root().display());
            Arc::new(local)
        }
    };

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(filevault::AppState::new(config, store));

    // Idle subjects would otherwise keep their (empty) windows forever.
    let purge_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WINDOW);
        loop {
            ticker.tick().await;
            let removed = purge_state.rate_limiter.purge_idle(Instant::now());
            if removed > 0 {
                debug!("Purged {} idle rate-limit windows", removed);
            }
        }
    });

    let app = filevault::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("FileVault listening on {}", bind_addr);

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let notify = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            notify.notify_one();
        })
        .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = shutdown.notified() => {}
    }

    // No cleanup: the next startup handles anything left half-done.
    match tokio::time::timeout(grace, server).await {
        Ok(result) => result??,
        Err(_) => warn!(
            "In-flight requests still running after {}s, exiting",
            grace.as_secs()
        ),
    }

    info!("FileVault shut down");
    Ok(())
}

/// Initialize tracing.  `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
