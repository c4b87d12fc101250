//! Application entry point for the `fatigue-monitor` service.
//!
//! Startup sequence:
//! - Load `.env` and the configuration snapshot
//! - Initialize structured logging/tracing
//! - Connect the PostgreSQL pool and create the schema if needed
//! - Build the `Monitor` and spawn the ingest, persist and device loops
//! - Serve the HTTP/WebSocket routes until Ctrl-C or SIGTERM
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `INTEGRATOR_MODE` (optional) – `mock` (default) or `live`
//! - `LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `LOG_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the full list.
use std::{env, io::IsTerminal, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use fatigue_monitor::config::{self, mask_db_url};
use fatigue_monitor::routes::{self, AppState};
use fatigue_monitor::schema;
use fatigue_monitor::store::PgStore;
use fatigue_monitor::Monitor;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", mask_db_url(&cfg.db_url));

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .with_context(|| format!("Failed to connect to database '{}'", mask_db_url(&cfg.db_url)))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let monitor = Arc::new(Monitor::new(&cfg, PgStore::new(pool.clone()))?);
    let cancel = CancellationToken::new();
    let jobs = monitor.spawn_jobs(&cancel);

    let state = AppState::new(Arc::clone(&monitor), cfg.broadcast_interval, cancel.clone());
    let app = routes::router(state);

    tracing::info!("Listening on {}", cfg.listen_addr);
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    for job in jobs {
        if let Err(e) = job.await {
            tracing::warn!(error = %e, "background job ended abnormally");
        }
    }
    pool.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM and cancel every background loop.
async fn shutdown_signal(cancel: CancellationToken) {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => {},
    }

    tracing::info!("Shutdown signal received");
    cancel.cancel();
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY on stdout
/// - Span event emission mode controlled by the `LOG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Filtering:
///   - `RUST_LOG`, when set, is used verbatim
///   - otherwise `LOG_LEVEL` (`trace|debug|info|warn|error`, default
///     `debug`) applies to every target except `sqlx::query`, held at `warn`
///
/// Call once at startup, before the config snapshot is logged.
fn init_tracing() {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
