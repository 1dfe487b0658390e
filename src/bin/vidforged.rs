use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use vidforge::api::{AppState, create_router};
use vidforge::cleanup::{CleanupConfig, RetentionEngine};
use vidforge::config::ServerConfig;
use vidforge::db::Database;
use vidforge::ingest::{IngestConfig, SessionManager};
use vidforge::logging::{self, LogConfig};
use vidforge::push::{NotificationLevel, PushBus};
use vidforge::space::DiskBudget;
use vidforge::store::ChunkStore;
use vidforge::tasks::{ConversionEngine, Encoder, EncoderConfig, EngineConfig};
use vidforge_api::models::DiskSpaceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .map(Ok)
        .unwrap_or_else(ServerConfig::default_path)?;
    let config = ServerConfig::load(&config_path)?;
    config.ensure_directories()?;

    // Keep the guard alive for the entire application lifetime
    let _log_guard = logging::init_logging(LogConfig {
        log_dir: config.logs_dir(),
        ..LogConfig::default()
    })
    .context("Failed to initialize logging system")?;

    tracing::info!(target: "main", "Starting VidForge server...");

    let db = Arc::new(Database::with_path(config.db_path()).context("Failed to open database")?);
    let push = PushBus::new(256);
    tracing::info!(target: "main", "Push bus initialized");

    let budget = Arc::new(
        DiskBudget::new(
            db.clone(),
            push.clone(),
            config.uploads_dir(),
            config.outputs_dir(),
            config.temp_dir(),
            DiskSpaceConfig {
                max_total_space_gb: config.max_total_space_gb,
                reserved_space_gb: config.reserved_space_gb,
                is_enabled: config.disk_budget_enabled,
            },
        )
        .context("Failed to initialize disk budget")?,
    );
    budget
        .refresh()
        .await
        .context("Failed to compute initial disk usage")?;
    tracing::info!(target: "main", "Disk budget initialized");

    let engine = ConversionEngine::new(
        db.clone(),
        push.clone(),
        budget.clone(),
        Encoder::new(EncoderConfig {
            binary: config.encoder_binary.clone(),
            kill_grace: config.encoder_kill_grace(),
        }),
        EngineConfig {
            max_concurrent: config.max_concurrent_conversions,
            outputs_dir: config.outputs_dir(),
            progress_interval: Duration::from_millis(500),
        },
    );
    engine
        .recover_interrupted()
        .context("Failed to recover interrupted conversions")?;
    engine.spawn_scheduler();
    tracing::info!(target: "main", "Conversion engine started");

    let store = ChunkStore::new(config.temp_dir(), config.uploads_dir());
    let sessions = SessionManager::new(
        store.clone(),
        budget.clone(),
        engine.clone(),
        IngestConfig {
            chunk_size: config.chunk_size,
            max_file_size: config.max_file_size,
            quick_fingerprint_threshold: config.quick_fingerprint_threshold,
            verify_final_fingerprint: config.verify_final_fingerprint,
            session_ttl: config.session_ttl(),
        },
    );
    let rebuilt = sessions
        .rebuild_from_disk()
        .await
        .context("Failed to rebuild upload sessions")?;
    sessions.spawn_ttl_sweeper(Duration::from_secs(
        config.session_sweep_interval_minutes * 60,
    ));
    tracing::info!(
        target: "main",
        rebuilt_sessions = rebuilt,
        "Upload session manager started"
    );

    let cleanup = RetentionEngine::new(
        db.clone(),
        budget.clone(),
        push.clone(),
        store,
        sessions.clone(),
        config.outputs_dir(),
        config.logs_dir(),
        CleanupConfig {
            retention_hours: config.retention_hours as i64,
            temp_max_age_hours: config.temp_max_age_hours as i64,
            log_max_age_days: config.log_max_age_days as i64,
            aggressive_percent: config.aggressive_cleanup_percent,
            emergency_percent: config.emergency_cleanup_percent,
        },
    );
    cleanup.spawn_sweeper(Duration::from_secs(config.cleanup_interval_minutes * 60));
    tracing::info!(target: "main", "Retention engine started");

    let state = AppState {
        sessions,
        engine: engine.clone(),
        budget,
        cleanup,
        push: push.clone(),
    };

    let app = create_router(state, config.max_chunk_body as usize)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    tracing::info!(target: "main", "HTTP server listening on http://{}", config.bind_addr);
    tracing::info!(target: "main", "Realtime hub available at ws://{}/conversionHub", config.bind_addr);

    push.system_notification("VidForge server started", NotificationLevel::Info);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine, push))
        .await
        .context("Server error")?;

    tracing::info!(target: "main", "Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal and perform cleanup
async fn shutdown_signal(engine: Arc<ConversionEngine>, push: PushBus) {
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
            tracing::info!(target: "main", "Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!(target: "main", "Received SIGTERM signal");
        },
    }

    tracing::info!(target: "main", "Shutting down gracefully...");
    push.system_notification("VidForge server shutting down", NotificationLevel::Warning);

    // Give hub clients a moment to receive the notification
    tokio::time::sleep(Duration::from_millis(300)).await;

    engine.shutdown().await;
    tracing::info!(target: "main", "Conversion engine stopped");
}
