use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use channel_relay::api::{AppState, spawn_api_server};
use channel_relay::channels::{Sink, Source, TelegramChannel};
use channel_relay::config::RelayConfig;
use channel_relay::policy::{AdminService, PolicyStore};
use channel_relay::recorder::{Recorder, spawn_prune_task};
use channel_relay::relay::{BackfillController, Forwarder, Limiters, LiveHealth, spawn_live_task};
use channel_relay::stats::Stats;
use channel_relay::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("Failed to load configuration")?;

    // Keep the guard alive for the whole process so buffered file logs flush.
    let _log_guard = init_tracing(&config);

    eprintln!("📡 Channel Relay v{}", env!("CARGO_PKG_VERSION"));
    for route in &config.routes {
        eprintln!("   Route: {route}");
    }
    eprintln!(
        "   Quota: {} messages / {}s ({:?})",
        config.quota.messages,
        config.quota.window.as_secs(),
        config.quota_scope
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Policy and admission ─────────────────────────────────────────────
    let policy = Arc::new(PolicyStore::load(db.as_ref()).await?);
    let rows = db.load_policy().await?;
    let quota = config.quota.with_overrides(&rows);
    let limiters = Arc::new(Limiters::new(quota, config.quota_scope));
    let recorder = Arc::new(Recorder::new(Arc::clone(&db)));
    let admin = Arc::new(AdminService::new(
        Arc::clone(&db),
        Arc::clone(&policy),
        Arc::clone(&limiters),
        config.admin_ids.clone(),
    ));
    if config.admin_ids.is_empty() {
        warn!("RELAY_ADMIN_IDS is empty; administrative endpoints will reject every request");
    }

    // ── Provider ─────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(config.bot_token.clone()));
    if let Err(e) = telegram.health_check().await {
        warn!(error = %e, "Telegram health check failed; continuing");
    }
    let source: Arc<dyn Source> = telegram.clone();
    let sink: Arc<dyn Sink> = telegram.clone();

    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&db),
        sink,
        Arc::clone(&policy),
        Arc::clone(&limiters),
        Arc::clone(&recorder),
        config.retry,
    ));

    // ── Ingestion ────────────────────────────────────────────────────────
    let backfill = Arc::new(BackfillController::new(
        Arc::clone(&db),
        Arc::clone(&source),
        Arc::clone(&forwarder),
        Arc::clone(&policy),
        Arc::clone(&recorder),
        &config.routes,
        config.page_size,
        config.retry,
    ));

    let live = Arc::new(LiveHealth::new());
    let mut live_handles = Vec::new();
    if config.forward_live {
        for route in &config.routes {
            live_handles.push(spawn_live_task(
                Arc::clone(&source),
                Arc::clone(&forwarder),
                Arc::clone(&recorder),
                Arc::clone(&live),
                *route,
            ));
        }
    } else {
        info!("Live forwarding disabled");
    }

    if !config.forward_history {
        info!("History backfill disabled");
    } else if !backfill.supports_history() {
        warn!(
            source = source.name(),
            "Source cannot serve history; backfill requests will be rejected"
        );
    } else {
        let resumed = backfill.resume_incomplete().await?;
        if !resumed.is_empty() {
            eprintln!("   Resumed backfill for {} channel(s)", resumed.len());
        }
    }

    let _prune_handle = spawn_prune_task(Arc::clone(&recorder), config.error_retention);

    // ── API ──────────────────────────────────────────────────────────────
    let stats = Arc::new(Stats::new(
        Arc::clone(&db),
        Arc::clone(&policy),
        Arc::clone(&limiters),
        Arc::clone(&backfill),
        live,
    ));
    let state = AppState {
        admin,
        backfill: Arc::clone(&backfill),
        stats,
        recorder,
    };
    let (addr, _api_handle) = spawn_api_server(config.api_addr, state)
        .await
        .with_context(|| format!("Failed to bind API server on {}", config.api_addr))?;
    eprintln!("   API: http://{addr}");
    eprintln!("   Press Ctrl+C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    backfill.shutdown().await;
    telegram.shutdown().await;
    for handle in live_handles {
        handle.abort();
    }
    Ok(())
}

/// Install the stderr subscriber, plus a daily rolling file when a log
/// directory is configured.
fn init_tracing(config: &RelayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "channel-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}
