//! Funding Reconciler: entry point.
//!
//! Hosts the funding engine over SQLite-backed repositories: a background
//! task ticks the reconciliation scheduler (campaign expiry, evidence
//! deadlines, reminders, consistency bonus, stale donations), every
//! dispatched domain event is journaled, and an Axum API drives campaigns,
//! donations and evidence, serves the journal and scores, and receives
//! collaborator callbacks.

mod api;
mod config;
mod db;
mod errors;
mod gateway;
mod journal;
mod runner;
mod store;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use funding_engine::{Engine, InMemoryDirectory, ReconciliationScheduler, SystemClock};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use gateway::DeferredGateway;
use journal::JournalSubscriber;
use runner::RunnerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // ─── Engine ───────────────────────────────────────────
    let directory = Arc::new(InMemoryDirectory::default());
    let organizations = db::load_organizations(&pool).await?;
    info!("Loaded {} organizations", organizations.len());
    for (organization_id, owner, verified) in organizations {
        directory.register(organization_id, owner, verified);
    }

    let store = store::SqliteStore::new(pool.clone(), tokio::runtime::Handle::current());
    let engine = Arc::new(Engine::new(
        store.repositories(),
        Arc::new(DeferredGateway),
        directory.clone(),
        Arc::new(SystemClock),
        config.engine_config(),
    ));

    let cancel = CancellationToken::new();

    // ─── Event journal ────────────────────────────────────
    let (journal_tx, journal_rx) = tokio::sync::mpsc::unbounded_channel();
    engine.subscribe(Arc::new(JournalSubscriber::new(journal_tx)));
    let journal_task = tokio::spawn(journal::run_writer(
        pool.clone(),
        journal_rx,
        cancel.clone(),
    ));

    // ─── Background scheduler ─────────────────────────────
    let runner_state = Arc::new(RunnerState {
        pool: pool.clone(),
        scheduler: Arc::new(ReconciliationScheduler::new(engine.clone())),
        tick_interval_secs: config.tick_interval_secs,
    });
    let runner_task = tokio::spawn(runner::run(runner_state, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        engine,
        directory,
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/events", get(api::get_all_events))
        .route("/campaigns/:id/events", get(api::get_campaign_events))
        .route("/organizations/:id/events", get(api::get_organization_events))
        .route("/scores/:id", get(api::get_score))
        .route("/scores/:id/history", get(api::get_score_history))
        .route("/scores/:id/audit", get(api::get_score_audit))
        .route("/leaderboard", get(api::get_leaderboard))
        .route("/organizations/:id/campaigns", post(api::create_campaign))
        .route("/campaigns/:id", get(api::get_campaign))
        .route("/campaigns/:id/transition", post(api::transition_campaign))
        .route("/campaigns/:id/donations", post(api::donate))
        .route("/campaigns/:id/evidence", post(api::upload_evidence))
        .route(
            "/campaigns/:id/evidence/summary",
            get(api::get_evidence_summary),
        )
        .route("/donations/:id", get(api::get_donation))
        .route("/donations/:id/checkout", post(api::checkout_donation))
        .route("/donations/:id/refund", post(api::refund_donation))
        .route("/evidence/:id/review", post(api::review_evidence))
        .route("/payments/callback", post(api::payment_callback))
        .route("/organizations/:id/verified", post(api::organization_verified))
        .route(
            "/organizations/:id/unverified",
            post(api::organization_unverified),
        )
        .route(
            "/organizations/:id/reports/:report_id/upheld",
            post(api::report_upheld),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    // Stop the background tasks even if the server exited on its own.
    cancel.cancel();
    runner_task.await?;
    journal_task.await?;
    info!("Reconciler stopped");

    Ok(())
}
