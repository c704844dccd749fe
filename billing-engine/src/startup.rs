//! Process wiring: store selection, collaborators, the operational HTTP surface and
//! the billing scheduler.

use crate::config::{BillingConfig, SchedulerConfig};
use crate::jobs::Scheduler;
use crate::services::{
    get_metrics, init_metrics, BillingOrchestrator, BillingStore, Database,
    ManualCollectionGateway, MemoryStore, SystemClock, TracingNotifier,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared by the probe handlers.
#[derive(Clone)]
struct HealthState {
    store: Arc<dyn BillingStore>,
}

/// Liveness: 200 while the store answers.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "billing-engine",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "billing-engine",
                    "error": e.to_string()
                })),
            )
        }
    }
}

async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// The HTTP listener plus the orchestrator the scheduler drives.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    orchestrator: BillingOrchestrator,
    scheduler: SchedulerConfig,
}

impl Application {
    /// Build the application with the configured store and the default collaborators.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn BillingStore> = match &config.database {
            Some(database) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(db)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let orchestrator = BillingOrchestrator::new(
            store,
            Arc::new(SystemClock),
            Arc::new(ManualCollectionGateway),
            Arc::new(TracingNotifier),
            config.billing.clone(),
        );
        Self::build_with_orchestrator(config, orchestrator).await
    }

    /// Build around an already wired orchestrator.
    pub async fn build_with_orchestrator(
        config: BillingConfig,
        orchestrator: BillingOrchestrator,
    ) -> Result<Self, AppError> {
        init_metrics();

        let addr = config.common.bind_address();
        let http_listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Billing engine listener bound");

        Ok(Self {
            http_port,
            http_listener,
            orchestrator,
            scheduler: config.scheduler,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn orchestrator(&self) -> &BillingOrchestrator {
        &self.orchestrator
    }

    /// Serve the operational endpoints and run the scheduler until either stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            store: self.orchestrator.store().clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            )
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        let scheduler = Scheduler::new(self.orchestrator.clone(), self.scheduler);

        tracing::info!(
            service = "billing-engine",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            _ = scheduler.run() => {
                tracing::warn!("Billing scheduler stopped");
            }
        }

        Ok(())
    }
}
