//! # notifyctl: batch patient notification service
//!
//! `notifyctl` drains a queue of enrolled recipients, sends them to an external communications
//! provider in signed batches, and tracks each message until the recipient has read it.
//!
//! ## Lifecycle of a record
//!
//! ```text
//! new ──claim──▶ (batch tagged) ──reference──▶ requested ──201──▶ sending ──read──▶ read
//!                      │                           │
//!                      │                           └─send failed: stays requested, batch retry armed
//!                      └─reference failed: claim released, back to new
//! ```
//!
//! Statuses only ever move forward; every store write enforces it.
//!
//! ## Components
//!
//! - [`queue`]: the persistent recipient table behind the [`queue::QueueStore`] trait.
//! - [`reference`]: collision-checked message and batch references.
//! - [`provider`]: the HMAC-signed provider client.
//! - [`processor`]: claim, reference, send, mark.
//! - [`scheduler`]: deferred re-invocation with a retry budget and linear backoff.
//! - [`reconcile`]: read-status reconciliation by polling or by webhook, plus the stuck-record
//!   sweeper.
//!
//! Work is triggered externally: a cron-style caller hits `POST /jobs/send`, and the scheduler
//! fires `POST /jobs/batch-retry` and `POST /jobs/status-check` with a `{"batch_id", "retries"}`
//! payload. The `/jobs` routes require `Authorization: Bearer <scheduler.job_token>`. The same
//! jobs can be run once from the command line (`notifyctl send`, ...).
//!
//! ## Database Setup
//!
//! Migrations run on startup:
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::migrate::MigrateError> {
//! notifyctl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod errors;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod reconcile;
pub mod reference;
pub mod scheduler;
pub mod telemetry;
pub mod types;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use bon::Builder;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

pub use config::Config;

use crate::{
    config::{Command, IdempotencyBackend},
    processor::BatchProcessor,
    provider::{MessagingProvider, client::CommsClient},
    queue::{QueueStore, postgres::PostgresQueueStore},
    reconcile::{
        callback::CallbackReconciler,
        idempotency::{IdempotencyStore, MokaIdempotencyStore, PostgresIdempotencyStore},
        poll::PollReconciler,
        sweep::StuckRequestSweeper,
    },
    reference::{ReferenceGenerator, UuidReferenceGenerator},
    scheduler::{ScheduleController, Scheduler, http::HttpScheduler},
};

/// Shared state for the HTTP handlers.
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn QueueStore>,
    pub processor: Arc<BatchProcessor>,
    pub poller: Arc<PollReconciler>,
    pub callbacks: Arc<CallbackReconciler>,
    pub sweeper: Arc<StuckRequestSweeper>,
}

impl AppState {
    /// Wire every component from its collaborators.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn QueueStore>,
        provider: Arc<dyn MessagingProvider>,
        scheduler: Arc<dyn Scheduler>,
        idempotency: Arc<dyn IdempotencyStore>,
        references: Arc<dyn ReferenceGenerator>,
    ) -> Self {
        let schedules = ScheduleController::new(scheduler, config.scheduler.max_retries, config.scheduler.base_delay_minutes);

        let processor = BatchProcessor::new(
            store.clone(),
            provider.clone(),
            references,
            schedules.clone(),
            config.processor.max_batches_per_run,
        );
        let poller = PollReconciler::new(store.clone(), provider, schedules);
        let callbacks = CallbackReconciler::new(store.clone(), idempotency, config.provider.api_key.clone(), config.signing_secret());
        let sweeper = StuckRequestSweeper::new(store.clone());

        AppState::builder()
            .processor(Arc::new(processor))
            .poller(Arc::new(poller))
            .callbacks(Arc::new(callbacks))
            .sweeper(Arc::new(sweeper))
            .store(store)
            .config(config)
            .build()
    }
}

/// Get the notifyctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Build the router: callback webhook, token-guarded job endpoints, health and (optionally)
/// metrics.
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let jobs = Router::new()
        .route("/send", post(api::handlers::jobs::send_batches))
        .route("/batch-retry", post(api::handlers::jobs::retry_batch))
        .route("/status-check", post(api::handlers::jobs::status_check))
        .route("/reconcile", post(api::handlers::jobs::reconcile))
        .route("/sweep", post(api::handlers::jobs::sweep))
        .route_layer(from_fn_with_state(state.clone(), api::middleware::require_job_token));

    let mut router = Router::new()
        .route("/healthz", get(api::handlers::health::healthz))
        .route("/callback", post(api::handlers::callback::receive_callback))
        .nest("/jobs", jobs)
        .with_state(state.clone());

    if state.config.enable_metrics {
        let handle = telemetry::metrics_handle()?;
        router = router.route("/internal/metrics", get(move || async move { handle.render() }));
    }

    Ok(router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    ))
}

/// Connect to Postgres and bring the schema up to date.
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let settings = &config.database.pool;
    let non_zero = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .idle_timeout(non_zero(settings.idle_timeout_secs))
        .max_lifetime(non_zero(settings.max_lifetime_secs))
        .connect(&config.database.url)
        .await?;

    info!("Running database migrations...");
    migrator().run(&pool).await?;
    Ok(pool)
}

/// Production wiring: Postgres store, signed provider client, HTTP scheduler.
fn production_state(config: &Config, pool: &PgPool) -> anyhow::Result<AppState> {
    let store: Arc<dyn QueueStore> = Arc::new(PostgresQueueStore::new(pool.clone()));
    let provider: Arc<dyn MessagingProvider> = Arc::new(CommsClient::new(&config.provider)?);
    let scheduler: Arc<dyn Scheduler> = Arc::new(HttpScheduler::new(&config.scheduler)?);

    let callback = &config.callback;
    let idempotency: Arc<dyn IdempotencyStore> = match callback.idempotency_backend {
        IdempotencyBackend::Memory => Arc::new(MokaIdempotencyStore::new(callback.idempotency_ttl, callback.idempotency_capacity)),
        IdempotencyBackend::Postgres => Arc::new(PostgresIdempotencyStore::new(pool.clone(), callback.idempotency_ttl)),
    };

    Ok(AppState::from_parts(
        config.clone(),
        store,
        provider,
        scheduler,
        idempotency,
        Arc::new(UuidReferenceGenerator),
    ))
}

/// The running service: database pool, wired components and router.
pub struct Application {
    router: Router,
    state: AppState,
    config: Config,
    pool: PgPool,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting notifyctl with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;
        let state = production_state(&config, &pool)?;
        let router = build_router(&state)?;

        Ok(Self {
            router,
            state,
            config,
            pool,
        })
    }

    /// Serve HTTP until `shutdown` resolves, then close the pool and flush telemetry.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("notifyctl listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        close(self.pool).await;
        Ok(())
    }

    /// Run one job to completion, print its report as JSON and exit.
    pub async fn run_once(self, command: Command) -> anyhow::Result<()> {
        let report = match command {
            Command::Serve => anyhow::bail!("serve is not a one-shot job"),
            Command::Send => serde_json::to_value(self.state.processor.run().await?)?,
            Command::Reconcile => serde_json::to_value(self.state.poller.reconcile_all().await?)?,
            Command::Sweep => serde_json::to_value(self.state.sweeper.sweep_stuck_requested().await?)?,
        };

        println!("{}", serde_json::to_string_pretty(&report)?);
        close(self.pool).await;
        Ok(())
    }
}

async fn close(pool: PgPool) {
    info!("Closing database connections...");
    pool.close().await;

    info!("Shutting down telemetry...");
    telemetry::shutdown_telemetry();
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provider::{mock::MockProvider, signing::sign_payload},
        queue::in_memory::InMemoryQueueStore,
        reconcile::callback::tests::{API_KEY, SECRET, callback_body, sent_store},
        scheduler::mock::RecordingScheduler,
        types::{MessageStatus, QueueRecord},
    };
    use bytes::Bytes;
    use axum_test::TestServer;
    use serde_json::{Value, json};

    const JOB_AUTH: &str = "Bearer job-token";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.provider.api_key = API_KEY.to_string();
        config.provider.application_id = "app-id".to_string();
        config.scheduler.job_token = "job-token".to_string();
        config
    }

    fn test_server(store: Arc<InMemoryQueueStore>, provider: MockProvider) -> TestServer {
        let state = AppState::from_parts(
            test_config(),
            store,
            Arc::new(provider),
            Arc::new(RecordingScheduler::new()),
            Arc::new(MokaIdempotencyStore::new(Duration::from_secs(60), 100)),
            Arc::new(UuidReferenceGenerator),
        );
        TestServer::new(build_router(&state).unwrap()).unwrap()
    }

    #[test]
    fn test_signing_secret_matches_callback_secret() {
        assert_eq!(test_config().signing_secret(), SECRET);
    }

    #[test_log::test(tokio::test)]
    async fn test_callback_round_trip() {
        let store = Arc::new(sent_store());
        let server = test_server(store.clone(), MockProvider::new());
        let body = callback_body("ref-1", "idem-1");
        let signature = sign_payload(&body, SECRET).unwrap();

        let response = server
            .post("/callback")
            .add_header("x-api-key", API_KEY)
            .add_header("x-hmac-sha256-signature", signature.as_str())
            .bytes(Bytes::from(body))
            .await;

        response.assert_status_ok();
        assert_eq!(
            response.json::<Value>(),
            json!({"message": "Callback processed", "message_reference": "ref-1", "response_code": 0})
        );
        assert_eq!(store.records()[0].message_status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_callback_status_codes() {
        let store = Arc::new(sent_store());
        let server = test_server(store.clone(), MockProvider::new());
        let body = callback_body("ref-1", "idem-1");
        let signature = sign_payload(&body, SECRET).unwrap();

        let wrong_key = server
            .post("/callback")
            .add_header("x-api-key", "nope")
            .add_header("x-hmac-sha256-signature", signature.as_str())
            .bytes(Bytes::from(body.clone()))
            .await;
        assert_eq!(wrong_key.status_code().as_u16(), 401);

        let tampered = server
            .post("/callback")
            .add_header("x-api-key", API_KEY)
            .add_header("x-hmac-sha256-signature", signature.as_str())
            .bytes(Bytes::from(callback_body("ref-2", "idem-1")))
            .await;
        assert_eq!(tampered.status_code().as_u16(), 403);

        let malformed = b"{\"data\": []}".to_vec();
        let bad_request = server
            .post("/callback")
            .add_header("x-api-key", API_KEY)
            .add_header("x-hmac-sha256-signature", sign_payload(&malformed, SECRET).unwrap().as_str())
            .bytes(Bytes::from(malformed))
            .await;
        assert_eq!(bad_request.status_code().as_u16(), 400);

        assert_eq!(store.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_store_failure_is_500() {
        let store = Arc::new(sent_store());
        store.set_unavailable(true);
        let server = test_server(store, MockProvider::new());
        let body = callback_body("ref-1", "idem-1");
        let signature = sign_payload(&body, SECRET).unwrap();

        let response = server
            .post("/callback")
            .add_header("x-api-key", API_KEY)
            .add_header("x-hmac-sha256-signature", signature.as_str())
            .bytes(Bytes::from(body))
            .await;

        assert_eq!(response.status_code().as_u16(), 500);
        assert_eq!(response.json::<Value>(), json!({"message": "Internal server error"}));
    }

    #[tokio::test]
    async fn test_send_then_status_check_jobs() {
        let store = Arc::new(InMemoryQueueStore::with_records([QueueRecord::builder()
            .nhs_number("9000000009")
            .routing_plan_id("plan-a")
            .build()]));
        let provider = MockProvider::new();
        let server = test_server(store.clone(), provider.clone());

        let sent = server.post("/jobs/send").add_header("authorization", JOB_AUTH).await;
        sent.assert_status_ok();
        let summary = sent.json::<Value>();
        assert_eq!(summary["batches"][0]["outcome"], "sent");
        let batch_id = summary["batches"][0]["batch_id"].as_str().unwrap().to_string();

        let reference = store.records()[0].message_id.clone().unwrap();
        provider.set_read_references(&batch_id, &[reference.as_str()]);

        let checked = server
            .post("/jobs/status-check")
            .add_header("authorization", JOB_AUTH)
            .json(&json!({"batch_id": batch_id, "retries": 1}))
            .await;
        checked.assert_status_ok();
        assert_eq!(checked.json::<Value>()["still_sending"], 0);
        assert_eq!(store.records()[0].message_status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_sweep_and_reconcile_jobs() {
        let server = test_server(Arc::new(InMemoryQueueStore::new()), MockProvider::new());

        let swept = server.post("/jobs/sweep").add_header("authorization", JOB_AUTH).await;
        swept.assert_status_ok();
        assert_eq!(swept.json::<Value>(), json!({"stuck_batches": [], "unreferenced_batches": []}));

        let reconciled = server.post("/jobs/reconcile").add_header("authorization", JOB_AUTH).await;
        reconciled.assert_status_ok();
        assert_eq!(reconciled.json::<Value>(), json!({"batches": []}));
    }

    #[tokio::test]
    async fn test_jobs_require_the_job_token() {
        let store = Arc::new(InMemoryQueueStore::with_records([QueueRecord::builder()
            .nhs_number("9000000009")
            .routing_plan_id("plan-a")
            .build()]));
        let provider = MockProvider::new();
        let server = test_server(store.clone(), provider.clone());

        let anonymous = server.post("/jobs/send").await;
        assert_eq!(anonymous.status_code().as_u16(), 401);

        let wrong = server
            .post("/jobs/batch-retry")
            .add_header("authorization", "Bearer not-the-token")
            .json(&json!({"batch_id": "B1", "retries": 1}))
            .await;
        assert_eq!(wrong.status_code().as_u16(), 401);

        let not_bearer = server.post("/jobs/sweep").add_header("authorization", "job-token").await;
        assert_eq!(not_bearer.status_code().as_u16(), 401);

        assert!(provider.sent_batches().is_empty());
        assert_eq!(store.operation_count(), 0);

        // The health check stays outside the guard
        server.get("/healthz").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_healthz_reports_store_reachability() {
        let store = Arc::new(InMemoryQueueStore::new());
        let server = test_server(store.clone(), MockProvider::new());

        server.get("/healthz").await.assert_status_ok();

        store.set_unavailable(true);
        assert_eq!(server.get("/healthz").await.status_code().as_u16(), 500);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_counters() {
        let store = Arc::new(InMemoryQueueStore::with_records([QueueRecord::builder()
            .nhs_number("9000000009")
            .routing_plan_id("plan-a")
            .build()]));
        let server = test_server(store, MockProvider::new());

        server.post("/jobs/send").add_header("authorization", JOB_AUTH).await.assert_status_ok();

        let metrics = server.get("/internal/metrics").await;
        metrics.assert_status_ok();
        assert!(metrics.text().contains("notifyctl_batches_sent_total"));
    }
}
