//! labrun worker service: HTTP surface plus the reconciliation worker pool.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use labrun_core::observability::{LogFormat, init_logging};
use labrun_core::storage::{ObjectStoreBackend, StorageBackend};
use labrun_flow::config::OrchestratorConfig;
use labrun_flow::dispatch::memory::InMemoryTaskQueue;
use labrun_flow::dispatch::{EnqueueResult, TaskEnvelope, TaskQueue};
use labrun_flow::error::{Error, Result};
use labrun_flow::experiment::{Experiment, ExperimentStatus};
use labrun_flow::lab::http::HttpLabConnector;
use labrun_flow::notify::{LogNotifier, Notifier, WebhookNotifier};
use labrun_flow::orchestrator::Orchestrator;
use labrun_flow::store::ExperimentStore;
use labrun_flow::store::memory::InMemoryStore;
use labrun_flow::worker::WorkerPool;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryTaskQueue>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            Error::ExperimentNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidExperimentState { .. }
            | Error::InvalidStatusTransition { .. }
            | Error::SubmissionBusy { .. }
            | Error::EnvironmentLimitReached { .. } => StatusCode::CONFLICT,
            Error::NoAvailableZone { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnknownTask { .. } | Error::InvalidTaskArgument { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn create_experiment_handler(
    State(state): State<AppState>,
    Json(mut experiment): Json<Experiment>,
) -> std::result::Result<(StatusCode, Json<Experiment>), ApiError> {
    if experiment.id <= 0 {
        return Err(ApiError::bad_request("experiment id must be positive"));
    }
    experiment.status = ExperimentStatus::Draft;
    state.store.insert(experiment.clone())?;
    tracing::info!(experiment_id = experiment.id, "draft experiment registered");
    Ok((StatusCode::CREATED, Json(experiment)))
}

async fn get_experiment_handler(
    State(state): State<AppState>,
    Path(experiment_id): Path<i64>,
) -> std::result::Result<Json<Experiment>, ApiError> {
    let experiment = state
        .store
        .get(experiment_id)
        .await?
        .ok_or(Error::ExperimentNotFound { experiment_id })?;
    Ok(Json(experiment))
}

async fn submit_handler(
    State(state): State<AppState>,
    Path(experiment_id): Path<i64>,
) -> std::result::Result<Json<Experiment>, ApiError> {
    Ok(Json(state.orchestrator.submit(experiment_id).await?))
}

async fn terminate_handler(
    State(state): State<AppState>,
    Path(experiment_id): Path<i64>,
) -> std::result::Result<Json<Experiment>, ApiError> {
    Ok(Json(
        state.orchestrator.request_termination(experiment_id).await?,
    ))
}

async fn enqueue_task_handler(
    State(state): State<AppState>,
    Json(envelope): Json<TaskEnvelope>,
) -> std::result::Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    if envelope.kind().is_none() {
        return Err(Error::UnknownTask {
            name: envelope.name,
        }
        .into());
    }
    let response = match state.queue.enqueue(envelope).await? {
        EnqueueResult::Enqueued { message_id } => (
            StatusCode::ACCEPTED,
            EnqueueResponse {
                status: "enqueued",
                message_id: Some(message_id),
            },
        ),
        EnqueueResult::Deduplicated {
            existing_message_id,
        } => (
            StatusCode::OK,
            EnqueueResponse {
                status: "deduplicated",
                message_id: Some(existing_message_id),
            },
        ),
        EnqueueResult::QueueFull => (
            StatusCode::SERVICE_UNAVAILABLE,
            EnqueueResponse {
                status: "queue_full",
                message_id: None,
            },
        ),
    };
    Ok((response.0, Json(response.1)))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn resolve_port() -> Result<u16> {
    if let Ok(port) = std::env::var("PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid PORT"));
    }

    if let Ok(port) = std::env::var("LABRUN_PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid LABRUN_PORT"));
    }

    Ok(8080)
}

fn log_format_from_env() -> LogFormat {
    optional_env("LABRUN_LOG_FORMAT").map_or(LogFormat::Pretty, |value| {
        LogFormat::from_name(&value)
    })
}

fn build_storage() -> Result<Arc<dyn StorageBackend>> {
    let backend = match optional_env("LABRUN_STORAGE_ROOT") {
        Some(root) => ObjectStoreBackend::local(&root)?,
        None => {
            tracing::warn!("LABRUN_STORAGE_ROOT not set, using in-memory object storage");
            ObjectStoreBackend::in_memory()
        }
    };
    Ok(Arc::new(backend))
}

fn build_notifier(config: &OrchestratorConfig) -> Result<Arc<dyn Notifier>> {
    let Some(url) = optional_env("LABRUN_NOTIFY_URL") else {
        return Ok(Arc::new(LogNotifier));
    };
    let recipients = optional_env("LABRUN_NOTIFY_RECIPIENTS")
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(Arc::new(WebhookNotifier::new(
        url,
        recipients,
        config.lab_request_timeout,
    )?))
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let config = OrchestratorConfig::from_env()?;
    let port = resolve_port()?;

    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new(config.queue_name.clone()));
    let connector = Arc::new(HttpLabConnector::new(config.lab_request_timeout)?);
    let notifier = build_notifier(&config)?;
    let storage = build_storage()?;

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store.clone(),
        queue.clone(),
        storage,
        connector,
        notifier,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::new(Arc::clone(&orchestrator), queue.clone());
    let workers = pool.spawn(&shutdown_rx);
    tracing::info!(workers = workers.len(), "worker pool started");

    let state = AppState {
        orchestrator,
        store,
        queue,
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/experiments", post(create_experiment_handler))
        .route("/experiments/{id}", get(get_experiment_handler))
        .route("/experiments/{id}/submit", post(submit_handler))
        .route("/experiments/{id}/terminate", post(terminate_handler))
        .route("/tasks", post(enqueue_task_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind: {e}")))?;
    tracing::info!(%addr, "labrun worker listening");

    let mut server_shutdown = shutdown_rx.clone();
    tokio::spawn(shutdown_signal(shutdown_tx));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))?;

    for worker in workers {
        if let Err(error) = worker.await {
            tracing::error!(%error, "worker exited abnormally");
        }
    }
    Ok(())
}
