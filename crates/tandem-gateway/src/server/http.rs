//! HTTP surface of the gateway.
//!
//! `GET /echo?request_id=<id>&message=<text>[&timeout_ms=<n>]` runs one
//! request through [`Gateway::handle`]. The request's cancellation signal is
//! bound to the axum handler future: when the client disconnects, hyper
//! drops that future and the signal fires, while the spawned request task
//! still completes its rollback.

use crate::server::handler::{EchoResponse, Gateway};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use core::future::Future;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::{
    CorrelationId, Error,
    events::Service,
    signal::{CancellationSignal, MAX_TIMEOUT},
    telemetry::InflightGuard,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Non-standard status used when the client closed the request.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Clone)]
pub struct AppState {
    gateway: Gateway,
    default_message: Arc<str>,
    request_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(gateway: Gateway, default_message: &str, request_timeout: Option<Duration>) -> Self {
        Self {
            gateway,
            default_message: Arc::from(default_message),
            request_timeout,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EchoParams {
    pub request_id: Option<String>,
    pub message: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    success: bool,
    error: String,
    kind: &'static str,
}

/// An [`Error`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    correlation_id: Option<CorrelationId>,
    error: Error,
}

impl ApiError {
    pub fn new(correlation_id: Option<CorrelationId>, error: Error) -> Self {
        Self {
            correlation_id,
            error,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.error {
            Error::RequestCancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport { .. } => StatusCode::BAD_GATEWAY,
            Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Transaction(_) | Error::Commit(_) | Error::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.error {
            Error::Transaction(_) => "transaction",
            Error::Commit(_) => "commit",
            Error::RequestCancelled => "cancelled",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Transport { .. } => "transport",
            Error::Internal { .. } => "internal",
            Error::InvalidRequest { .. } => "invalid_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            correlation_id: self.correlation_id.as_ref().map(ToString::to_string),
            success: false,
            error: self.error.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/echo", get(echo))
        .route("/healthz", get(healthz))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serves the gateway on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("Gateway shut down successfully");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn echo(
    State(state): State<AppState>,
    Query(params): Query<EchoParams>,
) -> Result<Json<EchoResponse>, ApiError> {
    let correlation_id = CorrelationId::supplied_or_generate(params.request_id)
        .map_err(|e| ApiError::new(None, e))?;

    let timeout = match params.timeout_ms {
        Some(0) => {
            return Err(ApiError::new(
                Some(correlation_id),
                Error::InvalidRequest {
                    reason: "timeout_ms must be greater than 0".to_string(),
                },
            ));
        }
        Some(ms) if Duration::from_millis(ms) > MAX_TIMEOUT => {
            return Err(ApiError::new(
                Some(correlation_id),
                Error::InvalidRequest {
                    reason: format!("timeout_ms must not exceed {}", MAX_TIMEOUT.as_millis()),
                },
            ));
        }
        Some(ms) => Some(Duration::from_millis(ms)),
        None => state.request_timeout,
    };
    let signal = match timeout {
        Some(timeout) => CancellationSignal::with_timeout(timeout),
        None => CancellationSignal::new(),
    };
    let message = params
        .message
        .unwrap_or_else(|| state.default_message.to_string());

    let guard = signal.bind();
    let gateway = state.gateway.clone();
    let task_id = correlation_id.clone();
    let span = tracing::info_span!("echo", %correlation_id);
    let task = tokio::spawn(
        async move {
            let _inflight = InflightGuard::new(Service::Gateway.as_str());
            gateway.handle(task_id, &message, &signal).await
        }
        .instrument(span),
    );

    let joined = task.await;
    // hyper did not drop us, so the client is still there.
    let _ = guard.disarm();

    match joined {
        Ok(Ok(reply)) => Ok(Json(reply)),
        Ok(Err(e)) => Err(ApiError::new(Some(correlation_id), e)),
        Err(e) => Err(ApiError::new(
            Some(correlation_id),
            Error::Internal {
                context: format!("request task failed: {e}"),
            },
        )),
    }
}
