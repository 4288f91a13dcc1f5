//! Request Orchestrator (spec.md §4.E): the HTTP front-end wiring (C),
//! (B), and (D) together in the order spec.md §4.E prescribes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::policy::apply_degradation;
use crate::queue::{BatchingQueue, Counters, InFlightGuard};
use crate::supervisor::Supervisor;
use crate::worker::WorkerClient;

const X_REQUEST_ID: &str = "x-request-id";

const COLD_START_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub client: Arc<WorkerClient>,
    pub counters: Arc<Counters>,
    pub queue: Option<Arc<BatchingQueue>>,
    pub supervisor: Option<Arc<Supervisor>>,
    pub metrics: Arc<Metrics>,
}

/// Wraps the router with the teacher's observability layering: a
/// `TraceLayer` span per request, sandwiched between minting an
/// `X-Request-Id` (if the client didn't supply one) and propagating it
/// onto the response.
pub fn router(state: AppState) -> Router {
    let request_id_header = HeaderName::from_static(X_REQUEST_ID);

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(models))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id_header.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header)),
        )
        .with_state(state)
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn overload_response(retry_after: u64, reason: &str) -> Response {
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": "overload", "reason": reason}),
    );
    if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, v);
    }
    response
}

fn cold_start_timeout_response() -> Response {
    let mut response = json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": "worker not ready", "message": "cold start timeout"}),
    );
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
    response
}

async fn chat_completions(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let span = tracing::info_span!("chat_completions", %request_id);
    let _enter = span.enter();

    let body: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "rejecting malformed request body");
            return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid json body"}));
        }
    };

    // Step 2-3: admission. The check and the counter increment happen
    // together, right here, with no `await` between them (spec.md §5) --
    // *before* the supervisor is touched, so a rejected request never
    // affects worker state. The reservation (in_flight for the direct
    // path, pending for the batched path) is held until the request's
    // own response is ready; `depth_before` is the depth the degradation
    // tier is computed against.
    let batched = state.config.batch_window_ms > 0;
    let (admission, depth_before) = if batched {
        state.counters.try_admit_pending(state.config.q_max)
    } else {
        state.counters.try_admit_in_flight(state.config.q_max)
    };
    if !admission.admitted {
        info!(reason = %admission.reason, "request rejected: overload");
        return overload_response(admission.retry_after_seconds, &admission.reason);
    }
    let guard = if batched {
        None
    } else {
        Some(InFlightGuard::new(&state.counters))
    };

    if state.config.supervisor_enabled {
        if let Some(supervisor) = &state.supervisor {
            supervisor.request_activity().await;
            supervisor.start_if_needed().await;
            if !supervisor.await_ready(COLD_START_TIMEOUT).await {
                warn!("cold start timed out");
                if let Some(guard) = guard {
                    guard.disarm();
                }
                if batched {
                    state.counters.release_pending();
                } else {
                    state.counters.release_in_flight();
                }
                return cold_start_timeout_response();
            }
        }
    }

    let (body, tier) = apply_degradation(&body, depth_before);
    info!(tier = tier.tier, label = tier.label, "degradation tier applied");

    if !batched {
        let guard = guard.expect("direct path always holds an in_flight reservation");
        let result = state.client.forward_chat_completions(&body).await;
        guard.disarm();
        state.counters.release_in_flight();

        return match result {
            Ok(forwarded) => (forwarded.status, Json(forwarded.body)).into_response(),
            Err(e) => {
                warn!(error = %e, "upstream transport failure");
                json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()}))
            }
        };
    }

    let queue = state
        .queue
        .as_ref()
        .expect("batching queue must exist when batch_window_ms > 0");
    let rx = queue.enqueue_reserved(body).await;
    match rx.await {
        Ok(resp) => (resp.status, Json(resp.body)).into_response(),
        Err(_) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "flush handle dropped before completion"}),
        ),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let mut body = json!({
        "status": "ok",
        "batch_window_ms": state.config.batch_window_ms,
    });
    if let Some(supervisor) = &state.supervisor {
        body["worker_state"] = json!(supervisor.state().await.as_str());
    }
    json_response(StatusCode::OK, body)
}

async fn metrics(State(state): State<AppState>) -> Response {
    let worker_state_metric = if state.config.supervisor_enabled {
        if let Some(supervisor) = &state.supervisor {
            Some(supervisor.state().await.as_metric())
        } else {
            None
        }
    } else {
        None
    };

    match state
        .metrics
        .render(state.counters.pending(), state.counters.in_flight(), worker_state_metric)
    {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
    }
}

async fn models(State(state): State<AppState>) -> Response {
    match state.client.get_models().await {
        Ok(forwarded) => (forwarded.status, Json(forwarded.body)).into_response(),
        Err(e) => {
            warn!(error = %e, "models proxy: upstream transport failure");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()}))
        }
    }
}
