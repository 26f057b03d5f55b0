//! Run endpoints — message submission, inspection, interrupt, and the
//! resumable event stream.
//!
//! - `POST /sessions/:sid/messages`            — admit + enqueue a run
//! - `GET  /sessions/:sid/runs/:rid`           — run record
//! - `POST /sessions/:sid/runs/:rid/interrupt` — cooperative cancel
//! - `GET  /sessions/:sid/runs/:rid/stream`    — SSE, honors `Last-Event-ID`

use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_core::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use ra_domain::ApiError;

use crate::runtime::store::{EventRecord, RunRecord, RuntimeStore};
use crate::state::AppState;

use super::auth::Tenant;
use super::ApiResult;

pub(crate) fn run_json(run: &RunRecord, reused: Option<bool>) -> Value {
    let mut body = serde_json::json!({
        "run_id": run.run_id,
        "session_id": run.session_id,
        "message": run.message,
        "status": run.status,
        "created_at": run.created_at,
        "started_at": run.started_at,
        "ended_at": run.ended_at,
        "error": run.error,
        "interrupt_requested": run.interrupt_requested,
        "pending_approval_id": run.pending_approval_id,
        "usage_tokens": run.usage_tokens,
        "estimated_cost_usd": run.estimated_cost_usd,
        "event_count": run.events.len(),
        "events": run.events,
    });
    if let Some(reused) = reused {
        body["reused"] = Value::Bool(reused);
    }
    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:sid/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct CreateMessageBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn create_message(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    body: Option<Json<CreateMessageBody>>,
) -> ApiResult<Json<Value>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let message = body
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::bad_request("message is required"))?;

    let (run, reused) = state.store.create_run(
        &session_id,
        message,
        body.idempotency_key.as_deref(),
        Some(&tenant.0),
    )?;
    if !reused {
        state.scheduler.enqueue(&session_id, &run.run_id);
        tracing::info!(%session_id, run_id = %run.run_id, "run enqueued");
    }
    Ok(Json(run_json(&run, Some(reused))))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions/:sid/runs/:rid
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_run(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, run_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let run = state.store.get_run(&session_id, &run_id, Some(&tenant.0))?;
    Ok(Json(run_json(&run, None)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:sid/runs/:rid/interrupt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn interrupt_run(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, run_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let run = state
        .store
        .interrupt_run(&session_id, &run_id, Some(&tenant.0))?;
    tracing::info!(%session_id, %run_id, status = run.status.as_str(), "interrupt requested");
    Ok(Json(run_json(&run, None)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions/:sid/runs/:rid/stream (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stream_run(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, run_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    // Tenant check happens here, before the stream body starts.
    let start_index = state.store.event_index_after(
        &session_id,
        &run_id,
        last_event_id.as_deref(),
        Some(&tenant.0),
    )?;

    let rx = state.store.subscribe_events(&run_id);
    let stream = make_event_stream(state.store.clone(), session_id, run_id, start_index, rx);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn sse_frame(event: &EventRecord) -> Event {
    Event::default()
        .id(event.event_id.clone())
        .event(event.event_type.as_str())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// Snapshot + follow: emit the journal from `start_index`, then chase
/// new appends via the run's signal channel until the run is terminal,
/// emit whatever is left, and close. At-least-once delivery — clients
/// dedupe by `event_id`.
fn make_event_stream(
    store: std::sync::Arc<RuntimeStore>,
    session_id: String,
    run_id: String,
    start_index: usize,
    mut rx: broadcast::Receiver<u32>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut index = start_index;
        let mut channel_closed = false;

        loop {
            let (events, status) = match store.snapshot_events(&session_id, &run_id, None) {
                Ok(snapshot) => snapshot,
                Err(_) => break,
            };
            while index < events.len() {
                yield Ok(sse_frame(&events[index]));
                index += 1;
            }
            if status.is_terminal() {
                break;
            }
            if channel_closed {
                // Terminal cleanup raced us; the next snapshot already
                // drained everything there was.
                break;
            }

            match rx.recv().await {
                Ok(_) => {}
                // Lagged is fine — the journal snapshot above catches up.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    channel_closed = true;
                }
            }
        }
    }
}
