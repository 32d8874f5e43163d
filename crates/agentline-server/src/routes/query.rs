//! Query endpoint with SSE streaming and out-of-band cancellation.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::post,
    Json, Router,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use agentline_core::events::{EventEnvelope, QueryEvent};
use agentline_core::QueryRequest;

use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::types::{CancelBody, CancelResponse, QueryBody};
use crate::AppState;

const SSE_CHANNEL_BUFFER: usize = 256;
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(start_query))
        .route("/:query_id/cancel", post(cancel_query))
}

/// `query_{unix_ms}_{8 hex}`
fn new_query_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "query_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

async fn start_query(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse, AppError> {
    if body.query_text.trim().is_empty() {
        return Err(AppError::BadRequest("Query text must not be empty".to_string()));
    }

    let query_id = body
        .query_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_query_id);
    let preview: String = body.query_text.chars().take(100).collect();
    tracing::info!(
        "User {} submitted query {}: {}",
        principal.username.as_deref().unwrap_or(&principal.user_id),
        query_id,
        preview
    );

    let selection = body.selection();
    let request = QueryRequest {
        query_id: query_id.clone(),
        query_text: body.query_text.clone(),
        principal,
        selection,
        session_id: body.session_id.clone().filter(|id| !id.trim().is_empty()),
        model_id: body.model_id.clone(),
        attachments: body.into_attachments(),
    };

    let cancel = CancellationToken::new();
    let events = state.orchestrator.run(request, cancel.clone());

    let (sse_tx, sse_rx) = mpsc::channel::<Result<Event, Infallible>>(SSE_CHANNEL_BUFFER);
    let poll_interval = state.query_config.disconnect_poll_interval();
    tokio::spawn(forward_events(events, sse_tx, cancel, query_id, poll_interval));

    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (X_ACCEL_BUFFERING, "no"),
    ];
    let stream = ReceiverStream::new(sse_rx);
    Ok((headers, Sse::new(stream).keep_alive(KeepAlive::default())))
}

/// Relay orchestrator events to the SSE body while watching for a disconnect.
///
/// The client going away cancels the query. A sequence that closes without a
/// terminal event gets a trailing error so the stream never ends silently.
async fn forward_events(
    mut events: ReceiverStream<EventEnvelope>,
    sse_tx: mpsc::Sender<Result<Event, Infallible>>,
    cancel: CancellationToken,
    query_id: String,
    poll_interval: Duration,
) {
    let mut watcher = tokio::time::interval(poll_interval);
    let mut session_id = None;
    let mut terminal_seen = false;

    loop {
        tokio::select! {
            next = events.next() => {
                let Some(envelope) = next else { break };
                terminal_seen |= envelope.event.is_terminal();
                if envelope.session_id.is_some() {
                    session_id = envelope.session_id.clone();
                }
                if sse_tx.send(Ok(to_sse_event(&envelope))).await.is_err() {
                    tracing::info!("Client for query {} went away mid-send, cancelling", query_id);
                    cancel.cancel();
                    return;
                }
            }
            _ = watcher.tick() => {
                if sse_tx.is_closed() {
                    tracing::info!("Client for query {} disconnected, cancelling", query_id);
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    if !terminal_seen {
        tracing::error!("Query {} closed without a terminal event", query_id);
        let envelope = EventEnvelope::new(
            QueryEvent::error("Query ended unexpectedly, please retry"),
            session_id,
        );
        let _ = sse_tx.send(Ok(to_sse_event(&envelope))).await;
    }
}

fn to_sse_event(envelope: &EventEnvelope) -> Event {
    Event::default().json_data(envelope).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize {} event: {}", envelope.event.kind(), e);
        Event::default().data(r#"{"type":"error","content":"Failed to encode event"}"#)
    })
}

async fn cancel_query(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(query_id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Json<CancelResponse> {
    let reason = body.and_then(|Json(body)| body.reason);

    // Only the submitter or an admin may stop a query; others see it as unknown
    let permitted = state
        .registry()
        .get(&query_id)
        .is_some_and(|entry| principal.is_elevated() || entry.principal == principal.user_id);
    if !permitted && state.registry().contains(&query_id) {
        tracing::warn!(
            "User {} tried to cancel query {} owned by someone else",
            principal.user_id,
            query_id
        );
    }

    if permitted && state.orchestrator.cancel(&query_id) {
        tracing::info!(
            "Query {} cancelled by {} (reason: {})",
            query_id,
            principal.user_id,
            reason.as_deref().unwrap_or("none")
        );
        Json(CancelResponse {
            success: true,
            query_id,
            message: Some("Cancellation requested".to_string()),
            error: None,
            reason,
        })
    } else {
        Json(CancelResponse {
            success: false,
            query_id,
            message: None,
            error: Some("Query not found or already completed".to_string()),
            reason,
        })
    }
}
