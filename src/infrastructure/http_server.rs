//! HTTP surface: live event stream, ingest endpoint and health probe

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::ingest::{IngestError, IngestService};
use crate::domain::events::LiveEvent;
use crate::infrastructure::live_broadcaster::LiveBroadcaster;

#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<LiveBroadcaster>,
    pub ingest: Arc<IngestService>,
    /// Open event streams end when this is cancelled
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(live_events_handler))
        .route("/api/incidents", post(ingest_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until the state's shutdown token is cancelled
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Removes the sink once the client's stream is dropped
struct SinkGuard {
    broadcaster: Arc<LiveBroadcaster>,
    id: Uuid,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let broadcaster = self.broadcaster.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { broadcaster.unsubscribe(id).await });
        }
    }
}

async fn live_events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broadcaster.subscribe().await;
    let guard = SinkGuard {
        broadcaster: state.broadcaster.clone(),
        id: subscription.id,
    };

    let stream = ReceiverStream::new(subscription.receiver)
        .take_until(state.shutdown.clone().cancelled_owned())
        .filter_map(move |event| {
            let _sink = &guard;
            futures::future::ready(live_event_to_sse(&event).map(Ok))
        });

    Sse::new(stream)
}

fn live_event_to_sse(event: &LiveEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Event::default().event(event.event_name()).data(data)),
        Err(e) => {
            warn!("Dropping {} event that failed to serialize: {}", event.event_name(), e);
            None
        }
    }
}

async fn ingest_handler(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "malformed_body", "message": rejection.body_text()})),
            )
                .into_response();
        }
    };

    match state.ingest.ingest(body).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::EmptyBatch => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": "empty_batch"}))).into_response()
            }
            IngestError::MalformedBody => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "malformed_body", "message": IngestError::MalformedBody.to_string()})),
            )
                .into_response(),
            IngestError::Validation(issues) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "validation_failed", "issues": issues})),
            )
                .into_response(),
            IngestError::Sync(e) => {
                error!("Ingest failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal", "message": e.to_string()})),
                )
                    .into_response()
            }
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "subscribers": state.broadcaster.subscriber_count().await,
    }))
}
