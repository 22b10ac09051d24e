//! Server-Sent Events stream of worktree lifecycle notifications.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use crew::io::worktree::WorktreeEvent;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

/// GET /api/worktrees/events
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(state.manager.subscribe())).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// `connected`, then one event per manager notification, named after it
/// (`worktree.create`, `worktree.prune`, ...).
pub fn event_stream(
    mut rx: broadcast::Receiver<WorktreeEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => yield Ok(Event::default().event(event.name.as_str()).data(json)),
                    Err(err) => warn!(err = %err, name = %event.name, "failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("worktree event channel closed");
                    break;
                }
            }
        }
    }
}
