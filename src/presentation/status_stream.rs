// Status stream - Server-sent events carrying the cached status
use crate::application::controller::{SessionController, StatusReport};
use crate::presentation::app_state::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Cached status, one item per poll interval.
pub fn status_updates(controller: Arc<SessionController>) -> impl Stream<Item = StatusReport> {
    async_stream::stream! {
        loop {
            let status = controller.cached_status().await;
            let period = Duration::from_secs_f64(status.connection_health.update_interval.max(0.5));
            yield status;
            tokio::time::sleep(period).await;
        }
    }
}

pub async fn stream_status(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = status_updates(state.controller.clone());
    let events = async_stream::stream! {
        for await status in updates {
            match Event::default().event("status").json_data(&status) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("Could not encode status event: {}", e),
            }
        }
    };
    Sse::new(events).keep_alive(KeepAlive::default())
}
