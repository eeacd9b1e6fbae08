//! Server-Sent Events (SSE) endpoint.
//!
//! `GET /events` streams a bounded run of `notification` events, one every
//! `sse.interval_ms`, with data `Event 0`, `Event 1`, ... up to
//! `sse.event_count`, then ends. Each request gets its own independent
//! sequence; nothing here touches the WebSocket gateway.
//!
//! The stream is lazy: the next event is produced only when the response body
//! is polled, so a disconnected client stops the sequence on the spot.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, warn};

use crate::AppState;

/// `GET /events` — SSE notification stream.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let limit = state.config.sse.max_connections;
    let previous = state.sse_connections.fetch_add(1, Ordering::Relaxed);
    if previous >= limit {
        state.sse_connections.fetch_sub(1, Ordering::Relaxed);
        warn!(limit, "SSE connection limit reached");
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many SSE connections"));
    }

    let sse = &state.config.sse;
    debug!(events = sse.event_count, interval = ?sse.interval(), "SSE stream opened");
    let events = notifications(sse.event_count, sse.interval())
        .map(|index| Ok(Event::default().event("notification").data(format!("Event {index}"))));

    let stream = DropCounterStream {
        inner: Box::pin(events),
        counter: Arc::clone(&state.sse_connections),
        decremented: false,
    };

    Ok(Sse::new(stream))
}

/// Yields `0..count`, sleeping `interval` before each item.
pub fn notifications(count: u32, interval: Duration) -> impl Stream<Item = u32> + Send {
    stream::unfold(0u32, move |index| async move {
        if index >= count {
            return None;
        }
        tokio::time::sleep(interval).await;
        Some((index, index + 1))
    })
}

/// Wrapper that releases one SSE slot when the stream finishes or is dropped,
/// whichever happens first.
struct DropCounterStream<S> {
    inner: Pin<Box<S>>,
    counter: Arc<AtomicU32>,
    decremented: bool,
}

impl<S> DropCounterStream<S> {
    fn release(&mut self) {
        if !self.decremented {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for DropCounterStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = &result {
            self.release();
        }
        result
    }
}

impl<S> Drop for DropCounterStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}
