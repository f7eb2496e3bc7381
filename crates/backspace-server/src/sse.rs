//! Server-Sent Events endpoint for a job's progress stream

use crate::server::{parse_job_id, ApiError, SharedState};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use backspace_orchestrator::StreamItem;
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// First sequence number to deliver
    pub from: Option<u64>,
}

/// Resume point: `?from=N` wins, then `Last-Event-ID` + 1, then 0
fn start_offset(query: &EventsQuery, headers: &HeaderMap) -> u64 {
    query
        .from
        .or_else(|| {
            headers
                .get("last-event-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|id| id + 1)
        })
        .unwrap_or(0)
}

/// GET /jobs/:id/events - replay from an offset, then follow live
///
/// The SSE id of each event is its sequence number. The stream ends after
/// the job's last event.
pub async fn job_events(
    State(app): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let from = start_offset(&query, &headers);
    let mut subscription = app.service.subscribe(job_id, from)?;
    debug!(%job_id, from, "SSE subscriber joined");

    let stream = async_stream::stream! {
        while let Some(item) = subscription.next().await {
            match item {
                StreamItem::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        yield Ok(Event::default()
                            .id(event.seq.to_string())
                            .event(event.kind.name())
                            .data(json));
                    }
                    Err(e) => warn!("Failed to encode event {}: {}", event.seq, e),
                },
                StreamItem::ReplayUnavailable { requested, earliest } => {
                    let data = serde_json::json!({
                        "requested": requested,
                        "earliest": earliest,
                    });
                    yield Ok(Event::default()
                        .event("replay_unavailable")
                        .data(data.to_string()));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_start_offset_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(start_offset(&EventsQuery::default(), &headers), 0);

        headers.insert("last-event-id", HeaderValue::from_static("4"));
        assert_eq!(start_offset(&EventsQuery::default(), &headers), 5);

        let query = EventsQuery { from: Some(2) };
        assert_eq!(start_offset(&query, &headers), 2);

        headers.insert("last-event-id", HeaderValue::from_static("garbage"));
        assert_eq!(start_offset(&EventsQuery::default(), &headers), 0);
    }
}
