//! Long-lived watch sessions: a periodic re-query of the authorized rows,
//! diffed against the previously reported names, streamed as
//! newline-delimited events over a chunked response.

use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use hubgate_authz::Filter;
use hubgate_contracts::{WatchEvent, cluster_name};
use hubgate_store::ClusterStore;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::http::AppState;
use crate::metrics;

pub(crate) const SYNC_INTERVAL: Duration = Duration::from_secs(4);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Opens the streamed response and spawns the per-session driver task.
/// Chunked transfer encoding is applied by the HTTP layer for the unsized
/// body.
pub(crate) fn stream_response(state: &AppState, filter: Filter) -> Response {
    let (tx, rx) = mpsc::channel::<Result<String, Infallible>>(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(run_session(
        state.store.clone(),
        filter,
        tx,
        state.shutdown.clone(),
    ));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Drives one session until the client disconnects (the body channel
/// closes) or the process shuts down. Both the interval and the session
/// state are dropped on every exit path.
async fn run_session(
    store: ClusterStore,
    filter: Filter,
    tx: mpsc::Sender<Result<String, Infallible>>,
    mut shutdown: watch::Receiver<bool>,
) {
    metrics::inc_watch_sessions();

    // The first tick fires after one full interval, not immediately.
    let start = tokio::time::Instant::now() + SYNC_INTERVAL;
    let mut interval = tokio::time::interval_at(start, SYNC_INTERVAL);
    let mut previous = HashSet::new();

    loop {
        tokio::select! {
            _ = tx.closed() => break,
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if tick(&store, &filter, &tx, &mut previous).await.is_err() {
                    break;
                }
            }
        }
    }

    metrics::dec_watch_sessions();
}

struct SessionClosed;

async fn tick(
    store: &ClusterStore,
    filter: &Filter,
    tx: &mpsc::Sender<Result<String, Infallible>>,
    previous: &mut HashSet<String>,
) -> Result<(), SessionClosed> {
    let payloads = tokio::select! {
        result = store.authorized_clusters(filter.condition()) => match result {
            Ok(payloads) => payloads,
            Err(err) => {
                // A failed tick keeps the session alive; the next tick
                // retries.
                tracing::warn!(error = %err, "error in querying managed clusters");
                return Ok(());
            }
        },
        _ = tx.closed() => return Err(SessionClosed),
    };

    let (events, current) = diff_tick(previous, payloads);
    for event in &events {
        send_event(tx, event).await?;
    }
    *previous = current;

    Ok(())
}

/// Diffs one snapshot against the previously reported names: ADDED for
/// newly seen clusters, DELETED (with a name-only stub) for names that
/// disappeared. Returns the events in emission order and the new session
/// state, which is exactly the set of names seen by this snapshot.
fn diff_tick(previous: &HashSet<String>, payloads: Vec<Value>) -> (Vec<WatchEvent>, HashSet<String>) {
    let mut current = HashSet::with_capacity(payloads.len());
    let mut events = Vec::new();

    for payload in payloads {
        let Some(name) = cluster_name(&payload).map(str::to_string) else {
            tracing::warn!("cluster payload has no metadata.name, skipping");
            continue;
        };

        let newly_seen = !previous.contains(&name);
        let first_in_snapshot = current.insert(name);
        if newly_seen && first_in_snapshot {
            events.push(WatchEvent::added(payload));
        }
    }

    for name in previous {
        if !current.contains(name) {
            events.push(WatchEvent::deleted(name));
        }
    }

    (events, current)
}

async fn send_event(
    tx: &mpsc::Sender<Result<String, Infallible>>,
    event: &WatchEvent,
) -> Result<(), SessionClosed> {
    let mut line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(err) => {
            tracing::warn!(error = %err, "error in serializing watch event");
            return Ok(());
        }
    };
    line.push('\n');

    metrics::observe_watch_event(event.event_type.as_str());
    tx.send(Ok(line)).await.map_err(|_| SessionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubgate_contracts::WatchEventType;
    use serde_json::json;

    fn payload(name: &str) -> Value {
        json!({"metadata": {"name": name}})
    }

    fn names(set: &HashSet<String>) -> Vec<&str> {
        let mut names = set.iter().map(String::as_str).collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn first_snapshot_emits_added_for_every_row() {
        let previous = HashSet::new();
        let (events, current) = diff_tick(&previous, vec![payload("a"), payload("b")]);

        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.event_type == WatchEventType::Added));
        assert_eq!(names(&current), vec!["a", "b"]);
    }

    #[test]
    fn unchanged_rows_are_not_re_added() {
        let previous = HashSet::from(["a".to_string()]);
        let (events, current) = diff_tick(&previous, vec![payload("a"), payload("b")]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, WatchEventType::Added);
        assert_eq!(cluster_name(&events[0].object), Some("b"));
        assert_eq!(names(&current), vec!["a", "b"]);
    }

    #[test]
    fn disappeared_rows_emit_deleted_stubs() {
        let previous = HashSet::from(["a".to_string(), "b".to_string()]);
        let (events, current) = diff_tick(&previous, vec![payload("b")]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, WatchEventType::Deleted);
        assert_eq!(cluster_name(&events[0].object), Some("a"));
        assert_eq!(names(&current), vec!["b"]);
    }

    #[test]
    fn session_state_tracks_the_latest_snapshot_exactly() {
        let previous = HashSet::from(["a".to_string()]);
        let (_, current) = diff_tick(&previous, vec![payload("b"), payload("c")]);
        assert_eq!(names(&current), vec!["b", "c"]);
    }

    #[test]
    fn rows_without_a_name_are_skipped() {
        let previous = HashSet::new();
        let (events, current) = diff_tick(&previous, vec![json!({"metadata": {}}), payload("a")]);

        assert_eq!(events.len(), 1);
        assert_eq!(names(&current), vec!["a"]);
    }

    #[test]
    fn duplicate_names_in_one_snapshot_emit_one_added() {
        let previous = HashSet::new();
        let (events, current) = diff_tick(&previous, vec![payload("a"), payload("a")]);

        assert_eq!(events.len(), 1);
        assert_eq!(names(&current), vec!["a"]);
    }

    #[test]
    fn added_events_precede_deleted_events() {
        let previous = HashSet::from(["old".to_string()]);
        let (events, _) = diff_tick(&previous, vec![payload("new")]);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, WatchEventType::Added);
        assert_eq!(events[1].event_type, WatchEventType::Deleted);
    }
}
