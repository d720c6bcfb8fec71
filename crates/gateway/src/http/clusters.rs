use std::collections::HashMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use super::{AppState, authenticated_identity};
use crate::metrics;
use crate::watch;

const ROUTE_LIST: &str = "managedclusters";
const ROUTE_WATCH: &str = "managedclusters?watch";

/// One handler serves both the one-shot listing and the watch stream; the
/// presence of a `watch` query parameter selects the stream.
pub(super) async fn get_managed_clusters(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let watching = params.contains_key("watch");
    let route = if watching { ROUTE_WATCH } else { ROUTE_LIST };

    let identity = match authenticated_identity(&state, &headers).await {
        Ok(identity) => identity,
        Err(resp) => {
            metrics::observe_http_request(route, "GET", 401, started.elapsed());
            return resp;
        }
    };

    let filter = hubgate_authz::authorization_filter(&state.policy, &identity).await;
    tracing::debug!(user = %identity.user, filter = %filter, "compiled authorization filter");

    if watching {
        metrics::observe_http_request(route, "GET", 200, started.elapsed());
        return watch::stream_response(&state, filter);
    }

    match state.store.authorized_clusters(filter.condition()).await {
        Ok(payloads) => {
            metrics::observe_http_request(route, "GET", 200, started.elapsed());
            (StatusCode::OK, Json(payloads)).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "error in querying managed clusters");
            metrics::observe_http_request(route, "GET", 500, started.elapsed());
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
