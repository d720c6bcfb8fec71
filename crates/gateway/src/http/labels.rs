use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hubgate_contracts::PatchOperation;

use super::{AppState, authenticated_identity, status_json};
use crate::metrics;

const ROUTE: &str = "managedclusters/patch";

const LABELS_PATH_PREFIX: &str = "/metadata/labels/";

const ONLY_LABELS_PATCH: &str = "only patch of labels is currently implemented";
const ONLY_ADD_OR_REMOVE: &str = "only add or remove operations are currently implemented";
const CANNOT_PATCH_CLUSTER: &str = "the current user cannot patch the cluster";

#[derive(Debug, PartialEq, Eq)]
enum UnsupportedPatch {
    NotLabels,
    NotAddOrRemove,
}

impl UnsupportedPatch {
    fn message(&self) -> &'static str {
        match self {
            UnsupportedPatch::NotLabels => ONLY_LABELS_PATCH,
            UnsupportedPatch::NotAddOrRemove => ONLY_ADD_OR_REMOVE,
        }
    }
}

pub(super) async fn patch_managed_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
    body: Result<Json<Vec<PatchOperation>>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    let identity = match authenticated_identity(&state, &headers).await {
        Ok(identity) => identity,
        Err(resp) => {
            metrics::observe_http_request(ROUTE, "PATCH", 401, started.elapsed());
            return resp;
        }
    };

    tracing::debug!(user = %identity.user, %cluster, "patch for cluster");

    let filter = hubgate_authz::authorization_filter(&state.policy, &identity).await;
    let authorized = match state
        .store
        .count_authorized(&cluster, filter.condition())
        .await
    {
        Ok(count) => count > 0,
        Err(err) => {
            tracing::warn!(error = %err, %cluster, "error in querying managed clusters");
            false
        }
    };
    if !authorized {
        metrics::observe_http_request(ROUTE, "PATCH", 403, started.elapsed());
        return status_json(StatusCode::FORBIDDEN, CANNOT_PATCH_CLUSTER);
    }

    let Json(operations) = match body {
        Ok(json) => json,
        Err(err) => {
            tracing::info!(error = %err, "failed to bind patch body");
            metrics::observe_http_request(ROUTE, "PATCH", 400, started.elapsed());
            return status_json(StatusCode::BAD_REQUEST, "invalid JSON patch body");
        }
    };

    let (to_add, to_remove) = match fold_operations(&operations) {
        Ok(sets) => sets,
        Err(unsupported) => {
            metrics::observe_http_request(ROUTE, "PATCH", 501, started.elapsed());
            return status_json(StatusCode::NOT_IMPLEMENTED, unsupported.message());
        }
    };

    tracing::debug!(%cluster, ?to_add, ?to_remove, "reconciling cluster labels");

    match state
        .store
        .reconcile_labels(&cluster, &to_add, &to_remove)
        .await
    {
        Ok(()) => {
            metrics::observe_http_request(ROUTE, "PATCH", 200, started.elapsed());
            StatusCode::OK.into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, %cluster, "error in updating managed cluster labels");
            metrics::inc_label_update_failure();
            metrics::observe_http_request(ROUTE, "PATCH", 500, started.elapsed());
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Folds the patch operations, applied in order, into one addition map and
/// one removal set: a later `add` cancels an earlier `remove` of the same
/// key, and vice versa. The label key is the path after the labels prefix
/// with the first `~` standing in for `/`.
fn fold_operations(
    operations: &[PatchOperation],
) -> Result<(BTreeMap<String, String>, BTreeSet<String>), UnsupportedPatch> {
    let mut to_add = BTreeMap::new();
    let mut to_remove = BTreeSet::new();

    for operation in operations {
        let Some(raw_key) = operation.path.strip_prefix(LABELS_PATH_PREFIX) else {
            return Err(UnsupportedPatch::NotLabels);
        };
        let key = raw_key.replacen('~', "/", 1);

        match operation.op.as_str() {
            "add" => {
                to_remove.remove(&key);
                to_add.insert(key, operation.value.clone());
            }
            "remove" => {
                to_add.remove(&key);
                to_remove.insert(key);
            }
            _ => return Err(UnsupportedPatch::NotAddOrRemove),
        }
    }

    Ok((to_add, to_remove))
}
