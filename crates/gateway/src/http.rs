use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use hubgate_auth::{Authenticator, Identity};
use hubgate_authz::PolicyClient;
use hubgate_store::ClusterStore;
use tokio::sync::watch;

use crate::config::{self, Config, StartupError};
use crate::metrics;

mod clusters;
mod labels;

const DB_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub store: ClusterStore,
    pub policy: PolicyClient,
    pub authenticator: Authenticator,
    pub shutdown: watch::Receiver<bool>,
}

/// Builds the service router. The cluster routes live under the configured
/// base path and require a bearer token; `/healthz` and `/metrics` stay at
/// the root, unauthenticated.
pub async fn router(
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<Router, StartupError> {
    let cluster_api_ca = config::read_ca_bundle(config.cluster_api_ca_bundle_path.as_deref())?;
    let authorization_ca = config::read_ca_bundle(config.authorization_ca_bundle_path.as_deref())?;
    let client_identity = if authorization_ca.is_some() {
        Some(config::read_client_identity(
            &config.certificate_path,
            &config.key_path,
        )?)
    } else {
        None
    };

    let authenticator = Authenticator::new(config.cluster_api_url.clone(), cluster_api_ca.as_deref())
        .map_err(|_| StartupError {
            code: "ERR_AUTH_UNAVAILABLE",
            message: "failed to initialize identity client".to_string(),
        })?;

    let policy = PolicyClient::new(
        config.authorization_url.clone(),
        authorization_ca.as_deref(),
        client_identity.as_deref(),
    )
    .map_err(|_| StartupError {
        code: "ERR_POLICY_UNAVAILABLE",
        message: "failed to initialize policy client".to_string(),
    })?;

    let store = ClusterStore::connect(&config.database_url, DB_QUERY_TIMEOUT)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to connect to the database".to_string(),
        })?;

    let state = AppState {
        store,
        policy,
        authenticator,
        shutdown,
    };

    let api = Router::new()
        .route("/managedclusters", get(clusters::get_managed_clusters))
        .route(
            "/managedclusters/{cluster}",
            patch(labels::patch_managed_cluster),
        )
        .with_state(state);

    let api = if config.base_path.is_empty() {
        api
    } else {
        Router::new().nest(&config.base_path, api)
    };

    Ok(api
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics)))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics() -> Response {
    match metrics::render() {
        Ok((body, content_type)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Resolves the caller's bearer token; failures answer 401 with a
/// `WWW-Authenticate` header.
pub(crate) async fn authenticated_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, Response> {
    match state.authenticator.authenticate(headers).await {
        Ok(identity) => {
            tracing::debug!(user = %identity.user, groups = ?identity.groups, "got authenticated user");
            Ok(identity)
        }
        Err(err) => {
            tracing::info!(error = %err, "rejecting unauthenticated request");
            Err((
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "")],
            )
                .into_response())
        }
    }
}

pub(crate) fn status_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "status": message }))).into_response()
}
