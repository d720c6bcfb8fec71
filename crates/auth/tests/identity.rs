use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use hubgate_auth::{Authenticator, UNKNOWN_USER};

async fn spawn_identity_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub listener should bind");
    let addr = listener.local_addr().expect("stub addr should resolve");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stub serve");
    });
    format!("http://{addr}")
}

fn bearer_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().expect("header must parse"),
    );
    headers
}

#[tokio::test]
async fn authenticate_extracts_user_and_groups_from_review_response() {
    let router = Router::new().route(
        "/apis/user.openshift.io/v1/users/~",
        get(|headers: HeaderMap| async move {
            assert_eq!(
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok()),
                Some("Bearer tok-1"),
            );
            axum::Json(serde_json::json!({
                "kind": "User",
                "apiVersion": "user.openshift.io/v1",
                "metadata": { "name": "alice" },
                "groups": ["dev", "ops"],
            }))
        }),
    );
    let base_url = spawn_identity_stub(router).await;

    let auth = Authenticator::new(base_url, None).expect("authenticator should build");
    let identity = auth
        .authenticate(&bearer_headers("tok-1"))
        .await
        .expect("authenticate should succeed");

    assert_eq!(identity.user, "alice");
    assert_eq!(identity.groups, vec!["dev".to_string(), "ops".to_string()]);
}

#[tokio::test]
async fn authenticate_defaults_missing_fields_instead_of_rejecting() {
    let router = Router::new().route(
        "/apis/user.openshift.io/v1/users/~",
        get(|| async { axum::Json(serde_json::json!({"kind": "User"})) }),
    );
    let base_url = spawn_identity_stub(router).await;

    let auth = Authenticator::new(base_url, None).expect("authenticator should build");
    let identity = auth
        .authenticate(&bearer_headers("tok-2"))
        .await
        .expect("authenticate should succeed");

    assert_eq!(identity.user, UNKNOWN_USER);
    assert!(identity.groups.is_empty());
}

#[tokio::test]
async fn authenticate_fails_when_review_is_rejected() {
    let router = Router::new().route(
        "/apis/user.openshift.io/v1/users/~",
        get(|| async { StatusCode::UNAUTHORIZED }),
    );
    let base_url = spawn_identity_stub(router).await;

    let auth = Authenticator::new(base_url, None).expect("authenticator should build");
    let err = auth
        .authenticate(&bearer_headers("expired"))
        .await
        .unwrap_err();
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}
