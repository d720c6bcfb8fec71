use std::time::Duration;

use http::HeaderMap;
use http::header;
use serde::Deserialize;

pub const UNKNOWN_USER: &str = "Unknown";

const IDENTITY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The authenticated caller. Immutable for the request lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Resolves bearer tokens to an [`Identity`] by forwarding the caller's
/// `Authorization` header to the cluster API's self-review endpoint.
#[derive(Clone)]
pub struct Authenticator {
    cluster_api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct UserObject {
    #[serde(default)]
    metadata: UserObjectMeta,
    #[serde(default)]
    groups: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct UserObjectMeta {
    #[serde(default)]
    name: Option<String>,
}

impl Authenticator {
    /// With a CA bundle the client trusts exactly those roots and requires
    /// TLS 1.2+; without one, certificate verification is skipped (the
    /// insecure default the deployment may override).
    pub fn new(cluster_api_url: String, ca_bundle: Option<&[u8]>) -> Result<Self, AuthError> {
        let mut builder = reqwest::Client::builder().timeout(IDENTITY_REQUEST_TIMEOUT);

        builder = match ca_bundle {
            Some(pem) => {
                let certificates =
                    reqwest::Certificate::from_pem_bundle(pem).map_err(|_| AuthError {
                        code: "ERR_INVALID_CONFIG",
                        message: "cluster API CA bundle is not valid PEM".to_string(),
                    })?;
                let mut builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_2);
                for certificate in certificates {
                    builder = builder.add_root_certificate(certificate);
                }
                builder
            }
            None => builder.danger_accept_invalid_certs(true),
        };

        let http = builder.build().map_err(|_| AuthError {
            code: "ERR_INTERNAL",
            message: "failed to initialize identity http client".to_string(),
        })?;

        Ok(Self {
            cluster_api_url,
            http,
        })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AuthError {
                code: "ERR_AUTH_REQUIRED",
                message: "missing Authorization header".to_string(),
            })?;

        let url = format!(
            "{}/apis/user.openshift.io/v1/users/~",
            self.cluster_api_url.trim_end_matches('/')
        );

        let resp = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "failed to reach the identity endpoint".to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(AuthError {
                code: "ERR_AUTH_INVALID",
                message: "identity endpoint rejected the token".to_string(),
            });
        }

        let user = resp.json::<UserObject>().await.map_err(|_| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "identity endpoint returned an undecodable user object".to_string(),
        })?;

        Ok(identity_from_user(user))
    }
}

fn identity_from_user(user: UserObject) -> Identity {
    let name = match user.metadata.name {
        Some(name) if !name.is_empty() => name,
        _ => {
            tracing::warn!("user object has no name, defaulting to {}", UNKNOWN_USER);
            UNKNOWN_USER.to_string()
        }
    };

    let groups = match user.groups {
        Some(groups) => groups,
        None => {
            tracing::warn!(user = %name, "user object has no groups, defaulting to empty");
            Vec::new()
        }
    };

    Identity { user: name, groups }
}
