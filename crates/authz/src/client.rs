use std::time::Duration;

use hubgate_auth::Identity;
use serde::Deserialize;
use serde_json::Value;

/// The decision the policy service partially evaluates over the unknown
/// cluster record.
pub const COMPILE_QUERY: &str = "data.rbac.clusters.allow == true";

const COMPILE_UNKNOWNS: [&str; 1] = ["input.cluster"];
const COMPILE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum PolicyError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::Timeout => write!(f, "policy compile request timed out"),
            PolicyError::Http(err) => write!(f, "policy service HTTP error: {}", err),
            PolicyError::BadStatus(status) => write!(f, "policy service returned status {}", status),
            PolicyError::InvalidResponse => write!(f, "policy service returned invalid JSON"),
        }
    }
}

impl std::error::Error for PolicyError {}

impl From<reqwest::Error> for PolicyError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            PolicyError::Timeout
        } else {
            PolicyError::Http(value)
        }
    }
}

/// The residual query left after partial evaluation: a disjunction of
/// conjunctions of term expressions over the unknown cluster record. Kept
/// as raw JSON; the compiler narrows each node with checked dispatch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Residual {
    #[serde(default)]
    pub queries: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct CompileResponse {
    #[serde(default)]
    result: Option<Residual>,
}

#[derive(Clone)]
pub struct PolicyClient {
    base_url: String,
    http: reqwest::Client,
}

impl PolicyClient {
    /// With a CA bundle the client trusts exactly those roots, requires
    /// TLS 1.2+, and presents `client_identity` (service certificate plus
    /// key, PEM) to the policy service. Without a bundle, certificate
    /// verification is skipped (the insecure default the deployment may
    /// override).
    pub fn new(
        base_url: String,
        ca_bundle: Option<&[u8]>,
        client_identity: Option<&[u8]>,
    ) -> Result<Self, PolicyError> {
        let mut builder = reqwest::Client::builder().timeout(COMPILE_REQUEST_TIMEOUT);

        builder = match ca_bundle {
            Some(pem) => {
                let mut builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_2);
                for certificate in reqwest::Certificate::from_pem_bundle(pem)? {
                    builder = builder.add_root_certificate(certificate);
                }
                if let Some(identity_pem) = client_identity {
                    builder = builder.identity(reqwest::Identity::from_pem(identity_pem)?);
                }
                builder
            }
            None => builder.danger_accept_invalid_certs(true),
        };

        let http = builder.build().map_err(PolicyError::Http)?;

        Ok(Self { base_url, http })
    }

    /// Posts a partial compile request for the given identity and returns
    /// the residual queries. Groups are carried on the identity but are not
    /// part of the compile contract yet.
    pub async fn partial_evaluate(&self, identity: &Identity) -> Result<Residual, PolicyError> {
        let body = serde_json::json!({
            "input": { "user": identity.user },
            "query": COMPILE_QUERY,
            "unknowns": COMPILE_UNKNOWNS,
        });

        let resp = self.http.post(self.compile_url()).json(&body).send().await?;

        if !resp.status().is_success() {
            return Err(PolicyError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<CompileResponse>()
            .await
            .map_err(|_| PolicyError::InvalidResponse)?;

        Ok(decoded.result.unwrap_or_default())
    }

    fn compile_url(&self) -> String {
        format!("{}/v1/compile", self.base_url.trim_end_matches('/'))
    }
}
