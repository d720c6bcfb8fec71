pub mod client;
pub mod sql;

pub use client::{PolicyClient, PolicyError, Residual};
pub use sql::{CompileError, Filter, compile};

use hubgate_auth::Identity;

/// Resolves the caller's authorization into a SQL filter. Policy-service
/// failures never surface to callers; they collapse to a filter that
/// matches nothing.
pub async fn authorization_filter(client: &PolicyClient, identity: &Identity) -> Filter {
    match client.partial_evaluate(identity).await {
        Ok(residual) => sql::compile(residual.queries.as_deref()),
        Err(err) => {
            tracing::warn!(error = %err, "unable to get partial evaluation, denying all");
            Filter::deny_all()
        }
    }
}
