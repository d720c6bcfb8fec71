use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;

/// Attempt budget for the per-row compare-and-set on label updates.
pub const OPTIMISTIC_RETRY_ATTEMPTS: u32 = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Conflict,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Conflict => write!(f, "row version changed concurrently"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

#[derive(Clone)]
pub struct ClusterStore {
    pool: sqlx::PgPool,
    query_timeout: Duration,
}

struct LabelsRow {
    labels: BTreeMap<String, String>,
    deleted_keys: BTreeSet<String>,
    version: i64,
}

impl ClusterStore {
    pub async fn connect(db_url: &str, query_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            CONNECT_TIMEOUT,
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            query_timeout,
        })
    }

    /// Runs the composed SELECT and decodes each payload. Rows that fail to
    /// decode are logged and skipped; a query-level failure is reported
    /// upward.
    pub async fn authorized_clusters(&self, filter_condition: &str) -> Result<Vec<Value>, StoreError> {
        let query = format!(
            "SELECT payload FROM status.managed_clusters WHERE TRUE AND {filter_condition}"
        );

        let rows = tokio::time::timeout(self.query_timeout, sqlx::query(&query).fetch_all(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;

        let mut payloads = Vec::with_capacity(rows.len());
        for row in rows {
            match row.try_get::<Value, _>(0) {
                Ok(payload) => payloads.push(payload),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable cluster row");
                }
            }
        }

        Ok(payloads)
    }

    /// Authorization probe for label edits: counts the rows named `cluster`
    /// that the caller's filter also matches. The cluster name is bound,
    /// never interpolated.
    pub async fn count_authorized(
        &self,
        cluster: &str,
        filter_condition: &str,
    ) -> Result<i64, StoreError> {
        let query = format!(
            "SELECT COUNT(payload) FROM status.managed_clusters \
             WHERE payload -> 'metadata' ->> 'name' = $1 AND {filter_condition}"
        );

        let row = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(&query).bind(cluster).fetch_one(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Applies folded label edits to the cluster's row under per-row
    /// optimistic concurrency: read, merge, compare-and-set on the observed
    /// version, retrying up to [`OPTIMISTIC_RETRY_ATTEMPTS`] times. Empty
    /// edits are a no-op without a database round trip.
    pub async fn reconcile_labels(
        &self,
        cluster: &str,
        to_add: &BTreeMap<String, String>,
        to_remove: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(());
        }

        let mut last_error = StoreError::Conflict;

        for attempt in 1..=OPTIMISTIC_RETRY_ATTEMPTS {
            match self.try_reconcile(cluster, to_add, to_remove).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(error = %err, cluster, attempt, "label update attempt failed");
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    async fn try_reconcile(
        &self,
        cluster: &str,
        to_add: &BTreeMap<String, String>,
        to_remove: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        match self.current_labels(cluster).await? {
            None => self.insert_labels(cluster, to_add, to_remove).await,
            Some(current) => {
                let (labels, deleted_keys) =
                    merge_label_edits(current.labels, current.deleted_keys, to_add, to_remove);
                self.update_labels(cluster, &labels, &deleted_keys, current.version)
                    .await
            }
        }
    }

    async fn current_labels(&self, cluster: &str) -> Result<Option<LabelsRow>, StoreError> {
        let row = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT labels, deleted_label_keys, version FROM spec.managed_clusters_labels \
                 WHERE managed_cluster_name = $1",
            )
            .bind(cluster)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        let Json(labels) = row.try_get::<Json<BTreeMap<String, String>>, _>(0)?;
        let Json(deleted) = row.try_get::<Json<Vec<String>>, _>(1)?;
        let version = row.try_get::<i64, _>(2)?;

        Ok(Some(LabelsRow {
            labels,
            deleted_keys: deleted.into_iter().collect(),
            version,
        }))
    }

    async fn insert_labels(
        &self,
        cluster: &str,
        to_add: &BTreeMap<String, String>,
        to_remove: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let deleted_keys = to_remove.iter().cloned().collect::<Vec<_>>();

        tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "INSERT INTO spec.managed_clusters_labels \
                 (managed_cluster_name, labels, deleted_label_keys, version, updated_at) \
                 VALUES ($1, $2, $3, 0, now())",
            )
            .bind(cluster)
            .bind(Json(to_add))
            .bind(Json(&deleted_keys))
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(())
    }

    async fn update_labels(
        &self,
        cluster: &str,
        labels: &BTreeMap<String, String>,
        deleted_keys: &BTreeSet<String>,
        observed_version: i64,
    ) -> Result<(), StoreError> {
        let deleted_keys = deleted_keys.iter().cloned().collect::<Vec<_>>();

        let result = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "UPDATE spec.managed_clusters_labels SET \
                 labels = $1, \
                 deleted_label_keys = $2, \
                 version = version + 1, \
                 updated_at = now() \
                 WHERE managed_cluster_name = $3 AND version = $4",
            )
            .bind(Json(labels))
            .bind(Json(&deleted_keys))
            .bind(cluster)
            .bind(observed_version)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        Ok(())
    }
}

/// Merges the requested edits into the stored sets. A currently-removed key
/// that the new patch re-adds leaves the removal set; a currently-added key
/// that the new patch removes leaves the addition set; new additions
/// override stored values.
pub fn merge_label_edits(
    current_add: BTreeMap<String, String>,
    current_remove: BTreeSet<String>,
    to_add: &BTreeMap<String, String>,
    to_remove: &BTreeSet<String>,
) -> (BTreeMap<String, String>, BTreeSet<String>) {
    let mut labels = current_add
        .into_iter()
        .filter(|(key, _)| !to_remove.contains(key))
        .collect::<BTreeMap<_, _>>();
    labels.extend(to_add.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut deleted_keys = current_remove
        .into_iter()
        .filter(|key| !to_add.contains_key(key))
        .collect::<BTreeSet<_>>();
    deleted_keys.extend(to_remove.iter().cloned());

    (labels, deleted_keys)
}
