//! SurrealDB-backed WorkQueue implementation
//!
//! Items live in the `work_items` table. A dequeue claims a lease with a
//! visibility timeout; commit deletes the record, rollback clears the lease.
//! `retry_later` clears the lease too but re-stamps `enqueued_at_us` and
//! pushes visibility out, so the item rejoins the tail after its delay.
//! A consumer that dies mid-item simply lets the lease expire, after which
//! the item is visible again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::UpdateWorkItem;
use crate::storage_traits::{EnqueueOutcome, QueueTransaction, StorageResult, WorkQueue};

/// Candidates fetched per dequeue attempt; others may race us for the head.
const CLAIM_CANDIDATES: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkItemRow {
    message_id: String,
    /// JSON-encoded `UpdateWorkItem`.
    payload: String,
    enqueued_at_us: i64,
    leased_until_ms: i64,
    #[serde(default)]
    lease_id: Option<String>,
    deliveries: i64,
}

#[derive(Debug, Deserialize)]
struct CandidateRow {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    n: i64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// SurrealDB-backed implementation of [`WorkQueue`].
#[derive(Clone)]
pub struct SurrealWorkQueue {
    db: Surreal<Any>,
    visibility_timeout: Duration,
}

impl SurrealWorkQueue {
    /// Wrap a connection whose schema has been initialized
    /// (see [`crate::connection`]).
    pub fn new(db: Surreal<Any>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }

    /// In-memory queue for tests.
    pub async fn in_memory(visibility_timeout: Duration) -> crate::Result<Self> {
        let db = crate::connection::connect_in_memory().await?;
        Ok(Self::new(db, visibility_timeout))
    }

    async fn count_where(&self, sql: &str, mid: Option<String>) -> StorageResult<i64> {
        let mut query = self.db.query(sql);
        if let Some(mid) = mid {
            query = query.bind(("mid", mid));
        }
        let mut res = query.await?;
        let rows: Vec<CountRow> = res.take(0)?;
        Ok(rows.first().map_or(0, |r| r.n))
    }

    async fn claim(&self, message_id: String) -> StorageResult<Option<WorkItemRow>> {
        let now = now_ms();
        let lease_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let mut res = self
            .db
            .query(
                "UPDATE work_items SET lease_id = $lease, leased_until_ms = $until, \
                 deliveries += 1 \
                 WHERE message_id = $mid AND leased_until_ms <= $now RETURN AFTER",
            )
            .bind(("lease", Uuid::new_v4().to_string()))
            .bind(("until", now.saturating_add(lease_ms)))
            .bind(("mid", message_id))
            .bind(("now", now))
            .await?;
        let rows: Vec<WorkItemRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl WorkQueue for SurrealWorkQueue {
    async fn enqueue(&self, item: UpdateWorkItem) -> StorageResult<EnqueueOutcome> {
        let message_id = item.message_id();
        let existing = self
            .count_where(
                "SELECT count() AS n FROM work_items WHERE message_id = $mid GROUP ALL",
                Some(message_id.clone()),
            )
            .await?;
        if existing > 0 {
            return Ok(EnqueueOutcome::Deduplicated);
        }

        let row = WorkItemRow {
            message_id: message_id.clone(),
            payload: serde_json::to_string(&item)?,
            enqueued_at_us: Utc::now().timestamp_micros(),
            leased_until_ms: 0,
            lease_id: None,
            deliveries: 0,
        };
        let created = self
            .db
            .query("CREATE work_items CONTENT $row")
            .bind(("row", row))
            .await
            .and_then(|res| res.check());

        match created {
            Ok(_) => {
                debug!(message_id = %message_id, kind = item.kind(), "work item persisted");
                Ok(EnqueueOutcome::Enqueued)
            }
            // Lost a race against a concurrent enqueue of the same item.
            Err(e) => {
                let existing = self
                    .count_where(
                        "SELECT count() AS n FROM work_items WHERE message_id = $mid GROUP ALL",
                        Some(message_id),
                    )
                    .await?;
                if existing > 0 {
                    Ok(EnqueueOutcome::Deduplicated)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn try_dequeue(&self) -> StorageResult<Option<Box<dyn QueueTransaction>>> {
        let mut res = self
            .db
            .query(
                "SELECT message_id, enqueued_at_us FROM work_items \
                 WHERE leased_until_ms <= $now ORDER BY enqueued_at_us ASC LIMIT $limit",
            )
            .bind(("now", now_ms()))
            .bind(("limit", CLAIM_CANDIDATES as i64))
            .await?;
        let candidates: Vec<CandidateRow> = res.take(0)?;

        for candidate in candidates {
            let Some(row) = self.claim(candidate.message_id).await? else {
                continue;
            };
            let item: UpdateWorkItem = serde_json::from_str(&row.payload)?;
            let lease_id = row.lease_id.clone().ok_or_else(|| {
                StorageError::InvalidState(format!("claimed {} without a lease", row.message_id))
            })?;
            return Ok(Some(Box::new(SurrealTransaction {
                db: self.db.clone(),
                message_id: row.message_id,
                lease_id,
                item,
                deliveries: u32::try_from(row.deliveries).unwrap_or(u32::MAX),
                open: true,
            })));
        }
        Ok(None)
    }

    async fn pending(&self) -> StorageResult<usize> {
        let n = self
            .count_where("SELECT count() AS n FROM work_items GROUP ALL", None)
            .await?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

struct SurrealTransaction {
    db: Surreal<Any>,
    message_id: String,
    lease_id: String,
    item: UpdateWorkItem,
    deliveries: u32,
    open: bool,
}

async fn release_lease(db: &Surreal<Any>, message_id: String, lease_id: String) -> StorageResult<()> {
    db.query(
        "UPDATE work_items SET leased_until_ms = 0, lease_id = NONE \
         WHERE message_id = $mid AND lease_id = $lease",
    )
    .bind(("mid", message_id))
    .bind(("lease", lease_id))
    .await?
    .check()?;
    Ok(())
}

#[async_trait]
impl QueueTransaction for SurrealTransaction {
    fn item(&self) -> &UpdateWorkItem {
        &self.item
    }

    fn delivery_count(&self) -> u32 {
        self.deliveries
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.open = false;
        let mut res = this
            .db
            .query("DELETE work_items WHERE message_id = $mid AND lease_id = $lease RETURN BEFORE")
            .bind(("mid", this.message_id.clone()))
            .bind(("lease", this.lease_id.clone()))
            .await?;
        let deleted: Vec<WorkItemRow> = res.take(0)?;
        if deleted.is_empty() {
            return Err(StorageError::Conflict(format!(
                "lease on {} expired before commit",
                this.message_id
            )));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.open = false;
        release_lease(&this.db, this.message_id.clone(), this.lease_id.clone()).await
    }

    async fn retry_later(self: Box<Self>, delay: Duration) -> StorageResult<()> {
        let mut this = self;
        this.open = false;
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        this.db
            .query(
                "UPDATE work_items SET leased_until_ms = $until, lease_id = NONE, \
                 enqueued_at_us = $requeued \
                 WHERE message_id = $mid AND lease_id = $lease",
            )
            .bind(("until", now_ms().saturating_add(delay_ms)))
            .bind(("requeued", Utc::now().timestamp_micros()))
            .bind(("mid", this.message_id.clone()))
            .bind(("lease", this.lease_id.clone()))
            .await?
            .check()?;
        debug!(message_id = %this.message_id, delay_ms, "work item deferred");
        Ok(())
    }
}

impl Drop for SurrealTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        // Without a runtime the lease simply expires.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let db = self.db.clone();
            let message_id = self.message_id.clone();
            let lease_id = self.lease_id.clone();
            handle.spawn(async move {
                if let Err(e) = release_lease(&db, message_id.clone(), lease_id).await {
                    warn!(message_id = %message_id, error = %e, "failed to release dropped lease");
                }
            });
        }
    }
}
