//! SurrealDB schema migrations and initialization

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Initialize all depflow tables. Safe to call multiple times.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    init_work_items_table(db).await?;
    info!("depflow schema initialization complete");
    Ok(())
}

/// Initialize `work_items` table
///
/// Schema:
/// ```text
/// TABLE work_items {
///   id:               RECORD (generated)
///   message_id:       STRING (unique)
///   payload:          STRING (JSON UpdateWorkItem)
///   enqueued_at_us:   INT (microseconds, delivery order)
///   leased_until_ms:  INT (0 = visible)
///   lease_id:         STRING?
///   deliveries:       INT
/// }
/// ```
///
/// An item is visible when `leased_until_ms` is in the past. Commit deletes
/// the record; rollback resets the lease.
async fn init_work_items_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing work_items table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS work_items SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_message_id ON TABLE work_items COLUMNS message_id UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_visibility ON TABLE work_items COLUMNS leased_until_ms, enqueued_at_us;
    "#;

    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("work_items table initialized");
    Ok(())
}
