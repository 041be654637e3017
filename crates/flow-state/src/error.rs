//! Error types for flow-state

use thiserror::Error;

use crate::model::{BuildId, ChannelId, SubscriptionId};

/// Errors raised while connecting to or preparing the database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the catalog, work queue and build-time traits.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("build not found: {0}")]
    BuildNotFound(BuildId),

    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// A write lost a race against another writer (e.g. an expired queue lease).
    #[error("conflicting write: {0}")]
    Conflict(String),

    /// A record exists but is not in a state that permits the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The backing store (database, lock, remote service) failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A remote dependency could not be reached; retrying may succeed.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether the failure is worth retrying by redelivering the work item.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Backend(_) | StorageError::Unavailable(_) | StorageError::Conflict(_)
        )
    }

    /// Whether the failure reports a missing record.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BuildNotFound(_)
                | StorageError::ChannelNotFound(_)
                | StorageError::SubscriptionNotFound(_)
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
