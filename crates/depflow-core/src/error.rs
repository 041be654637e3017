//! Error types for flow-graph analysis and update orchestration.

use flow_state::{BuildId, ChannelId, StorageError, SubscriptionId};
use thiserror::Error;

/// How the worker pool should treat a failed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Infrastructure hiccup; redeliver the item.
    Transient,
    /// One entity failed; log it and move on.
    Business,
    /// Broken reference or programmer error; log and abandon, never retry blindly.
    Invariant,
    /// Shutdown in progress; not a failure.
    Cancelled,
}

/// Errors produced by the depflow core.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Non-tooling edges form a cycle; lists the nodes that could not be ordered.
    #[error("dependency cycle detected involving nodes: {nodes:?}")]
    DependencyCycle { nodes: Vec<String> },

    #[error("node not found in flow graph: {node}")]
    NodeNotFound { node: String },

    #[error("build {build_id} is not on channel {channel_id}")]
    BuildNotOnChannel {
        build_id: BuildId,
        channel_id: ChannelId,
    },

    #[error("build {build_id} was produced by {repository}, not the subscription's source")]
    BuildFromOtherRepository {
        build_id: BuildId,
        repository: String,
    },

    #[error("no build available for subscription {subscription_id}")]
    NoBuildAvailable { subscription_id: SubscriptionId },

    #[error("update of subscription {subscription_id} to build {build_id} failed: {reason}")]
    UpdateFailed {
        subscription_id: SubscriptionId,
        build_id: BuildId,
        reason: String,
        /// Whether a later redelivery could succeed.
        retryable: bool,
    },

    /// Reading a dependency manifest from source control failed.
    #[error("manifest read failed for {repository}@{commit}: {reason}")]
    Manifest {
        repository: String,
        commit: String,
        reason: String,
    },

    /// The build-history service failed or returned garbage.
    #[error("build history query failed: {0}")]
    BuildHistory(String),

    /// The build was stored but assigning or announcing it failed; retry
    /// with `BuildIngestor::publish_build`.
    #[error("build {build_id} was stored but not published: {source}")]
    BuildNotPublished {
        build_id: BuildId,
        #[source]
        source: Box<FlowError>,
    },

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FlowError {
    /// Map the error onto the worker pool's handling taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            FlowError::Cancelled => ErrorClass::Cancelled,
            FlowError::BuildNotPublished { source, .. } => source.class(),
            FlowError::Storage(e) if e.is_transient() => ErrorClass::Transient,
            FlowError::Storage(e) if e.is_not_found() => ErrorClass::Invariant,
            FlowError::Storage(StorageError::Serialization(_)) => ErrorClass::Invariant,
            FlowError::Storage(_) => ErrorClass::Business,
            FlowError::UpdateFailed { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Business
                }
            }
            FlowError::Manifest { .. } | FlowError::BuildHistory(_) => ErrorClass::Transient,
            FlowError::DependencyCycle { .. }
            | FlowError::NodeNotFound { .. }
            | FlowError::InvalidSchedule { .. }
            | FlowError::Config(_) => ErrorClass::Invariant,
            FlowError::BuildNotOnChannel { .. }
            | FlowError::BuildFromOtherRepository { .. }
            | FlowError::NoBuildAvailable { .. } => ErrorClass::Business,
        }
    }
}

/// Convenience result alias.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_nodes() {
        let err = FlowError::DependencyCycle {
            nodes: vec!["org/a@main".into(), "org/b@main".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("org/a@main"));
        assert!(msg.contains("org/b@main"));
    }

    #[test]
    fn storage_errors_split_by_cause() {
        let missing: FlowError = StorageError::BuildNotFound(BuildId(9)).into();
        assert_eq!(missing.class(), ErrorClass::Invariant);

        let backend: FlowError = StorageError::Backend("connection reset".into()).into();
        assert_eq!(backend.class(), ErrorClass::Transient);

        let state: FlowError = StorageError::InvalidState("locked".into()).into();
        assert_eq!(state.class(), ErrorClass::Business);
    }

    #[test]
    fn update_failures_honour_retryable_flag() {
        let sub = SubscriptionId::new();
        let retry = FlowError::UpdateFailed {
            subscription_id: sub,
            build_id: BuildId(1),
            reason: "rate limited".into(),
            retryable: true,
        };
        let fatal = FlowError::UpdateFailed {
            subscription_id: sub,
            build_id: BuildId(1),
            reason: "branch protected".into(),
            retryable: false,
        };
        assert_eq!(retry.class(), ErrorClass::Transient);
        assert_eq!(fatal.class(), ErrorClass::Business);
        assert_eq!(FlowError::Cancelled.class(), ErrorClass::Cancelled);
    }
}
