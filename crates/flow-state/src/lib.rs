//! Flow-State: catalog model and durable work queue for depflow
//!
//! This crate owns the records the orchestrator reads and writes, the
//! storage traits it talks through, and the persistence behind them.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: monotonic subscription state, idempotent build annotations and
//! at-least-once work delivery.
//!
//! ## Key Components
//!
//! - `Catalog`: subscriptions, builds, channels and default channels
//! - `WorkQueue` / `QueueTransaction`: transactional dequeue with redelivery
//! - `SurrealWorkQueue`: the durable queue, leased rows in SurrealDB
//! - `fakes`: in-memory implementations of every trait

pub mod connection;
mod error;
pub mod fakes;
pub mod migrations;
pub mod model;
pub mod storage_traits;
pub mod surreal_queue;

pub use connection::{AuthScope, CloudConfig};
pub use error::{StateError, StorageError};
pub use model::{
    repo_branch_key, Asset, Build, BuildChannel, BuildId, BuildIncoherence, BuildRef, BuildTime,
    Channel, ChannelId, DefaultChannel, LongestBuildPath, NewBuild, PipelineDefinitions,
    RepoAddress, Subscription, SubscriptionId, SubscriptionPolicy, UpdateFrequency,
    UpdateWorkItem,
};
pub use storage_traits::{
    BuildTimeProvider, Catalog, EnqueueOutcome, QueueTransaction, StorageResult, WorkQueue,
};
pub use surreal_queue::SurrealWorkQueue;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
