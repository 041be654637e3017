//! Depflow Core Library
//!
//! Dependency flow graph analysis and update orchestration on top of the
//! `flow-state` catalog and work queue.

pub mod build_times;
pub mod config;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod sync;
pub mod telemetry;

pub use build_times::{
    estimate_duration, AzureDevOpsRunSource, DurationEstimate, HistoricalBuildTimes, PipelineRun,
    PipelineRunSource,
};
pub use config::OrchestratorConfig;
pub use error::{ErrorClass, FlowError, FlowResult};

pub use flow::{
    CoherencyAnalyzer, CoherencyReport, FlowEdge, FlowGraph, FlowGraphBuilder, FlowNode,
    GraphOptions, ManifestDependency, ManifestReader, StaticManifests,
};

pub use orchestrator::{
    BuildIngestor, CronSchedule, DependencyUpdateAction, Dispatcher, FrequencyCheckSummary,
    LogOnlyAction, LongestBuildPathReporter, PoolConfig, RequestOutcome, SubscriptionSerializer,
    SubscriptionUpdater, UpdateOutcome, UpdateScheduler, UpdateWorkHandler, WorkHandler,
    WorkerPool,
};

pub use sync::{
    AsyncAutoResetEvent, AsyncManualResetEvent, ExpiringCache, IdempotentOperator,
    OperationContext,
};
pub use telemetry::init_tracing;
