//! Update orchestration: scheduling, queue dispatch, per-subscription
//! serialization and the periodic jobs around them.

pub mod dispatcher;
pub mod handler;
pub mod ingest;
pub mod report;
pub mod schedule;
pub mod scheduler;
pub mod serializer;
pub mod updater;

pub use dispatcher::{Dispatcher, PoolConfig, WorkHandler, WorkerPool};
pub use handler::UpdateWorkHandler;
pub use ingest::BuildIngestor;
pub use report::{longest_build_path, LongestBuildPathReporter};
pub use schedule::{frequency_schedules, run_timer, CronSchedule};
pub use scheduler::{FrequencyCheckPlan, FrequencyCheckSummary, RequestOutcome, UpdateScheduler};
pub use serializer::SubscriptionSerializer;
pub use updater::{DependencyUpdateAction, LogOnlyAction, SubscriptionUpdater, UpdateOutcome};
