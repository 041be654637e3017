//! Routes dequeued work items to the scheduler and updater.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flow_state::UpdateWorkItem;
use tracing::{error, info, warn};

use super::dispatcher::WorkHandler;
use super::scheduler::{RequestOutcome, UpdateScheduler};
use super::serializer::SubscriptionSerializer;
use super::updater::SubscriptionUpdater;
use crate::error::{ErrorClass, FlowError};
use crate::sync::IdempotentOperator;

pub struct UpdateWorkHandler {
    scheduler: Arc<UpdateScheduler>,
    updater: Arc<SubscriptionUpdater>,
    serializer: Arc<SubscriptionSerializer>,
    /// Build events already expanded, keyed by message id.
    expansions: IdempotentOperator<String, usize>,
}

impl UpdateWorkHandler {
    pub fn new(
        scheduler: Arc<UpdateScheduler>,
        updater: Arc<SubscriptionUpdater>,
        serializer: Arc<SubscriptionSerializer>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            scheduler,
            updater,
            serializer,
            expansions: IdempotentOperator::new(cache_ttl),
        }
    }
}

fn log_failure(item: &UpdateWorkItem, err: &FlowError) -> ErrorClass {
    let class = err.class();
    match class {
        ErrorClass::Cancelled => {}
        ErrorClass::Invariant => {
            error!(kind = item.kind(), item = ?item, error = %err, "work item references missing data")
        }
        ErrorClass::Business | ErrorClass::Transient => {
            warn!(kind = item.kind(), item = ?item, error = %err, "work item failed")
        }
    }
    class
}

#[async_trait]
impl WorkHandler for UpdateWorkHandler {
    async fn handle(&self, item: &UpdateWorkItem) -> Result<(), ErrorClass> {
        match *item {
            UpdateWorkItem::BuildAdded {
                build_id,
                channel_id,
            } => {
                let scheduler = &self.scheduler;
                self.expansions
                    .execute(item.message_id(), |_| async move {
                        scheduler.on_build_added(build_id, channel_id).await
                    })
                    .await
                    .map(|_| ())
                    .map_err(|e| log_failure(item, &e))
            }
            UpdateWorkItem::SubscriptionUpdate {
                subscription_id,
                build_id,
            } => {
                let updater = &self.updater;
                self.serializer
                    .execute(subscription_id, build_id, || {
                        updater.update(subscription_id, build_id)
                    })
                    .await
                    .map(|_| ())
            }
            UpdateWorkItem::TriggerSubscription {
                subscription_id,
                build_id,
            } => {
                let outcome = match build_id {
                    Some(build_id) => self.scheduler.request_update(subscription_id, build_id).await,
                    None => self.scheduler.request_update_latest(subscription_id).await,
                };
                match outcome {
                    Ok(RequestOutcome::Enqueued(build)) => {
                        info!(subscription_id = %subscription_id, build_id = %build, "manual update queued");
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(log_failure(item, &e)),
                }
            }
        }
    }
}
