//! Decides which subscriptions need an update.
//!
//! Three entry points feed the queue:
//! - build events: `EveryBuild` subscriptions on the build's channel
//! - frequency checks: each subscription's latest channel build, if newer
//! - manual requests: one subscription, explicit or latest build
//!
//! Candidates are evaluated independently; one failing lookup is logged and
//! the rest of the batch continues.

use std::sync::Arc;

use flow_state::{
    Build, BuildId, Catalog, ChannelId, EnqueueOutcome, Subscription, SubscriptionId,
    UpdateFrequency, UpdateWorkItem,
};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use crate::error::{FlowError, FlowResult};
use crate::obs;
use crate::sync::bounded_unordered;

/// Result of one frequency check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrequencyCheckSummary {
    pub candidates: usize,
    pub enqueued: usize,
    /// Pending already, or no newer build.
    pub unchanged: usize,
    pub failed: usize,
}

/// Work a frequency check would produce, without enqueueing it.
#[derive(Debug, Clone, Default)]
pub struct FrequencyCheckPlan {
    pub candidates: usize,
    pub items: Vec<UpdateWorkItem>,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Enqueued(BuildId),
    /// An identical update is already waiting in the queue.
    AlreadyPending(BuildId),
    /// The build is not newer than the last applied one.
    UpToDate(BuildId),
}

pub struct UpdateScheduler {
    catalog: Arc<dyn Catalog>,
    dispatcher: Dispatcher,
    max_parallelism: usize,
}

impl UpdateScheduler {
    pub fn new(catalog: Arc<dyn Catalog>, dispatcher: Dispatcher, max_parallelism: usize) -> Self {
        Self {
            catalog,
            dispatcher,
            max_parallelism,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Enqueue the new build for every enabled `EveryBuild` subscription on
    /// `channel_id` whose source is the build's repository. Returns how many
    /// items were enqueued.
    pub async fn on_build_added(&self, build_id: BuildId, channel_id: ChannelId) -> FlowResult<usize> {
        let build = self.catalog.get_build(build_id).await?;
        let subscriptions = self
            .catalog
            .enabled_subscriptions_on_channel(channel_id)
            .await?;

        let mut enqueued = 0;
        for sub in subscriptions.iter().filter(|s| {
            s.frequency() == UpdateFrequency::EveryBuild
                && build.repository.matches(&s.source_repository)
        }) {
            let item = UpdateWorkItem::SubscriptionUpdate {
                subscription_id: sub.id,
                build_id,
            };
            if self.dispatcher.enqueue(item).await? == EnqueueOutcome::Enqueued {
                enqueued += 1;
            }
        }
        info!(
            build_id = %build_id,
            channel_id = %channel_id,
            enqueued,
            "build event processed"
        );
        Ok(enqueued)
    }

    /// Resolve the work a check of `frequency` would enqueue.
    pub async fn plan_frequency_check(
        &self,
        frequency: UpdateFrequency,
    ) -> FlowResult<FrequencyCheckPlan> {
        let subscriptions = self
            .catalog
            .enabled_subscriptions_by_frequency(frequency)
            .await?;
        let candidates = subscriptions.len();

        let catalog = &self.catalog;
        let mut resolved = std::pin::pin!(bounded_unordered(
            subscriptions,
            self.max_parallelism,
            |sub| async move {
                let latest = catalog
                    .latest_build_on_channel(sub.channel_id, &sub.source_repository)
                    .await;
                (sub, latest)
            }
        ));

        let mut plan = FrequencyCheckPlan {
            candidates,
            ..FrequencyCheckPlan::default()
        };
        while let Some((sub, latest)) = resolved.next().await {
            match latest {
                Ok(Some(build)) if sub.is_newer(build.id) => {
                    plan.items.push(UpdateWorkItem::SubscriptionUpdate {
                        subscription_id: sub.id,
                        build_id: build.id,
                    });
                }
                Ok(_) => {
                    debug!(subscription_id = %sub.id, "no newer build on channel");
                }
                Err(e) => {
                    plan.failed += 1;
                    warn!(
                        subscription_id = %sub.id,
                        channel_id = %sub.channel_id,
                        error = %e,
                        "latest build lookup failed"
                    );
                }
            }
        }
        // Completion order is arbitrary; keep output stable.
        plan.items.sort_by_key(UpdateWorkItem::message_id);
        Ok(plan)
    }

    /// Enqueue the latest channel build for every enabled subscription at
    /// `frequency` whose last applied build is older.
    ///
    /// A latest build that merely differs from the last applied one, with a
    /// lower id, is left alone: `last_applied_build_id` only moves forward.
    pub async fn check_frequency(
        &self,
        frequency: UpdateFrequency,
    ) -> FlowResult<FrequencyCheckSummary> {
        let plan = self.plan_frequency_check(frequency).await?;
        let mut summary = FrequencyCheckSummary {
            candidates: plan.candidates,
            failed: plan.failed,
            ..FrequencyCheckSummary::default()
        };
        for item in plan.items {
            match self.dispatcher.enqueue(item.clone()).await {
                Ok(EnqueueOutcome::Enqueued) => summary.enqueued += 1,
                Ok(EnqueueOutcome::Deduplicated) => summary.unchanged += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        subscription_id = ?item.subscription_id().map(|s| s.to_string()),
                        error = %e,
                        "enqueue failed"
                    );
                }
            }
        }
        summary.unchanged += summary
            .candidates
            .saturating_sub(summary.enqueued + summary.unchanged + summary.failed);
        obs::emit_frequency_check_finished(
            frequency,
            summary.candidates,
            summary.enqueued,
            summary.failed,
        );
        Ok(summary)
    }

    /// Request `build_id` for one subscription, regardless of its frequency.
    ///
    /// The build must exist, be on the subscription's channel and come from
    /// its source repository.
    pub async fn request_update(
        &self,
        subscription_id: SubscriptionId,
        build_id: BuildId,
    ) -> FlowResult<RequestOutcome> {
        let sub = self.catalog.get_subscription(subscription_id).await?;
        let build = self.catalog.get_build(build_id).await?;
        validate_build(&sub, &build)?;
        self.request(&sub, build.id).await
    }

    /// Request the latest build on the subscription's channel.
    pub async fn request_update_latest(
        &self,
        subscription_id: SubscriptionId,
    ) -> FlowResult<RequestOutcome> {
        let sub = self.catalog.get_subscription(subscription_id).await?;
        let build = self
            .catalog
            .latest_build_on_channel(sub.channel_id, &sub.source_repository)
            .await?
            .ok_or(FlowError::NoBuildAvailable { subscription_id })?;
        self.request(&sub, build.id).await
    }

    async fn request(&self, sub: &Subscription, build_id: BuildId) -> FlowResult<RequestOutcome> {
        if !sub.is_newer(build_id) {
            obs::emit_update_skipped(sub.id, build_id, sub.last_applied_build_id);
            return Ok(RequestOutcome::UpToDate(build_id));
        }
        let item = UpdateWorkItem::SubscriptionUpdate {
            subscription_id: sub.id,
            build_id,
        };
        Ok(match self.dispatcher.enqueue(item).await? {
            EnqueueOutcome::Enqueued => RequestOutcome::Enqueued(build_id),
            EnqueueOutcome::Deduplicated => RequestOutcome::AlreadyPending(build_id),
        })
    }
}

fn validate_build(sub: &Subscription, build: &Build) -> FlowResult<()> {
    if !build.is_on_channel(sub.channel_id) {
        return Err(FlowError::BuildNotOnChannel {
            build_id: build.id,
            channel_id: sub.channel_id,
        });
    }
    if !build.repository.matches(&sub.source_repository) {
        return Err(FlowError::BuildFromOtherRepository {
            build_id: build.id,
            repository: build.repository.url(),
        });
    }
    Ok(())
}
