//! Applies one build to one subscription.
//!
//! `LastAppliedBuildId` is the only idempotency guard: a build that is not
//! strictly newer is skipped without touching the action or the catalog.
//! The mark is advanced only after the action succeeds.

use std::sync::Arc;

use async_trait::async_trait;
use flow_state::{Build, BuildId, Catalog, Subscription, SubscriptionId};
use tracing::{debug, info};

use crate::error::FlowResult;
use crate::metrics::METRICS;
use crate::obs;

/// The downstream effect of an update, e.g. opening or refreshing a
/// dependency pull request in the target repository.
#[async_trait]
pub trait DependencyUpdateAction: Send + Sync {
    async fn apply(&self, subscription: &Subscription, build: &Build) -> FlowResult<()>;
}

/// Action that only records the decision in the log.
pub struct LogOnlyAction;

#[async_trait]
impl DependencyUpdateAction for LogOnlyAction {
    async fn apply(&self, subscription: &Subscription, build: &Build) -> FlowResult<()> {
        info!(
            subscription_id = %subscription.id,
            build_id = %build.id,
            target = %subscription.target_repository,
            branch = %subscription.target_branch,
            commit = %build.commit,
            "dependency update applied"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The build was not newer than the subscription's last applied build.
    Skipped,
}

pub struct SubscriptionUpdater {
    catalog: Arc<dyn Catalog>,
    action: Arc<dyn DependencyUpdateAction>,
}

impl SubscriptionUpdater {
    pub fn new(catalog: Arc<dyn Catalog>, action: Arc<dyn DependencyUpdateAction>) -> Self {
        Self { catalog, action }
    }

    /// Apply `build_id` to `subscription_id` if it is newer than the last
    /// applied build. Callers must hold the subscription's serializer slot.
    pub async fn update(
        &self,
        subscription_id: SubscriptionId,
        build_id: BuildId,
    ) -> FlowResult<UpdateOutcome> {
        let subscription = self.catalog.get_subscription(subscription_id).await?;
        if !subscription.is_newer(build_id) {
            METRICS.inc_updates_skipped();
            obs::emit_update_skipped(
                subscription_id,
                build_id,
                subscription.last_applied_build_id,
            );
            return Ok(UpdateOutcome::Skipped);
        }

        let build = self.catalog.get_build(build_id).await?;
        obs::emit_update_started(subscription_id, build_id);
        self.action.apply(&subscription, &build).await?;

        if !self
            .catalog
            .set_last_applied_build(subscription_id, build_id)
            .await?
        {
            debug!(
                subscription_id = %subscription_id,
                build_id = %build_id,
                "last applied build already moved past this build"
            );
        }
        METRICS.inc_updates_applied();
        Ok(UpdateOutcome::Applied)
    }
}
