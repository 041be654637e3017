//! Catalog records: builds, channels, subscriptions and queue payloads.
//!
//! Everything here is plain serde data. Builds are immutable apart from
//! channel associations and incoherencies, which are append-only and
//! idempotent. A subscription's `last_applied_build_id` only ever moves
//! forward.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Numeric build id. Ids grow with ingestion order, so a larger id is a newer build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub u64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(BuildId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SubscriptionId)
    }
}

// ---------------------------------------------------------------------------
// Repository addressing
// ---------------------------------------------------------------------------

/// Where a build came from. GitHub repositories are addressed by URL,
/// Azure DevOps repositories by account/project/repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoAddress {
    #[serde(rename = "github")]
    GitHub {
        url: String,
    },
    AzureDevOps {
        account: String,
        project: String,
        repository: String,
    },
}

impl RepoAddress {
    pub fn github(url: impl Into<String>) -> Self {
        RepoAddress::GitHub { url: url.into() }
    }

    pub fn azure_devops(
        account: impl Into<String>,
        project: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        RepoAddress::AzureDevOps {
            account: account.into(),
            project: project.into(),
            repository: repository.into(),
        }
    }

    /// Canonical URL for whichever scheme is populated.
    pub fn url(&self) -> String {
        match self {
            RepoAddress::GitHub { url } => url.clone(),
            RepoAddress::AzureDevOps {
                account,
                project,
                repository,
            } => format!("https://dev.azure.com/{account}/{project}/_git/{repository}"),
        }
    }

    /// Whether `repository`, as stored on subscriptions and default
    /// channels, names this address. URLs compare case-insensitively.
    pub fn matches(&self, repository: &str) -> bool {
        self.url().eq_ignore_ascii_case(repository)
    }
}

impl fmt::Display for RepoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Case-insensitive `repository@branch` key used to identify flow-graph nodes.
pub fn repo_branch_key(repository: &str, branch: &str) -> String {
    format!("{repository}@{branch}").to_lowercase()
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Join record between a build and a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildChannel {
    pub channel_id: ChannelId,
    /// When the build became available on the channel.
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub version: String,
}

/// Dependency edge from a build to a build it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildRef {
    pub build_id: BuildId,
    /// False when the dependency only contributes build tooling.
    pub is_product: bool,
    #[serde(default)]
    pub time_to_inclusion_minutes: f64,
}

/// A dependency resolved at conflicting versions through different paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildIncoherence {
    pub name: String,
    pub version: String,
    pub repository: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repository: RepoAddress,
    pub branch: String,
    pub commit: String,
    pub date_produced: DateTime<Utc>,
    #[serde(default)]
    pub channels: Vec<BuildChannel>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub dependencies: Vec<BuildRef>,
    #[serde(default)]
    pub incoherencies: Vec<BuildIncoherence>,
}

impl Build {
    pub fn is_on_channel(&self, channel_id: ChannelId) -> bool {
        self.channels.iter().any(|c| c.channel_id == channel_id)
    }

    /// Associate the build with a channel. Returns `false` if it already was.
    pub fn add_channel(&mut self, channel_id: ChannelId, added_at: DateTime<Utc>) -> bool {
        if self.is_on_channel(channel_id) {
            return false;
        }
        self.channels.push(BuildChannel {
            channel_id,
            added_at,
        });
        true
    }

    /// Append incoherencies not already recorded; returns how many were new.
    pub fn add_incoherencies<I>(&mut self, incoherencies: I) -> usize
    where
        I: IntoIterator<Item = BuildIncoherence>,
    {
        let mut added = 0;
        for inc in incoherencies {
            if !self.incoherencies.contains(&inc) {
                self.incoherencies.push(inc);
                added += 1;
            }
        }
        added
    }

    /// True when at least one dependency is a product (non-tooling) dependency.
    pub fn has_product_dependency(&self) -> bool {
        self.dependencies.iter().any(|d| d.is_product)
    }
}

/// Input to the ingestion boundary; the catalog assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBuild {
    pub repository: RepoAddress,
    pub branch: String,
    pub commit: String,
    pub date_produced: DateTime<Utc>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub dependencies: Vec<BuildRef>,
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub classification: String,
}

/// Pipeline definition ids used to look up historical build durations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinitions {
    pub organization: String,
    pub project: String,
    #[serde(default)]
    pub official: Vec<u32>,
    #[serde(default)]
    pub pr: Vec<u32>,
}

/// Builds of `repository@branch` are published to `channel_id` automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultChannel {
    pub id: u32,
    pub repository: String,
    pub branch: String,
    pub channel_id: ChannelId,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub pipelines: Option<PipelineDefinitions>,
}

fn enabled_by_default() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateFrequency {
    None,
    EveryBuild,
    EveryDay,
    TwiceDaily,
    EveryWeek,
}

impl UpdateFrequency {
    pub const ALL: [UpdateFrequency; 5] = [
        UpdateFrequency::None,
        UpdateFrequency::EveryBuild,
        UpdateFrequency::EveryDay,
        UpdateFrequency::TwiceDaily,
        UpdateFrequency::EveryWeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateFrequency::None => "none",
            UpdateFrequency::EveryBuild => "everyBuild",
            UpdateFrequency::EveryDay => "everyDay",
            UpdateFrequency::TwiceDaily => "twiceDaily",
            UpdateFrequency::EveryWeek => "everyWeek",
        }
    }
}

impl fmt::Display for UpdateFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpdateFrequency::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown update frequency: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPolicy {
    pub update_frequency: UpdateFrequency,
    #[serde(default)]
    pub batchable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel_id: ChannelId,
    pub source_repository: String,
    pub target_repository: String,
    pub target_branch: String,
    pub enabled: bool,
    pub policy: SubscriptionPolicy,
    #[serde(default)]
    pub last_applied_build_id: Option<BuildId>,
}

impl Subscription {
    pub fn frequency(&self) -> UpdateFrequency {
        self.policy.update_frequency
    }

    /// True when `build_id` is strictly newer than the last applied build.
    pub fn is_newer(&self, build_id: BuildId) -> bool {
        self.last_applied_build_id.map_or(true, |last| build_id > last)
    }
}

// ---------------------------------------------------------------------------
// Queue payloads
// ---------------------------------------------------------------------------

/// A unit of work on the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateWorkItem {
    /// A build was added to a channel; expand into per-subscription updates.
    BuildAdded {
        build_id: BuildId,
        channel_id: ChannelId,
    },
    /// Apply one build to one subscription.
    SubscriptionUpdate {
        subscription_id: SubscriptionId,
        build_id: BuildId,
    },
    /// Operator request; `None` means the latest build on the channel.
    TriggerSubscription {
        subscription_id: SubscriptionId,
        build_id: Option<BuildId>,
    },
}

impl UpdateWorkItem {
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateWorkItem::BuildAdded { .. } => "build_added",
            UpdateWorkItem::SubscriptionUpdate { .. } => "subscription_update",
            UpdateWorkItem::TriggerSubscription { .. } => "trigger_subscription",
        }
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        match self {
            UpdateWorkItem::BuildAdded { .. } => None,
            UpdateWorkItem::SubscriptionUpdate {
                subscription_id, ..
            }
            | UpdateWorkItem::TriggerSubscription {
                subscription_id, ..
            } => Some(*subscription_id),
        }
    }

    /// Deterministic id: equal items share a message id, which queues use to
    /// collapse duplicates that are still pending.
    pub fn message_id(&self) -> String {
        let canonical = match self {
            UpdateWorkItem::BuildAdded {
                build_id,
                channel_id,
            } => format!("build_added:{build_id}:{channel_id}"),
            UpdateWorkItem::SubscriptionUpdate {
                subscription_id,
                build_id,
            } => format!("subscription_update:{subscription_id}:{build_id}"),
            UpdateWorkItem::TriggerSubscription {
                subscription_id,
                build_id,
            } => match build_id {
                Some(b) => format!("trigger_subscription:{subscription_id}:{b}"),
                None => format!("trigger_subscription:{subscription_id}:latest"),
            },
        };
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..16])
    }
}

// ---------------------------------------------------------------------------
// Build durations and reports
// ---------------------------------------------------------------------------

/// Expected durations, in minutes, for one `repository@branch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildTime {
    pub official_build_minutes: f64,
    pub pr_build_minutes: f64,
}

/// Nightly record of the critical path through one channel's flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongestBuildPath {
    pub channel_id: ChannelId,
    pub reported_at: DateTime<Utc>,
    pub best_case_minutes: f64,
    pub worst_case_minutes: f64,
    /// `repository@branch` keys ordered by descending best-case time.
    pub contributing_repositories: Vec<String>,
}
