//! Expected build durations from pipeline history.
//!
//! Official time comes from successful non-PR runs of a default channel's
//! official pipelines on its branch; PR time from successful pull-request
//! runs of its validation pipelines targeting that branch. Each pipeline's
//! durations are trimmed to the 5th-95th percentile and averaged, but only
//! once it has at least [`MIN_SAMPLES`] runs. A node's time is its slowest
//! pipeline. Untrusted estimates count as zero.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_state::{BuildTime, BuildTimeProvider, DefaultChannel, StorageError, StorageResult};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{FlowError, FlowResult};

pub const MIN_SAMPLES: usize = 30;
const Z_95: f64 = 1.96;

/// Response header carrying the token for the next page of a build list.
const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";
/// Stop following continuation tokens after this many pages.
const MAX_PAGES: usize = 200;

/// One successful pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub definition_id: u32,
    pub duration_minutes: f64,
    pub is_pull_request: bool,
    /// Branch built (CI) or merged into (PR), without `refs/heads/`.
    pub branch: String,
}

#[async_trait]
pub trait PipelineRunSource: Send + Sync {
    /// Successful runs of `definition_ids` finished since `since`.
    async fn successful_runs(
        &self,
        organization: &str,
        project: &str,
        definition_ids: &[u32],
        since: DateTime<Utc>,
    ) -> FlowResult<Vec<PipelineRun>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationEstimate {
    pub mean_minutes: f64,
    /// Half-width of the 95% confidence interval of the mean.
    pub confidence_interval_minutes: f64,
    /// Runs left after trimming.
    pub samples: usize,
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Trimmed mean of `durations`, or `None` with fewer than [`MIN_SAMPLES`].
pub fn estimate_duration(durations: &[f64]) -> Option<DurationEstimate> {
    if durations.len() < MIN_SAMPLES {
        return None;
    }
    let mut sorted = durations.to_vec();
    sorted.sort_by(f64::total_cmp);
    let low = nearest_rank(&sorted, 5.0);
    let high = nearest_rank(&sorted, 95.0);
    let kept: Vec<f64> = sorted.into_iter().filter(|d| *d >= low && *d <= high).collect();

    let n = kept.len() as f64;
    let mean = kept.iter().sum::<f64>() / n;
    let variance = kept.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
    Some(DurationEstimate {
        mean_minutes: mean,
        confidence_interval_minutes: Z_95 * variance.sqrt() / n.sqrt(),
        samples: kept.len(),
    })
}

/// Slowest trusted pipeline among `runs`, in minutes.
fn slowest_pipeline<'a, I>(runs: I) -> f64
where
    I: IntoIterator<Item = &'a PipelineRun>,
{
    let mut by_definition: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for run in runs {
        by_definition
            .entry(run.definition_id)
            .or_default()
            .push(run.duration_minutes);
    }
    by_definition
        .into_iter()
        .filter_map(|(definition, durations)| {
            let estimate = estimate_duration(&durations);
            if estimate.is_none() {
                debug!(definition, runs = durations.len(), "too few runs to estimate");
            }
            estimate
        })
        .map(|e| e.mean_minutes)
        .fold(0.0, f64::max)
}

fn normalize_branch(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

pub struct HistoricalBuildTimes {
    source: Arc<dyn PipelineRunSource>,
}

impl HistoricalBuildTimes {
    pub fn new(source: Arc<dyn PipelineRunSource>) -> Self {
        Self { source }
    }

    async fn estimate(&self, dc: &DefaultChannel, days: u32) -> FlowResult<BuildTime> {
        let Some(pipelines) = &dc.pipelines else {
            return Ok(BuildTime::default());
        };
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        let branch = normalize_branch(&dc.branch);

        let mut time = BuildTime::default();
        if !pipelines.official.is_empty() {
            let runs = self
                .source
                .successful_runs(&pipelines.organization, &pipelines.project, &pipelines.official, since)
                .await?;
            time.official_build_minutes = slowest_pipeline(
                runs.iter()
                    .filter(|r| !r.is_pull_request && normalize_branch(&r.branch) == branch),
            );
        }
        if !pipelines.pr.is_empty() {
            let runs = self
                .source
                .successful_runs(&pipelines.organization, &pipelines.project, &pipelines.pr, since)
                .await?;
            time.pr_build_minutes = slowest_pipeline(
                runs.iter()
                    .filter(|r| r.is_pull_request && normalize_branch(&r.branch) == branch),
            );
        }
        Ok(time)
    }
}

#[async_trait]
impl BuildTimeProvider for HistoricalBuildTimes {
    async fn build_time(&self, default_channel: &DefaultChannel, days: u32) -> StorageResult<BuildTime> {
        self.estimate(default_channel, days)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Azure DevOps
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BuildList {
    #[serde(default)]
    value: Vec<AzdoBuild>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzdoBuild {
    definition: AzdoDefinition,
    #[serde(default)]
    reason: String,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    source_branch: String,
    #[serde(default)]
    trigger_info: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AzdoDefinition {
    id: u32,
}

/// Convert a `_apis/build/builds` response into runs, dropping runs
/// without both timestamps.
pub fn parse_build_list(body: &str) -> FlowResult<Vec<PipelineRun>> {
    let list: BuildList = serde_json::from_str(body)
        .map_err(|e| FlowError::BuildHistory(format!("malformed build list: {e}")))?;
    Ok(list
        .value
        .into_iter()
        .filter_map(|b| {
            let (start, finish) = (b.start_time?, b.finish_time?);
            let is_pull_request = b.reason.eq_ignore_ascii_case("pullRequest");
            let branch = if is_pull_request {
                b.trigger_info
                    .get("pr.targetBranch")
                    .cloned()
                    .unwrap_or(b.source_branch)
            } else {
                b.source_branch
            };
            Some(PipelineRun {
                definition_id: b.definition.id,
                duration_minutes: (finish - start).num_seconds() as f64 / 60.0,
                is_pull_request,
                branch: normalize_branch(&branch).to_string(),
            })
        })
        .collect())
}

/// Reads pipeline history from the Azure DevOps build REST API, following
/// continuation tokens until the time window is exhausted.
pub struct AzureDevOpsRunSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl AzureDevOpsRunSource {
    pub fn new(base_url: &str, token: Option<String>) -> FlowResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("depflow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FlowError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// `https://dev.azure.com` with the token from `AZDO_TOKEN`, if set.
    pub fn from_env() -> FlowResult<Self> {
        let base = std::env::var("AZDO_BASE_URL").unwrap_or_else(|_| "https://dev.azure.com".into());
        Self::new(&base, std::env::var("AZDO_TOKEN").ok())
    }
}

#[async_trait]
impl PipelineRunSource for AzureDevOpsRunSource {
    async fn successful_runs(
        &self,
        organization: &str,
        project: &str,
        definition_ids: &[u32],
        since: DateTime<Utc>,
    ) -> FlowResult<Vec<PipelineRun>> {
        let definitions = definition_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/{organization}/{project}/_apis/build/builds", self.base_url);
        let min_time = since.to_rfc3339();

        let mut runs = Vec::new();
        let mut continuation: Option<String> = None;
        let mut pages = 0;
        loop {
            let (page, next) = self
                .fetch_page(&url, &definitions, &min_time, continuation.as_deref())
                .await?;
            runs.extend(page);
            pages += 1;
            match next {
                Some(token) if pages < MAX_PAGES => continuation = Some(token),
                Some(_) => {
                    warn!(organization, project, pages, "build list truncated at page limit");
                    break;
                }
                None => break,
            }
        }
        debug!(organization, project, definitions = %definitions, pages, runs = runs.len(), "fetched pipeline runs");
        Ok(runs)
    }
}

impl AzureDevOpsRunSource {
    /// One page of the build list plus the token for the next, if any.
    async fn fetch_page(
        &self,
        url: &str,
        definitions: &str,
        min_time: &str,
        continuation: Option<&str>,
    ) -> FlowResult<(Vec<PipelineRun>, Option<String>)> {
        let mut request = self.client.get(url).query(&[
            ("definitions", definitions),
            ("minTime", min_time),
            ("statusFilter", "completed"),
            ("resultFilter", "succeeded"),
            ("api-version", "7.1"),
        ]);
        if let Some(token) = continuation {
            request = request.query(&[("continuationToken", token)]);
        }
        if let Some(token) = &self.token {
            request = request.basic_auth("", Some(token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FlowError::BuildHistory(e.to_string()))?;
        let status = response.status();
        let next = response
            .headers()
            .get(CONTINUATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| FlowError::BuildHistory(e.to_string()))?;
        if !status.is_success() {
            return Err(FlowError::BuildHistory(format!("{url} returned {status}")));
        }
        Ok((parse_build_list(&body)?, next))
    }
}
