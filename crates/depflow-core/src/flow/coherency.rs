//! Transitive dependency coherency.
//!
//! Starting from one repository/commit, walk the dependency manifests of
//! every repository/commit they reference. A dependency name that resolves
//! to more than one distinct (version, commit) along different paths is
//! incoherent. A repository that shows up at more than one commit is
//! reported too.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use flow_state::BuildIncoherence;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::FlowResult;
use crate::sync::bounded_map;

/// One entry of a repository's dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestDependency {
    pub name: String,
    pub version: String,
    /// Repository the dependency was built from.
    pub repository: String,
    pub commit: String,
}

/// Reads the dependency manifest of a repository at a commit.
#[async_trait]
pub trait ManifestReader: Send + Sync {
    async fn read_dependencies(
        &self,
        repository: &str,
        commit: &str,
    ) -> FlowResult<Vec<ManifestDependency>>;
}

/// Fixed manifests, keyed by repository and commit. Unknown pairs have no
/// dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticManifests {
    #[serde(default)]
    pub manifests: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub repository: String,
    pub commit: String,
    #[serde(default)]
    pub dependencies: Vec<ManifestDependency>,
}

impl StaticManifests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, repository: &str, commit: &str, deps: Vec<ManifestDependency>) -> Self {
        self.manifests.push(ManifestEntry {
            repository: repository.into(),
            commit: commit.into(),
            dependencies: deps,
        });
        self
    }
}

#[async_trait]
impl ManifestReader for StaticManifests {
    async fn read_dependencies(
        &self,
        repository: &str,
        commit: &str,
    ) -> FlowResult<Vec<ManifestDependency>> {
        Ok(self
            .manifests
            .iter()
            .find(|m| m.repository.eq_ignore_ascii_case(repository) && m.commit == commit)
            .map(|m| m.dependencies.clone())
            .unwrap_or_default())
    }
}

/// Result of a coherency walk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoherencyReport {
    /// Every conflicting resolution, ordered by name then version.
    pub incoherencies: Vec<BuildIncoherence>,
    /// Repositories reached at more than one commit.
    pub incoherent_repositories: BTreeMap<String, BTreeSet<String>>,
    /// Distinct repository/commit pairs visited, the root included.
    pub visited: usize,
}

impl CoherencyReport {
    pub fn is_coherent(&self) -> bool {
        self.incoherencies.is_empty()
    }
}

pub struct CoherencyAnalyzer<'a> {
    reader: &'a dyn ManifestReader,
    max_parallelism: usize,
}

impl<'a> CoherencyAnalyzer<'a> {
    pub fn new(reader: &'a dyn ManifestReader, max_parallelism: usize) -> Self {
        Self {
            reader,
            max_parallelism,
        }
    }

    /// Walk the transitive manifests of `repository@commit` breadth first.
    pub async fn analyze(&self, repository: &str, commit: &str) -> FlowResult<CoherencyReport> {
        let mut visited: HashSet<(String, String)> = HashSet::new();
        visited.insert((repository.to_lowercase(), commit.to_string()));
        let mut frontier = vec![(repository.to_string(), commit.to_string())];

        // name -> every (version, repository, commit) it resolved to
        let mut resolutions: BTreeMap<String, BTreeSet<(String, String, String)>> = BTreeMap::new();
        let mut commits_by_repo: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        commits_by_repo
            .entry(repository.to_lowercase())
            .or_default()
            .insert(commit.to_string());

        while !frontier.is_empty() {
            let reader = self.reader;
            let manifests = bounded_map(frontier.iter().cloned(), self.max_parallelism, |(repo, sha)| {
                async move { reader.read_dependencies(&repo, &sha).await }
            })
            .await;

            let mut next = Vec::new();
            for manifest in manifests {
                for dep in manifest? {
                    resolutions.entry(dep.name.clone()).or_default().insert((
                        dep.version.clone(),
                        dep.repository.clone(),
                        dep.commit.clone(),
                    ));
                    let key = (dep.repository.to_lowercase(), dep.commit.clone());
                    if visited.insert(key) {
                        commits_by_repo
                            .entry(dep.repository.to_lowercase())
                            .or_default()
                            .insert(dep.commit.clone());
                        next.push((dep.repository, dep.commit));
                    }
                }
            }
            debug!(discovered = next.len(), "coherency walk level done");
            frontier = next;
        }

        let incoherencies: Vec<BuildIncoherence> = resolutions
            .into_iter()
            .filter(|(_, seen)| {
                let distinct: HashSet<(&str, &str)> = seen
                    .iter()
                    .map(|(version, _, sha)| (version.as_str(), sha.as_str()))
                    .collect();
                distinct.len() > 1
            })
            .flat_map(|(name, seen)| {
                seen.into_iter()
                    .map(move |(version, repository, commit)| BuildIncoherence {
                        name: name.clone(),
                        version,
                        repository,
                        commit,
                    })
            })
            .collect();

        let incoherent_repositories = commits_by_repo
            .into_iter()
            .filter(|(_, commits)| commits.len() > 1)
            .collect();

        let report = CoherencyReport {
            incoherencies,
            incoherent_repositories,
            visited: visited.len(),
        };
        info!(
            repository,
            commit,
            visited = report.visited,
            incoherencies = report.incoherencies.len(),
            "coherency analysis finished"
        );
        Ok(report)
    }
}
