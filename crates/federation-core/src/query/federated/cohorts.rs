//! Cohort selection: group repos by index compatibility and pick the
//! participants for each requested mode.
//!
//! Repos are only comparable within one mode when their indexes share a
//! compatibility signature. For every mode the available repos are bucketed by
//! `cohortKey`, falling back to `compatibilityKey`, falling back to a null
//! bucket. Cohorts are ranked by member count, then summed priority, then key
//! (null last), and exactly one cohort wins unless unsafe mixing is requested.
//!
//! Everything in this module is a pure function of its inputs; the input repo
//! order never affects the output.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, FederationError, FederationResult};
use crate::models::{RepoCandidate, RepoRef, SearchMode};

pub const WARN_MULTI_COHORT: &str = "WARN_FEDERATED_MULTI_COHORT";
pub const WARN_UNSAFE_MIXING: &str = "WARN_FEDERATED_UNSAFE_MIXING";
pub const REASON_COHORT_EXCLUDED: &str = "cohort-excluded";

// ---------------------------------------------------------------------------
// Policy and selectors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CohortPolicy {
    #[default]
    Default,
    Strict,
}

impl CohortPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CohortPolicy::Default => "default",
            CohortPolicy::Strict => "strict",
        }
    }
}

/// Parsed `cohort` selector tokens.
///
/// A token is either `mode:key` (pins one mode) or a bare `key` (pins every
/// mode). At most one bare key is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CohortSelectors {
    global: Option<String>,
    by_mode: BTreeMap<SearchMode, String>,
}

impl CohortSelectors {
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> FederationResult<Self> {
        let mut selectors = CohortSelectors::default();
        for raw in tokens {
            let token = raw.as_ref().trim();
            if token.is_empty() {
                continue;
            }
            let scoped = token
                .split_once(':')
                .and_then(|(prefix, key)| SearchMode::parse(prefix).map(|mode| (mode, key.trim())));
            match scoped {
                Some((mode, key)) => {
                    if key.is_empty() {
                        return Err(FederationError::invalid_selector(format!(
                            "Cohort selector \"{token}\" has an empty key."
                        )));
                    }
                    if let Some(existing) = selectors.by_mode.get(&mode) {
                        if existing != key {
                            return Err(FederationError::invalid_selector(format!(
                                "Conflicting cohort selectors for mode {mode}: \"{existing}\" and \"{key}\"."
                            )));
                        }
                    }
                    selectors.by_mode.insert(mode, key.to_string());
                }
                None => match &selectors.global {
                    Some(existing) if existing == token => {}
                    Some(existing) => {
                        return Err(FederationError::invalid_selector(format!(
                            "Only one global cohort selector is allowed (got \"{existing}\" and \"{token}\")."
                        )));
                    }
                    None => selectors.global = Some(token.to_string()),
                },
            }
        }
        Ok(selectors)
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.by_mode.is_empty()
    }

    /// Selector that applies to `mode`: a mode-scoped one wins over the global one.
    pub fn for_mode(&self, mode: SearchMode) -> Option<&str> {
        self.by_mode
            .get(&mode)
            .map(String::as_str)
            .or(self.global.as_deref())
    }

    /// Sorted canonical token list, used for cache keys.
    pub fn canonical_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .by_mode
            .iter()
            .map(|(mode, key)| format!("{mode}:{key}"))
            .collect();
        if let Some(global) = &self.global {
            tokens.push(global.clone());
        }
        tokens.sort();
        tokens
    }
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Repos sharing one compatibility signature in one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cohort {
    pub key: Option<String>,
    pub repos: Vec<RepoRef>,
    pub count: usize,
    pub total_priority: i64,
}

/// Compact cohort listing for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortSummary {
    pub key: Option<String>,
    pub repo_ids: Vec<String>,
    pub count: usize,
    pub total_priority: i64,
}

impl From<&Cohort> for CohortSummary {
    fn from(cohort: &Cohort) -> Self {
        Self {
            key: cohort.key.clone(),
            repo_ids: cohort.repos.iter().map(|r| r.repo_id.clone()).collect(),
            count: cohort.count,
            total_priority: cohort.total_priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CohortResolution {
    /// No repo was available for the mode.
    Empty,
    /// An explicit selector chose the cohort.
    Pinned,
    /// All cohorts were merged on request.
    UnsafeMix,
    /// The top-ranked cohort won.
    Ranked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSelection {
    pub resolution: CohortResolution,
    pub cohort_key: Option<String>,
    pub cohorts: Vec<CohortSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedRepo {
    pub repo_id: String,
    pub effective_key: Option<String>,
    pub reason: String,
}

/// Result of cohort selection across all requested modes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortSelection {
    pub policy: CohortPolicy,
    pub allow_unsafe_mix: bool,
    pub mode_selections: BTreeMap<SearchMode, ModeSelection>,
    pub selected_repos_by_mode: BTreeMap<SearchMode, Vec<RepoRef>>,
    pub excluded: BTreeMap<SearchMode, Vec<ExcludedRepo>>,
    pub warnings: BTreeSet<String>,
}

impl CohortSelection {
    pub fn repos_for_mode(&self, mode: SearchMode) -> &[RepoRef] {
        self.selected_repos_by_mode
            .get(&mode)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Union of repo ids selected for any of `modes`, sorted ascending.
    pub fn active_repo_ids(&self, modes: &[SearchMode]) -> Vec<String> {
        let ids: BTreeSet<&str> = modes
            .iter()
            .flat_map(|mode| self.repos_for_mode(*mode))
            .map(|repo| repo.repo_id.as_str())
            .collect();
        ids.into_iter().map(str::to_string).collect()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Inputs to [`select_cohorts`].
#[derive(Debug, Clone, Copy)]
pub struct CohortRequest<'a> {
    pub repos: &'a [RepoCandidate],
    pub modes: &'a [SearchMode],
    pub policy: CohortPolicy,
    pub selectors: &'a CohortSelectors,
    pub allow_unsafe_mix: bool,
}

fn compare_cohorts(a: &Cohort, b: &Cohort) -> Ordering {
    b.count
        .cmp(&a.count)
        .then_with(|| b.total_priority.cmp(&a.total_priority))
        .then_with(|| match (&a.key, &b.key) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Bucket available repos by effective key and rank the buckets.
pub fn build_cohorts(repos: &[RepoCandidate], mode: SearchMode) -> Vec<Cohort> {
    let mut buckets: BTreeMap<Option<String>, Vec<RepoRef>> = BTreeMap::new();
    for candidate in repos {
        let Some(avail) = candidate.indexes.get(&mode) else {
            continue;
        };
        if !avail.present {
            continue;
        }
        let key = avail.effective_key().map(str::to_string);
        buckets.entry(key.clone()).or_default().push(RepoRef {
            repo_id: candidate.repo.repo_id.clone(),
            alias: candidate.repo.alias.clone(),
            priority: candidate.repo.priority,
            root: candidate.repo.root.clone(),
            index_dir: avail.index_dir.clone(),
            effective_key: key,
        });
    }

    let mut cohorts: Vec<Cohort> = buckets
        .into_iter()
        .map(|(key, mut repos)| {
            repos.sort_by(|a, b| a.repo_id.cmp(&b.repo_id).then_with(|| a.root.cmp(&b.root)));
            Cohort {
                count: repos.len(),
                total_priority: repos.iter().map(|r| r.priority).sum(),
                key,
                repos,
            }
        })
        .collect();
    cohorts.sort_by(compare_cohorts);
    cohorts
}

fn excluded_from(cohorts: &[Cohort], winner: usize) -> Vec<ExcludedRepo> {
    let mut excluded: Vec<ExcludedRepo> = cohorts
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != winner)
        .flat_map(|(_, cohort)| cohort.repos.iter())
        .map(|repo| ExcludedRepo {
            repo_id: repo.repo_id.clone(),
            effective_key: repo.effective_key.clone(),
            reason: REASON_COHORT_EXCLUDED.to_string(),
        })
        .collect();
    excluded.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
    excluded
}

/// Choose the participating repos per mode.
///
/// Fails with `ERR_FEDERATED_COHORT_NOT_FOUND` when a selector names a cohort
/// that does not exist for a mode, and with `ERR_FEDERATED_MULTI_COHORT` when
/// strict policy meets more than one cohort.
pub fn select_cohorts(request: &CohortRequest<'_>) -> FederationResult<CohortSelection> {
    let mut sorted: Vec<&RepoCandidate> = request.repos.iter().collect();
    sorted.sort_by(|a, b| {
        a.repo
            .repo_id
            .cmp(&b.repo.repo_id)
            .then_with(|| a.repo.root.cmp(&b.repo.root))
    });
    let sorted: Vec<RepoCandidate> = sorted.into_iter().cloned().collect();

    let modes: BTreeSet<SearchMode> = request.modes.iter().copied().collect();
    let mut out = CohortSelection {
        policy: request.policy,
        allow_unsafe_mix: request.allow_unsafe_mix,
        ..CohortSelection::default()
    };

    for mode in modes {
        let cohorts = build_cohorts(&sorted, mode);
        let summaries: Vec<CohortSummary> = cohorts.iter().map(CohortSummary::from).collect();

        if cohorts.is_empty() {
            out.mode_selections.insert(
                mode,
                ModeSelection {
                    resolution: CohortResolution::Empty,
                    cohort_key: None,
                    cohorts: summaries,
                },
            );
            out.selected_repos_by_mode.insert(mode, Vec::new());
            continue;
        }

        if let Some(selector) = request.selectors.for_mode(mode) {
            let winner = cohorts
                .iter()
                .position(|c| c.key.as_deref() == Some(selector))
                .ok_or_else(|| {
                    FederationError::new(
                        ErrorKind::CohortNotFound,
                        format!("Cohort \"{selector}\" was not found for mode {mode}."),
                    )
                })?;
            record_winner(&mut out, mode, &cohorts, winner, CohortResolution::Pinned, summaries);
            continue;
        }

        if request.allow_unsafe_mix {
            let mut repos: Vec<RepoRef> = cohorts.iter().flat_map(|c| c.repos.clone()).collect();
            repos.sort_by(|a, b| a.repo_id.cmp(&b.repo_id).then_with(|| a.root.cmp(&b.root)));
            if cohorts.len() > 1 {
                out.warnings.insert(WARN_UNSAFE_MIXING.to_string());
            }
            out.mode_selections.insert(
                mode,
                ModeSelection {
                    resolution: CohortResolution::UnsafeMix,
                    cohort_key: None,
                    cohorts: summaries,
                },
            );
            out.selected_repos_by_mode.insert(mode, repos);
            continue;
        }

        if cohorts.len() > 1 {
            if request.policy == CohortPolicy::Strict {
                let keys: Vec<String> = cohorts
                    .iter()
                    .map(|c| c.key.clone().unwrap_or_else(|| "<none>".to_string()))
                    .collect();
                return Err(FederationError::new(
                    ErrorKind::MultiCohort,
                    format!(
                        "Mode {mode} spans {} index cohorts ({}); strict policy requires one.",
                        cohorts.len(),
                        keys.join(", ")
                    ),
                ));
            }
            out.warnings.insert(WARN_MULTI_COHORT.to_string());
        }
        record_winner(&mut out, mode, &cohorts, 0, CohortResolution::Ranked, summaries);
    }

    Ok(out)
}

fn record_winner(
    out: &mut CohortSelection,
    mode: SearchMode,
    cohorts: &[Cohort],
    winner: usize,
    resolution: CohortResolution,
    summaries: Vec<CohortSummary>,
) {
    let excluded = excluded_from(cohorts, winner);
    if !excluded.is_empty() {
        out.excluded.insert(mode, excluded);
    }
    out.mode_selections.insert(
        mode,
        ModeSelection {
            resolution,
            cohort_key: cohorts[winner].key.clone(),
            cohorts: summaries,
        },
    );
    out.selected_repos_by_mode
        .insert(mode, cohorts[winner].repos.clone());
}
