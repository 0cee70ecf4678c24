//! Reciprocal rank fusion of per-repo ranked lists.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use indexmap::IndexMap;
use serde_json::Value;

use crate::models::{MergedHit, PerRepoResult, RepoRef, SearchMode};

/// Repos allowed to contribute to one mode.
///
/// Normalized once when a selection enters the merger so that callers holding
/// loosely shaped data (for example JSON from a binding) never reach the
/// fusion loop with anything but an explicit list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ModeParticipants {
    #[default]
    Empty,
    List(Vec<String>),
}

impl ModeParticipants {
    pub fn from_repos(repos: &[RepoRef]) -> Self {
        if repos.is_empty() {
            return ModeParticipants::Empty;
        }
        ModeParticipants::List(repos.iter().map(|r| r.repo_id.clone()).collect())
    }

    /// Accepts an array of repo ids or of objects carrying `repoId`. Any
    /// other shape means no participants.
    pub fn from_value(value: &Value) -> Self {
        let Value::Array(items) = value else {
            return ModeParticipants::Empty;
        };
        let ids: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                Value::String(id) => Some(id.clone()),
                Value::Object(obj) => obj
                    .get("repoId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect();
        if ids.is_empty() {
            ModeParticipants::Empty
        } else {
            ModeParticipants::List(ids)
        }
    }

    /// Per-mode participants from a `{mode: [...]}` object. Unknown modes are
    /// skipped and any non-object value yields an empty map.
    pub fn by_mode_from_value(value: &Value) -> BTreeMap<SearchMode, ModeParticipants> {
        let Value::Object(by_mode) = value else {
            return BTreeMap::new();
        };
        by_mode
            .iter()
            .filter_map(|(key, value)| {
                SearchMode::parse(key).map(|mode| (mode, ModeParticipants::from_value(value)))
            })
            .collect()
    }

    pub fn contains(&self, repo_id: &str) -> bool {
        match self {
            ModeParticipants::Empty => false,
            ModeParticipants::List(ids) => ids.iter().any(|id| id == repo_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ModeParticipants::Empty => true,
            ModeParticipants::List(ids) => ids.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeParams {
    pub top_n: usize,
    pub per_repo_top: usize,
    pub rrf_k: f64,
}

/// Fused hit lists for every mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedByMode {
    pub code: Vec<MergedHit>,
    pub prose: Vec<MergedHit>,
    pub extracted_prose: Vec<MergedHit>,
    pub records: Vec<MergedHit>,
}

impl MergedByMode {
    fn slot(&mut self, mode: SearchMode) -> &mut Vec<MergedHit> {
        match mode {
            SearchMode::Code => &mut self.code,
            SearchMode::Prose => &mut self.prose,
            SearchMode::ExtractedProse => &mut self.extracted_prose,
            SearchMode::Records => &mut self.records,
        }
    }
}

struct Fused {
    hit: MergedHit,
    priority: i64,
}

fn compare_fused(a: &Fused, b: &Fused) -> Ordering {
    b.hit
        .score
        .total_cmp(&a.hit.score)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.hit.repo_id.cmp(&b.hit.repo_id))
        .then_with(|| a.hit.repo_alias.cmp(&b.hit.repo_alias))
        .then_with(|| a.hit.global_id.cmp(&b.hit.global_id))
}

/// Fuse one mode's per-repo lists.
///
/// Each repo list is cut to `per_repo_top`; a hit at 1-based rank `r`
/// contributes `1 / (rrf_k + r)`. Only repos listed in `participants`
/// contribute, whatever else their raw results contain.
pub fn merge_mode(
    per_repo: &[PerRepoResult],
    participants: &ModeParticipants,
    mode: SearchMode,
    params: &MergeParams,
) -> Vec<MergedHit> {
    if participants.is_empty() || params.top_n == 0 {
        return Vec::new();
    }
    let mut scoped: Vec<&PerRepoResult> = per_repo
        .iter()
        .filter(|entry| participants.contains(&entry.repo_id))
        .collect();
    scoped.sort_by(|a, b| {
        a.repo_id
            .cmp(&b.repo_id)
            .then_with(|| a.repo_alias.cmp(&b.repo_alias))
    });

    let mut fused: IndexMap<String, Fused> = IndexMap::new();
    for entry in scoped {
        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, raw) in entry
            .result
            .hits(mode)
            .iter()
            .take(params.per_repo_top)
            .enumerate()
        {
            if !seen.insert(raw.id.as_str()) {
                continue;
            }
            let contribution = 1.0 / (params.rrf_k + (idx + 1) as f64);
            let global_id = format!("{}:{}", entry.repo_id, raw.id);
            fused
                .entry(global_id.clone())
                .and_modify(|f| f.hit.score += contribution)
                .or_insert_with(|| Fused {
                    hit: MergedHit {
                        id: raw.id.clone(),
                        global_id,
                        repo_id: entry.repo_id.clone(),
                        repo_alias: entry.repo_alias.clone(),
                        file: raw.file.clone(),
                        score: contribution,
                        payload: raw.payload.clone(),
                    },
                    priority: entry.priority,
                });
        }
    }

    let mut ranked: Vec<Fused> = fused.into_values().collect();
    ranked.sort_by(compare_fused);
    ranked.truncate(params.top_n);
    ranked.into_iter().map(|f| f.hit).collect()
}

/// Fuse every mode independently, so repos excluded from one mode never take
/// that mode's slots.
pub fn merge_federated_results(
    per_repo: &[PerRepoResult],
    participants_by_mode: &BTreeMap<SearchMode, ModeParticipants>,
    params: &MergeParams,
) -> MergedByMode {
    let mut out = MergedByMode::default();
    for mode in SearchMode::ALL {
        let Some(participants) = participants_by_mode.get(&mode) else {
            continue;
        };
        *out.slot(mode) = merge_mode(per_repo, participants, mode, params);
    }
    out
}
