//! Canonical response-cache key for a federated request.
//!
//! The key hashes a typed payload whose every list is pre-sorted and whose
//! maps are ordered, so equal request shapes always serialize to the same
//! bytes.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::FederationResult;
use crate::models::{sha256_hex, SearchMode, WorkspaceConfig};
use crate::query::federated::cohorts::{CohortPolicy, CohortSelection};
use crate::query::federated::planner::FederatedQueryPlan;
use crate::query::federated::selection::{RepoSelection, SelectionDirectives};

pub const CACHE_KEY_PREFIX: &str = "fqc1-";
const CACHE_KEY_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceKey<'a> {
    repo_set_id: &'a str,
    config_hash: &'a str,
    manifest_hash: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectionKey<'a> {
    directives: &'a SelectionDirectives,
    selected_repo_ids: Vec<&'a str>,
    /// Priorities change ranking even when the repo set does not.
    selected_repo_priorities: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CohortKey<'a> {
    policy: CohortPolicy,
    allow_unsafe_mix: bool,
    selectors: Vec<String>,
    winners: BTreeMap<SearchMode, Option<&'a str>>,
    selected_repo_ids: BTreeMap<SearchMode, Vec<&'a str>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchKey<'a> {
    query: &'a str,
    mode: Option<&'a str>,
    modes: &'a [SearchMode],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitsKey {
    top: i64,
    per_repo_top: i64,
    concurrency: i64,
    merge: &'static str,
    rrf_k: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeKey<'a> {
    per_repo_args: &'a [String],
    per_repo_query: &'a str,
    strict: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheKeyPayload<'a> {
    v: u32,
    workspace: WorkspaceKey<'a>,
    selection: SelectionKey<'a>,
    cohorts: CohortKey<'a>,
    search: SearchKey<'a>,
    limits: LimitsKey,
    runtime: RuntimeKey<'a>,
}

/// Inputs the key is derived from.
#[derive(Debug, Clone, Copy)]
pub struct CacheKeyInputs<'a> {
    pub repo_set_id: &'a str,
    pub config_hash: &'a str,
    pub manifest_hash: &'a str,
    pub workspace: &'a WorkspaceConfig,
    pub directives: &'a SelectionDirectives,
    pub selection: &'a RepoSelection,
    pub cohorts: &'a CohortSelection,
    pub plan: &'a FederatedQueryPlan,
}

/// `fqc1-` followed by the SHA-256 of the canonical payload.
pub fn federated_cache_key(inputs: &CacheKeyInputs<'_>) -> FederationResult<String> {
    let plan = inputs.plan;
    let mut priorities: Vec<String> = inputs
        .selection
        .repos
        .iter()
        .map(|r| format!("{}:{}", r.repo_id, r.priority))
        .collect();
    priorities.sort();

    let payload = CacheKeyPayload {
        v: CACHE_KEY_VERSION,
        workspace: WorkspaceKey {
            repo_set_id: inputs.repo_set_id,
            config_hash: inputs.config_hash,
            manifest_hash: inputs.manifest_hash,
            name: inputs.workspace.name.trim(),
        },
        selection: SelectionKey {
            directives: inputs.directives,
            selected_repo_ids: inputs
                .selection
                .repos
                .iter()
                .map(|r| r.repo_id.as_str())
                .collect(),
            selected_repo_priorities: priorities,
        },
        cohorts: CohortKey {
            policy: plan.policy,
            allow_unsafe_mix: plan.allow_unsafe_mix,
            selectors: plan.selectors.canonical_tokens(),
            winners: inputs
                .cohorts
                .mode_selections
                .iter()
                .map(|(mode, sel)| (*mode, sel.cohort_key.as_deref()))
                .collect(),
            selected_repo_ids: inputs
                .cohorts
                .selected_repos_by_mode
                .iter()
                .map(|(mode, repos)| (*mode, repos.iter().map(|r| r.repo_id.as_str()).collect()))
                .collect(),
        },
        search: SearchKey {
            query: &plan.query,
            mode: plan.requested_mode.as_deref(),
            modes: &plan.modes,
        },
        limits: LimitsKey {
            top: plan.top,
            per_repo_top: plan.per_repo_top,
            concurrency: plan.concurrency,
            merge: "rrf",
            rrf_k: plan.rrf_k,
        },
        runtime: RuntimeKey {
            per_repo_args: &plan.invocation.args,
            per_repo_query: &plan.invocation.query,
            strict: plan.strict,
        },
    };
    let canonical = serde_json::to_string(&payload)?;
    Ok(format!("{CACHE_KEY_PREFIX}{}", sha256_hex(&canonical)))
}
