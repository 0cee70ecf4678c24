//! Request shape and the per-request federated query plan.

use serde::{Deserialize, Serialize};

use crate::config::CoordinatorOptions;
use crate::errors::{FederationError, FederationResult};
use crate::models::{LimitsMeta, SearchMode, WorkspaceConfig};
use crate::query::federated::args::{per_repo_invocation, PerRepoInvocation};
use crate::query::federated::cohorts::{CohortPolicy, CohortSelectors};
use crate::query::federated::executor::{BackendParams, CancellationToken};
use crate::query::federated::merge::MergeParams;
use crate::query::federated::selection::{SelectInput, SpreadSelection, StringOrList};
use crate::query::guards::{
    coerce_limit, default_per_repo_top, truncate_query, MAX_FEDERATED_CONCURRENCY,
    MAX_FEDERATED_PER_REPO_TOP, MAX_FEDERATED_TOP,
};

pub const MERGE_STRATEGY_RRF: &str = "rrf";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchOptions {
    pub mode: Option<String>,
    pub top: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitOptions {
    pub per_repo_top: Option<i64>,
    pub concurrency: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MergeOptions {
    pub strategy: Option<String>,
    pub rrf_k: Option<i64>,
}

/// One federated search request as it arrives on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FederatedSearchRequest {
    pub workspace_path: String,
    /// Pre-validated snapshot; only honored when the caller marks it trusted.
    pub workspace_config: Option<WorkspaceConfig>,
    pub workspace_id: Option<String>,
    pub query: String,
    pub search: SearchOptions,
    pub limits: LimitOptions,
    pub merge: MergeOptions,
    pub select: Option<SelectInput>,
    #[serde(flatten)]
    pub spread: SpreadSelection,
    pub cohort: Option<StringOrList>,
    pub cohort_policy: Option<String>,
    pub allow_unsafe_mix: bool,
    pub strict: bool,
    pub raw_args: Option<Vec<String>>,
}

impl FederatedSearchRequest {
    pub fn new(workspace_path: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn cohort_tokens(&self) -> Vec<String> {
        match &self.cohort {
            Some(StringOrList::One(token)) => vec![token.clone()],
            Some(StringOrList::Many(tokens)) => tokens.clone(),
            None => Vec::new(),
        }
    }
}

/// Everything about a request that does not depend on the workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct FederatedQueryPlan {
    pub query: String,
    pub requested_mode: Option<String>,
    pub modes: Vec<SearchMode>,
    pub top: i64,
    pub per_repo_top: i64,
    pub concurrency: i64,
    pub rrf_k: i64,
    pub policy: CohortPolicy,
    pub selectors: CohortSelectors,
    pub allow_unsafe_mix: bool,
    pub strict: bool,
    pub invocation: PerRepoInvocation,
}

pub(crate) fn parse_policy(value: Option<&str>) -> FederationResult<CohortPolicy> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("default") => Ok(CohortPolicy::Default),
        Some("strict") => Ok(CohortPolicy::Strict),
        Some(other) => Err(FederationError::invalid_request(format!(
            "Unknown cohort policy \"{other}\"."
        ))),
    }
}

impl FederatedQueryPlan {
    /// Validate and coerce a request against coordinator defaults.
    pub fn from_request(
        request: &FederatedSearchRequest,
        options: &CoordinatorOptions,
    ) -> FederationResult<Self> {
        let query = truncate_query(&request.query);
        if query.is_empty() {
            return Err(FederationError::invalid_request(
                "Federated search requires a non-empty query.",
            ));
        }
        if let Some(strategy) = request.merge.strategy.as_deref() {
            if !strategy.trim().eq_ignore_ascii_case(MERGE_STRATEGY_RRF) {
                return Err(FederationError::invalid_request(format!(
                    "Unsupported merge strategy \"{strategy}\"."
                )));
            }
        }

        let requested_mode = request
            .search
            .mode
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let modes = SearchMode::resolve_requested(requested_mode.as_deref());

        let top = coerce_limit(request.search.top, options.default_top, 0, MAX_FEDERATED_TOP);
        let per_repo_top = coerce_limit(
            request.limits.per_repo_top,
            default_per_repo_top(top),
            0,
            MAX_FEDERATED_PER_REPO_TOP,
        );
        let concurrency = coerce_limit(
            request.limits.concurrency,
            options.default_concurrency,
            1,
            MAX_FEDERATED_CONCURRENCY,
        );
        let rrf_k = request.merge.rrf_k.unwrap_or(options.rrf_k).max(1);

        let selectors = CohortSelectors::parse(&request.cohort_tokens())?;
        let policy = parse_policy(request.cohort_policy.as_deref())?;
        let invocation = per_repo_invocation(
            request.raw_args.as_deref(),
            requested_mode.as_deref(),
            &query,
            per_repo_top,
        );

        Ok(Self {
            query,
            requested_mode,
            modes,
            top,
            per_repo_top,
            concurrency,
            rrf_k,
            policy,
            selectors,
            allow_unsafe_mix: request.allow_unsafe_mix,
            strict: request.strict,
            invocation,
        })
    }

    pub fn merge_params(&self) -> MergeParams {
        MergeParams {
            top_n: self.top as usize,
            per_repo_top: self.per_repo_top as usize,
            rrf_k: self.rrf_k as f64,
        }
    }

    pub fn limits_meta(&self) -> LimitsMeta {
        LimitsMeta {
            top: self.top,
            per_repo_top: self.per_repo_top,
            concurrency: self.concurrency,
            merge: MERGE_STRATEGY_RRF.to_string(),
            rrf_k: self.rrf_k,
        }
    }

    pub fn backend_params(&self, cancellation: &CancellationToken) -> BackendParams {
        BackendParams {
            mode: self.requested_mode.clone(),
            query: self.invocation.query.clone(),
            top: self.per_repo_top,
            args: self.invocation.args.clone(),
            cancellation: cancellation.clone(),
        }
    }
}
