//! Federated search coordinator.
//!
//! One call per request: resolve the workspace, select repos and cohorts,
//! consult the response cache, fan out to the backend, fuse the per-repo
//! lists, redact paths, and persist the settled response.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CoordinatorOptions;
use crate::errors::{FederationError, FederationResult};
use crate::models::{
    CacheMeta, FederatedResponse, RepoCandidate, ResponseMeta, SearchMode, WorkspaceConfig,
    WorkspaceMeta, FEDERATED_BACKEND,
};
use crate::query::federated::cache_key::{federated_cache_key, CacheKeyInputs};
use crate::query::federated::cohorts::{select_cohorts, CohortRequest, CohortSelection};
use crate::query::federated::executor::{
    run_fanout, CancellationToken, FanoutReport, FanoutTask, SearchBackend,
};
use crate::query::federated::merge::{merge_federated_results, MergedByMode, ModeParticipants};
use crate::query::federated::planner::{FederatedQueryPlan, FederatedSearchRequest};
use crate::query::federated::redact::redact_response;
use crate::query::federated::selection::{
    resolve_workspace_config, select_workspace_repos, RepoSelection, SelectionDirectives,
};
use crate::store::query_cache::{CacheScope, QueryCache};
use crate::workspace::{
    compute_config_hash, compute_manifest_hash, compute_repo_set_id, resolve_availability,
    workspace_dir, IndexResolver, WorkspaceLoader,
};

/// Per-call context supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// The host vouches for `workspaceConfig` on the request.
    pub trusted_workspace_config: bool,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn trusted() -> Self {
        Self {
            trusted_workspace_config: true,
            ..Self::default()
        }
    }
}

pub struct FederatedCoordinator {
    backend: Arc<dyn SearchBackend>,
    resolver: Arc<dyn IndexResolver>,
    loader: Option<Arc<dyn WorkspaceLoader>>,
    cache: Option<Arc<dyn QueryCache>>,
    options: CoordinatorOptions,
}

/// Workspace state resolved for one request.
struct Resolved {
    workspace: WorkspaceConfig,
    repo_set_id: String,
    manifest_hash: String,
    selection: RepoSelection,
    cohorts: CohortSelection,
    cache_key: String,
    cache_root: Option<PathBuf>,
}

impl FederatedCoordinator {
    pub fn new(backend: Arc<dyn SearchBackend>, resolver: Arc<dyn IndexResolver>) -> Self {
        Self {
            backend,
            resolver,
            loader: None,
            cache: None,
            options: CoordinatorOptions::default(),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn WorkspaceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    fn active_cache(&self) -> Option<&dyn QueryCache> {
        if !self.options.cache.enabled {
            return None;
        }
        self.cache.as_deref()
    }

    /// Run one federated search.
    ///
    /// Configuration errors surface before any backend call. A response is
    /// written to the cache only when every repo settled without failure and
    /// the call was not cancelled.
    pub fn search(
        &self,
        request: &FederatedSearchRequest,
        ctx: &RequestContext,
    ) -> FederationResult<FederatedResponse> {
        ctx.cancellation.check()?;
        let plan = FederatedQueryPlan::from_request(request, &self.options)?;
        let resolved = self.resolve(request, ctx, &plan)?;
        let scope = CacheScope {
            repo_set_id: &resolved.repo_set_id,
            cache_root: resolved.cache_root.as_deref(),
        };

        if let Some(cache) = self.active_cache() {
            match cache.get(&scope, &resolved.cache_key, &resolved.manifest_hash) {
                Ok(Some(mut cached)) => {
                    debug!(key = %resolved.cache_key, "federated cache hit");
                    cached.meta.cache = Some(CacheMeta {
                        hit: true,
                        key: resolved.cache_key.clone(),
                    });
                    return Ok(cached);
                }
                Ok(None) => debug!(key = %resolved.cache_key, "federated cache miss"),
                Err(err) => warn!("federated cache lookup failed: {err}"),
            }
        }

        let active = resolved.cohorts.active_repo_ids(&plan.modes);
        let report = if active.is_empty() {
            debug!("no repos active for the requested modes");
            FanoutReport::default()
        } else {
            let tasks = fanout_tasks(&resolved.selection, &active);
            let report = run_fanout(
                Arc::clone(&self.backend),
                tasks,
                &plan.backend_params(&ctx.cancellation),
                plan.concurrency as usize,
            )?;
            report.settle(plan.strict).map_err(|err| {
                if plan.strict && err.kind.is_soft() {
                    FederationError::new(
                        err.kind,
                        format!("Federated search failed in strict mode: {}", err.message),
                    )
                } else {
                    err
                }
            })?;
            report
        };
        ctx.cancellation.check()?;

        let participants: BTreeMap<SearchMode, ModeParticipants> = plan
            .modes
            .iter()
            .map(|mode| {
                (
                    *mode,
                    ModeParticipants::from_repos(resolved.cohorts.repos_for_mode(*mode)),
                )
            })
            .collect();
        let merged = merge_federated_results(&report.results, &participants, &plan.merge_params());

        let has_failures = report.has_failures();
        let mut response = assemble(&resolved, &plan, merged, report);
        redact_response(&mut response);

        if let Some(cache) = self.active_cache() {
            if has_failures {
                debug!("skipping cache write for partial federated response");
            } else if let Err(err) = cache.put(
                &scope,
                &resolved.cache_key,
                &resolved.manifest_hash,
                &response,
            ) {
                warn!("federated cache write failed: {err}");
            }
        }

        info!(
            repo_set_id = %resolved.repo_set_id,
            hits = response.total_hits(),
            repos = response.repos.len(),
            "federated search complete"
        );
        response.meta.cache = Some(CacheMeta {
            hit: false,
            key: resolved.cache_key,
        });
        Ok(response)
    }

    fn resolve(
        &self,
        request: &FederatedSearchRequest,
        ctx: &RequestContext,
        plan: &FederatedQueryPlan,
    ) -> FederationResult<Resolved> {
        let workspace = resolve_workspace_config(
            &request.workspace_path,
            request.workspace_config.as_ref(),
            ctx.trusted_workspace_config,
            self.loader.as_deref(),
        )?;
        let repo_set_id = compute_repo_set_id(&workspace)?;
        if let Some(requested) = request
            .workspace_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            if requested != repo_set_id {
                return Err(FederationError::invalid_request(
                    "workspaceId does not match the resolved workspace.",
                ));
            }
        }
        let config_hash = compute_config_hash(&workspace)?;

        let directives = SelectionDirectives::normalize(request.select.as_ref(), &request.spread);
        let selection = select_workspace_repos(&workspace, &directives)?;

        let selected = WorkspaceConfig {
            repos: selection.repos.clone(),
            ..workspace.clone()
        };
        let mut availability = resolve_availability(self.resolver.as_ref(), &selected);
        let manifest_hash = compute_manifest_hash(&availability)?;
        let candidates: Vec<RepoCandidate> = selection
            .repos
            .iter()
            .map(|repo| RepoCandidate {
                repo: repo.clone(),
                indexes: availability.remove(&repo.repo_id).unwrap_or_default(),
            })
            .collect();

        let cohorts = select_cohorts(&CohortRequest {
            repos: &candidates,
            modes: &plan.modes,
            policy: plan.policy,
            selectors: &plan.selectors,
            allow_unsafe_mix: plan.allow_unsafe_mix,
        })?;

        let cache_key = federated_cache_key(&CacheKeyInputs {
            repo_set_id: &repo_set_id,
            config_hash: &config_hash,
            manifest_hash: &manifest_hash,
            workspace: &workspace,
            directives: &directives,
            selection: &selection,
            cohorts: &cohorts,
            plan,
        })?;

        let cache_root = workspace.cache_root.as_deref().map(|root| {
            let base = workspace
                .workspace_path
                .as_deref()
                .unwrap_or(&request.workspace_path);
            workspace_dir(base.trim()).join(root.trim())
        });

        Ok(Resolved {
            workspace,
            repo_set_id,
            manifest_hash,
            selection,
            cohorts,
            cache_key,
            cache_root,
        })
    }
}

fn fanout_tasks(selection: &RepoSelection, active: &[String]) -> Vec<FanoutTask> {
    selection
        .repos
        .iter()
        .filter(|repo| active.contains(&repo.repo_id))
        .map(|repo| FanoutTask {
            repo_id: repo.repo_id.clone(),
            repo_alias: repo.alias.clone(),
            priority: repo.priority,
            root: repo.root.clone(),
        })
        .collect()
}

fn assemble(
    resolved: &Resolved,
    plan: &FederatedQueryPlan,
    merged: MergedByMode,
    report: FanoutReport,
) -> FederatedResponse {
    let warnings: BTreeSet<String> = resolved
        .selection
        .warnings
        .iter()
        .chain(resolved.cohorts.warnings.iter())
        .cloned()
        .collect();

    FederatedResponse {
        ok: true,
        backend: FEDERATED_BACKEND.to_string(),
        code: merged.code,
        prose: merged.prose,
        extracted_prose: merged.extracted_prose,
        records: merged.records,
        repos: report.diagnostics,
        warnings: warnings.into_iter().collect(),
        meta: ResponseMeta {
            repo_set_id: resolved.repo_set_id.clone(),
            manifest_hash: resolved.manifest_hash.clone(),
            workspace: WorkspaceMeta {
                name: resolved.workspace.name.clone(),
                workspace_id: resolved.repo_set_id.clone(),
            },
            selection: resolved.selection.meta.clone(),
            cohorts: resolved.cohorts.clone(),
            limits: plan.limits_meta(),
            cache: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;
    use crate::errors::ErrorKind;
    use crate::models::{RawHit, RepoSearchResult, RepoStatus, WorkspaceRepoEntry};
    use crate::query::federated::cohorts::{CohortResolution, WARN_MULTI_COHORT};
    use crate::query::federated::redact::REDACTED_MARKER;
    use crate::query::federated::selection::WARN_EMPTY_SELECTION;
    use crate::store::query_cache::MemoryQueryCache;
    use crate::store::sqlite_cache::{cache_db_path, SqliteQueryCache};
    use crate::test_support::{code_result, hits, FakeBackend, FakeResolver};
    use crate::workspace::StaticWorkspaceLoader;
    use serde_json::json;

    const WS: &str = "/ws/team.workspace.jsonc";

    fn workspace() -> WorkspaceConfig {
        WorkspaceConfig::new(
            "team",
            vec![
                WorkspaceRepoEntry::new("/src/a").with_repo_id("a").with_alias("alpha"),
                WorkspaceRepoEntry::new("/src/b").with_repo_id("b").with_priority(2),
                WorkspaceRepoEntry::new("/src/c").with_repo_id("c").with_tags(["docs"]),
            ],
        )
        .with_workspace_path(WS)
    }

    fn resolver() -> FakeResolver {
        FakeResolver::new()
            .with_mode("/src/a", SearchMode::Code, Some("k1"))
            .with_mode("/src/b", SearchMode::Code, Some("k1"))
            .with_mode("/src/c", SearchMode::Code, Some("k1"))
    }

    fn backend() -> FakeBackend {
        FakeBackend::new()
            .with_repo("/src/a", code_result(&["a1", "a2"]))
            .with_repo("/src/b", code_result(&["b1", "b2"]))
            .with_repo("/src/c", code_result(&["c1"]))
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        cache: Arc<MemoryQueryCache>,
        coordinator: FederatedCoordinator,
    }

    fn harness_with(backend: FakeBackend, resolver: FakeResolver) -> Harness {
        let backend = Arc::new(backend);
        let cache = Arc::new(MemoryQueryCache::new(&CachePolicy::default()));
        let coordinator = FederatedCoordinator::new(backend.clone(), Arc::new(resolver))
            .with_loader(Arc::new(
                StaticWorkspaceLoader::new().with_workspace(WS, workspace()),
            ))
            .with_cache(cache.clone());
        Harness {
            backend,
            cache,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(backend(), resolver())
    }

    fn request(value: serde_json::Value) -> FederatedSearchRequest {
        let mut request: FederatedSearchRequest = serde_json::from_value(value).unwrap();
        if request.workspace_path.is_empty() {
            request.workspace_path = WS.to_string();
        }
        request
    }

    fn code_query() -> FederatedSearchRequest {
        request(json!({"query": "needle", "search": {"mode": "code"}}))
    }

    fn run(h: &Harness, req: &FederatedSearchRequest) -> FederationResult<FederatedResponse> {
        h.coordinator.search(req, &RequestContext::default())
    }

    fn cache_hit(response: &FederatedResponse) -> bool {
        response.meta.cache.as_ref().is_some_and(|c| c.hit)
    }

    #[test]
    fn fuses_hits_across_repos() {
        let h = harness();
        let response = run(&h, &code_query()).unwrap();
        assert!(response.ok);
        assert_eq!(response.backend, FEDERATED_BACKEND);
        assert_eq!(h.backend.calls(), 3);

        let ids: Vec<&str> = response.code.iter().map(|hit| hit.global_id.as_str()).collect();
        // Rank-1 hits tie on score; b outranks on priority, then a before c.
        assert_eq!(&ids[..3], &["b:b1", "a:a1", "c:c1"]);
        assert_eq!(response.code[1].repo_alias.as_deref(), Some("alpha"));

        let statuses: Vec<(&str, RepoStatus)> = response
            .repos
            .iter()
            .map(|d| (d.repo_id.as_str(), d.status))
            .collect();
        assert_eq!(
            statuses,
            vec![("a", RepoStatus::Ok), ("b", RepoStatus::Ok), ("c", RepoStatus::Ok)]
        );
        assert!(response.meta.repo_set_id.starts_with("ws1-"));
        assert_eq!(response.meta.workspace.workspace_id, response.meta.repo_set_id);
        assert_eq!(response.meta.workspace.name, "team");
        assert!(response.meta.manifest_hash.starts_with("wm1-"));
        assert_eq!(response.meta.limits.merge, "rrf");
        assert!(!cache_hit(&response));
    }

    #[test]
    fn backend_receives_per_repo_limits() {
        let h = harness();
        let req = request(json!({
            "query": "needle",
            "search": {"mode": "code", "top": 5},
            "limits": {"perRepoTop": 7}
        }));
        run(&h, &req).unwrap();
        for (_, params) in h.backend.seen_params() {
            assert_eq!(params.top, 7);
            assert_eq!(params.query, "needle");
            assert_eq!(params.args, vec!["--mode", "code", "--top", "7"]);
        }
    }

    #[test]
    fn identical_request_is_served_from_cache() {
        let h = harness();
        let first = run(&h, &code_query()).unwrap();
        let second = run(&h, &code_query()).unwrap();
        assert_eq!(h.backend.calls(), 3);
        assert!(cache_hit(&second));
        assert_eq!(first.code, second.code);
        assert_eq!(
            first.meta.cache.as_ref().map(|c| &c.key),
            second.meta.cache.as_ref().map(|c| &c.key)
        );
    }

    #[test]
    fn soft_failure_is_never_reused() {
        let h = harness_with(
            backend().fail_once("/src/b", FederationError::no_index("index missing")),
            resolver(),
        );
        let req = request(json!({"query": "needle", "search": {"mode": "code"}, "select": ["a", "b"]}));

        let first = run(&h, &req).unwrap();
        assert_eq!(first.repos[1].status, RepoStatus::MissingIndex);
        assert_eq!(first.repos[1].error.as_ref().unwrap().code, "NO_INDEX");
        assert!(first.code.iter().all(|hit| hit.repo_id == "a"));
        assert_eq!(h.cache.stats().entries, 0);

        let second = run(&h, &req).unwrap();
        assert!(!cache_hit(&second));
        assert_eq!(h.backend.calls_for("/src/b"), 2);
        assert!(second.repos.iter().all(|d| d.status == RepoStatus::Ok));

        let third = run(&h, &req).unwrap();
        assert!(cache_hit(&third));
        assert_eq!(h.backend.calls(), 4);
    }

    #[test]
    fn strict_and_lenient_requests_do_not_share_entries() {
        let h = harness();
        run(&h, &code_query()).unwrap();
        let strict = request(json!({"query": "needle", "search": {"mode": "code"}, "strict": true}));
        let response = run(&h, &strict).unwrap();
        assert!(!cache_hit(&response));
        assert_eq!(h.backend.calls(), 6);
    }

    #[test]
    fn strict_call_fails_on_soft_failure_after_full_fanout() {
        let h = harness_with(
            backend().fail_always("/src/a", FederationError::no_index("index missing")),
            resolver(),
        );
        let strict = request(json!({"query": "needle", "search": {"mode": "code"}, "strict": true}));
        let err = run(&h, &strict).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoIndex);
        assert!(err.message.contains("strict mode"));
        assert_eq!(h.backend.calls(), 3);
        assert_eq!(h.cache.stats().entries, 0);
    }

    #[test]
    fn hard_failure_surfaces_after_every_repo_ran() {
        let h = harness_with(
            backend().fail_always("/src/a", FederationError::internal("backend exploded")),
            resolver(),
        );
        let err = run(&h, &code_query()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(h.backend.calls_for("/src/b"), 1);
        assert_eq!(h.backend.calls_for("/src/c"), 1);
        assert_eq!(h.cache.stats().entries, 0);
    }

    #[test]
    fn every_repo_missing_is_no_index() {
        let h = harness_with(
            FakeBackend::new()
                .fail_always("/src/a", FederationError::no_index("gone"))
                .fail_always("/src/b", FederationError::no_index("gone"))
                .fail_always("/src/c", FederationError::no_index("gone")),
            resolver(),
        );
        assert_eq!(run(&h, &code_query()).unwrap_err().kind, ErrorKind::NoIndex);
    }

    #[test]
    fn cancellation_mid_fanout_is_not_cached() {
        let h = harness_with(backend().cancel_on_call("/src/a"), resolver());
        let ctx = RequestContext::default();
        let err = h.coordinator.search(&code_query(), &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(ctx.cancellation.is_cancelled());
        assert_eq!(h.cache.stats().entries, 0);
    }

    #[test]
    fn cancelled_context_never_reaches_backend() {
        let h = harness();
        let ctx = RequestContext::default();
        ctx.cancellation.cancel();
        let err = h.coordinator.search(&code_query(), &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(h.backend.calls(), 0);
    }

    #[test]
    fn workspace_metadata_change_forces_refanout() {
        let h = harness();
        let mut req = code_query();
        req.workspace_config = Some(workspace());
        let ctx = RequestContext::trusted();
        h.coordinator.search(&req, &ctx).unwrap();
        h.coordinator.search(&req, &ctx).unwrap();
        assert_eq!(h.backend.calls(), 3);

        let mut renamed = workspace();
        renamed.name = "platform".to_string();
        req.workspace_config = Some(renamed);
        let response = h.coordinator.search(&req, &ctx).unwrap();
        assert!(!cache_hit(&response));
        assert_eq!(response.meta.workspace.name, "platform");
        assert_eq!(h.backend.calls(), 6);
    }

    #[test]
    fn priority_change_forces_refanout() {
        let h = harness();
        let mut req = code_query();
        req.workspace_config = Some(workspace());
        let ctx = RequestContext::trusted();
        h.coordinator.search(&req, &ctx).unwrap();

        let mut reprioritized = workspace();
        reprioritized.repos[0].priority = 9;
        req.workspace_config = Some(reprioritized);
        let response = h.coordinator.search(&req, &ctx).unwrap();
        assert!(!cache_hit(&response));
        assert_eq!(response.code[0].repo_id, "a");
    }

    #[test]
    fn trusted_config_from_another_workspace_is_rejected() {
        let h = harness();
        let mut req = code_query();
        req.workspace_config = Some(workspace().with_workspace_path("/elsewhere/.workspace.jsonc"));
        let err = h.coordinator.search(&req, &RequestContext::trusted()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert_eq!(h.backend.calls(), 0);
    }

    #[test]
    fn untrusted_config_is_ignored() {
        let h = harness();
        let mut req = code_query();
        let mut tampered = workspace();
        tampered.repos.truncate(1);
        req.workspace_config = Some(tampered);
        let response = run(&h, &req).unwrap();
        assert_eq!(response.meta.selection.selected_repo_ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn workspace_id_must_match() {
        let h = harness();
        let first = run(&h, &code_query()).unwrap();
        let mut req = code_query();
        req.workspace_id = Some(first.meta.repo_set_id.clone());
        assert!(run(&h, &req).is_ok());
        req.workspace_id = Some("ws1-other".to_string());
        assert_eq!(run(&h, &req).unwrap_err().kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn repos_outside_a_modes_cohort_never_contribute() {
        let resolver = FakeResolver::new()
            .with_mode("/src/a", SearchMode::Code, Some("k1"))
            .with_mode("/src/a", SearchMode::Prose, Some("p1"))
            .with_mode("/src/b", SearchMode::Code, Some("k1"))
            .with_mode("/src/c", SearchMode::Code, Some("k2"));
        let both = |ids: &[&str]| RepoSearchResult {
            backend: "fake".to_string(),
            code: hits(ids),
            prose: hits(ids),
            ..RepoSearchResult::default()
        };
        let backend = FakeBackend::new()
            .with_repo("/src/a", both(&["a1"]))
            .with_repo("/src/b", both(&["b1"]))
            .with_repo("/src/c", both(&["c1"]));
        let h = harness_with(backend, resolver);
        let req = request(json!({"query": "needle", "search": {"mode": "prose"}}));
        let response = run(&h, &req).unwrap();

        assert!(response.prose.iter().all(|hit| hit.repo_id == "a"));
        assert!(response.extracted_prose.is_empty());
        assert!(response.code.is_empty());
        assert_eq!(h.backend.calls(), 1);

        let req = request(json!({"query": "needle", "search": {"mode": "code"}}));
        let response = run(&h, &req).unwrap();
        assert!(response.code.iter().all(|hit| hit.repo_id != "c"));
        assert_eq!(h.backend.calls_for("/src/c"), 0);
        assert!(response.warnings.contains(&WARN_MULTI_COHORT.to_string()));
        let code = &response.meta.cohorts.mode_selections[&SearchMode::Code];
        assert_eq!(code.resolution, CohortResolution::Ranked);
        assert_eq!(code.cohort_key.as_deref(), Some("k1"));
    }

    #[test]
    fn unknown_cohort_selector_fails_before_fanout() {
        let h = harness();
        let req = request(json!({"query": "needle", "search": {"mode": "code"}, "cohort": "code:k9"}));
        let err = run(&h, &req).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CohortNotFound);
        assert_eq!(h.backend.calls(), 0);
    }

    #[test]
    fn empty_selection_returns_cacheable_empty_payload() {
        let h = harness();
        let req = request(json!({"query": "needle", "select": {"tag": "nothing"}}));
        let response = run(&h, &req).unwrap();
        assert!(response.ok);
        assert_eq!(response.total_hits(), 0);
        assert!(response.repos.is_empty());
        assert_eq!(response.warnings, vec![WARN_EMPTY_SELECTION.to_string()]);
        assert_eq!(h.backend.calls(), 0);
        assert!(cache_hit(&run(&h, &req).unwrap()));
    }

    #[test]
    fn absolute_paths_are_redacted() {
        let backend = FakeBackend::new()
            .with_repo(
                "/src/a",
                RepoSearchResult {
                    backend: "fake".to_string(),
                    code: vec![
                        RawHit::new("a1", Some("/src/a/lib.rs"), 1.0)
                            .with_field("snippet", json!("see /src/a/lib.rs")),
                        RawHit::new("a2", Some("src/main.rs"), 0.5),
                    ],
                    ..RepoSearchResult::default()
                },
            )
            .fail_always(
                "/src/b",
                FederationError::no_index("index missing at /src/b/.index/code."),
            );
        let h = harness_with(backend, resolver());
        let req = request(json!({"query": "needle", "search": {"mode": "code"}, "select": ["/src/a", "b"]}));
        let response = run(&h, &req).unwrap();

        assert_eq!(response.code[0].file.as_deref(), Some(REDACTED_MARKER));
        assert_eq!(response.code[1].file.as_deref(), Some("src/main.rs"));
        assert_eq!(response.code[0].payload["snippet"], json!("see /src/a/lib.rs"));
        assert_eq!(
            response.repos[1].error.as_ref().unwrap().message,
            "index missing at <redacted>."
        );
        assert_eq!(response.meta.selection.explicit_selects, vec![REDACTED_MARKER, "b"]);
        for repo in response.meta.cohorts.repos_for_mode(SearchMode::Code) {
            assert_eq!(repo.root, REDACTED_MARKER);
            assert_eq!(repo.index_dir.as_deref(), Some(REDACTED_MARKER));
        }
        let serialized = serde_json::to_string(&response.meta).unwrap();
        assert!(!serialized.contains("/src/"));
    }

    #[test]
    fn disabled_cache_always_fans_out() {
        let h = harness();
        let coordinator = FederatedCoordinator::new(h.backend.clone(), Arc::new(resolver()))
            .with_loader(Arc::new(
                StaticWorkspaceLoader::new().with_workspace(WS, workspace()),
            ))
            .with_cache(h.cache.clone())
            .with_options(CoordinatorOptions {
                cache: CachePolicy::disabled(),
                ..CoordinatorOptions::default()
            });
        let ctx = RequestContext::default();
        coordinator.search(&code_query(), &ctx).unwrap();
        let second = coordinator.search(&code_query(), &ctx).unwrap();
        assert!(!cache_hit(&second));
        assert_eq!(h.backend.calls(), 6);
        assert_eq!(h.cache.stats().entries, 0);
    }

    #[test]
    fn persistent_cache_lives_under_workspace_cache_root() {
        let dir = tempfile::tempdir().unwrap();
        let ws_path = dir.path().join("team.workspace.jsonc");
        let ws_path = ws_path.to_string_lossy().to_string();
        let config = workspace()
            .with_workspace_path(ws_path.clone())
            .with_cache_root(".cache");
        let backend = Arc::new(backend());
        let coordinator = FederatedCoordinator::new(backend.clone(), Arc::new(resolver()))
            .with_cache(Arc::new(SqliteQueryCache::new(&CachePolicy::default())));

        let mut req = code_query();
        req.workspace_path = ws_path;
        req.workspace_config = Some(config);
        let ctx = RequestContext::trusted();
        let first = coordinator.search(&req, &ctx).unwrap();
        let second = coordinator.search(&req, &ctx).unwrap();
        assert!(cache_hit(&second));
        assert_eq!(backend.calls(), 3);
        assert!(cache_db_path(&dir.path().join(".cache"), &first.meta.repo_set_id).exists());
    }
}
