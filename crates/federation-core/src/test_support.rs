//! Scripted collaborators shared by unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::{FederationError, FederationResult};
use crate::models::{
    RawHit, RepoAvailability, RepoModeAvailability, RepoSearchResult, SearchMode,
    WorkspaceRepoEntry,
};
use crate::query::federated::executor::{BackendParams, SearchBackend};
use crate::workspace::IndexResolver;

pub fn hits(ids: &[&str]) -> Vec<RawHit> {
    ids.iter()
        .enumerate()
        .map(|(rank, id)| RawHit::new(*id, Some(&format!("src/{id}.rs")), 1.0 / (rank as f64 + 1.0)))
        .collect()
}

pub fn code_result(ids: &[&str]) -> RepoSearchResult {
    RepoSearchResult {
        backend: "fake".to_string(),
        code: hits(ids),
        ..RepoSearchResult::default()
    }
}

/// Backend answering from canned results keyed by repo root.
#[derive(Default)]
pub struct FakeBackend {
    results: BTreeMap<String, RepoSearchResult>,
    failures: Mutex<HashMap<String, VecDeque<FederationError>>>,
    persistent_failures: HashMap<String, FederationError>,
    cancel_roots: Vec<String>,
    latency: Duration,
    calls: AtomicUsize,
    calls_by_root: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<(String, BackendParams)>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(mut self, root: &str, result: RepoSearchResult) -> Self {
        self.results.insert(root.to_string(), result);
        self
    }

    /// Fail the next call for `root` only.
    pub fn fail_once(self, root: &str, err: FederationError) -> Self {
        self.failures
            .lock()
            .entry(root.to_string())
            .or_default()
            .push_back(err);
        self
    }

    pub fn fail_always(mut self, root: &str, err: FederationError) -> Self {
        self.persistent_failures.insert(root.to_string(), err);
        self
    }

    /// Fire the shared cancellation token when `root` is searched.
    pub fn cancel_on_call(mut self, root: &str) -> Self {
        self.cancel_roots.push(root.to_string());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, root: &str) -> usize {
        self.calls_by_root.lock().get(root).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn seen_params(&self) -> Vec<(String, BackendParams)> {
        self.seen.lock().clone()
    }
}

impl SearchBackend for FakeBackend {
    fn search(&self, repo_root: &str, params: &BackendParams) -> FederationResult<RepoSearchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_root
            .lock()
            .entry(repo_root.to_string())
            .or_default() += 1;
        self.seen.lock().push((repo_root.to_string(), params.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.cancel_roots.iter().any(|r| r == repo_root) {
            params.cancellation.cancel();
        }
        if let Some(err) = self
            .failures
            .lock()
            .get_mut(repo_root)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if let Some(err) = self.persistent_failures.get(repo_root) {
            return Err(err.clone());
        }
        Ok(self.results.get(repo_root).cloned().unwrap_or_default())
    }
}

/// Resolver reporting one cohort key per repo root and mode.
#[derive(Default)]
pub struct FakeResolver {
    keys: HashMap<String, RepoAvailability>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, root: &str, mode: SearchMode, cohort_key: Option<&str>) -> Self {
        self.keys.entry(root.to_string()).or_default().insert(
            mode,
            RepoModeAvailability::present(cohort_key).with_index_dir(format!("{root}/.index/{mode}")),
        );
        self
    }
}

impl IndexResolver for FakeResolver {
    fn resolve(&self, repo: &WorkspaceRepoEntry) -> FederationResult<RepoAvailability> {
        Ok(self.keys.get(&repo.root).cloned().unwrap_or_default())
    }
}
