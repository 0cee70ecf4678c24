//! Python extension module `_federation_core`.
//!
//! Values cross the boundary as JSON through Python's `json` module, so the
//! Python side works with plain dicts shaped like the wire format.

use std::sync::Arc;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CoordinatorOptions;
use crate::errors::{ErrorKind, FederationError, FederationResult};
use crate::models::{
    repo_id_from_path, FederatedResponse, PerRepoResult, RepoAvailability, RepoCandidate,
    RepoSearchResult, SearchMode, WorkspaceConfig, WorkspaceRepoEntry,
};
use crate::query::federated::cohorts::{self, CohortRequest, CohortSelectors};
use crate::query::federated::coordinator::{FederatedCoordinator, RequestContext};
use crate::query::federated::executor::{BackendParams, CancellationToken, SearchBackend};
use crate::query::federated::merge::{self, MergeParams, ModeParticipants};
use crate::query::federated::planner::{parse_policy, FederatedSearchRequest};
use crate::query::federated::redact;
use crate::query::guards::{
    self, coerce_limit, default_per_repo_top, MAX_FEDERATED_PER_REPO_TOP, MAX_FEDERATED_TOP,
};
use crate::store::query_cache::{MemoryQueryCache, QueryCache};
use crate::store::sqlite_cache::SqliteQueryCache;
use crate::workspace::{IndexResolver, WorkspaceLoader};

// ---------------------------------------------------------------------------
// JSON bridge
// ---------------------------------------------------------------------------

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let json_str =
        serde_json::to_string(value).map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
    let json_module = py.import("json")?;
    json_module
        .call_method1("loads", (json_str,))
        .map(|o| o.into())
}

fn from_py<T: DeserializeOwned>(obj: &Bound<'_, PyAny>) -> PyResult<T> {
    let json_module = obj.py().import("json")?;
    let json_str: String = json_module.call_method1("dumps", (obj,))?.extract()?;
    serde_json::from_str(&json_str).map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Exceptions raised by host callables may carry a wire code in `code`.
fn federation_error(py: Python<'_>, err: &PyErr) -> FederationError {
    let value = err.value(py);
    let kind = value
        .getattr("code")
        .ok()
        .and_then(|code| code.extract::<String>().ok())
        .map(|code| ErrorKind::from_code(&code))
        .unwrap_or(ErrorKind::Internal);
    FederationError::new(kind, value.to_string())
}

// ---------------------------------------------------------------------------
// Host callables
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct BackendPayload<'a> {
    mode: Option<&'a str>,
    query: &'a str,
    top: i64,
    args: &'a [String],
}

struct PyBackend {
    callable: PyObject,
}

impl SearchBackend for PyBackend {
    fn search(&self, repo_root: &str, params: &BackendParams) -> FederationResult<RepoSearchResult> {
        params.cancellation.check()?;
        let payload = BackendPayload {
            mode: params.mode.as_deref(),
            query: &params.query,
            top: params.top,
            args: &params.args,
        };
        Python::with_gil(|py| {
            let result = (|| -> PyResult<RepoSearchResult> {
                let arg = to_py(py, &payload)?;
                let out = self.callable.call1(py, (repo_root, arg))?;
                from_py(out.bind(py))
            })();
            result.map_err(|err| federation_error(py, &err))
        })
    }
}

struct PyResolver {
    callable: PyObject,
}

impl IndexResolver for PyResolver {
    fn resolve(&self, repo: &WorkspaceRepoEntry) -> FederationResult<RepoAvailability> {
        Python::with_gil(|py| {
            let result = (|| -> PyResult<RepoAvailability> {
                let arg = to_py(py, repo)?;
                let out = self.callable.call1(py, (arg,))?;
                from_py(out.bind(py))
            })();
            result.map_err(|err| federation_error(py, &err))
        })
    }
}

struct PyWorkspaceLoader {
    callable: PyObject,
}

impl WorkspaceLoader for PyWorkspaceLoader {
    fn load(&self, workspace_path: &str) -> FederationResult<WorkspaceConfig> {
        Python::with_gil(|py| {
            let result = (|| -> PyResult<WorkspaceConfig> {
                let out = self.callable.call1(py, (workspace_path,))?;
                from_py(out.bind(py))
            })();
            result.map_err(|err| federation_error(py, &err))
        })
    }
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

/// Cancellation handle shareable with another Python thread.
#[pyclass(name = "Cancellation")]
#[derive(Clone, Default)]
pub struct PyCancellation {
    token: CancellationToken,
}

#[pymethods]
impl PyCancellation {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    #[getter]
    fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[pyclass(name = "FederatedSearch")]
pub struct PyFederatedSearch {
    coordinator: FederatedCoordinator,
}

#[pymethods]
impl PyFederatedSearch {
    #[new]
    #[pyo3(signature = (backend, resolver, workspace_loader=None, options=None, persistent=false, cache_root=None))]
    fn new(
        backend: PyObject,
        resolver: PyObject,
        workspace_loader: Option<PyObject>,
        options: Option<&Bound<'_, PyAny>>,
        persistent: bool,
        cache_root: Option<String>,
    ) -> PyResult<Self> {
        let options: CoordinatorOptions = match options {
            Some(obj) => from_py(obj)?,
            None => CoordinatorOptions::from_env(),
        };
        let cache: Arc<dyn QueryCache> = if persistent {
            let sqlite = SqliteQueryCache::new(&options.cache);
            Arc::new(match cache_root {
                Some(root) => sqlite.with_default_root(root),
                None => sqlite,
            })
        } else {
            Arc::new(MemoryQueryCache::new(&options.cache))
        };
        let mut coordinator = FederatedCoordinator::new(
            Arc::new(PyBackend { callable: backend }),
            Arc::new(PyResolver { callable: resolver }),
        )
        .with_cache(cache)
        .with_options(options);
        if let Some(loader) = workspace_loader {
            coordinator = coordinator.with_loader(Arc::new(PyWorkspaceLoader { callable: loader }));
        }
        Ok(Self { coordinator })
    }

    /// Run a federated search. The GIL is released while repos are queried.
    #[pyo3(signature = (request, trusted=false, cancellation=None))]
    fn search(
        &self,
        py: Python<'_>,
        request: &Bound<'_, PyAny>,
        trusted: bool,
        cancellation: Option<PyRef<'_, PyCancellation>>,
    ) -> PyResult<PyObject> {
        let request: FederatedSearchRequest = from_py(request)?;
        let ctx = RequestContext {
            trusted_workspace_config: trusted,
            cancellation: cancellation
                .map(|handle| handle.token.clone())
                .unwrap_or_default(),
        };
        let response = py.allow_threads(|| self.coordinator.search(&request, &ctx))?;
        to_py(py, &response)
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CandidateInput {
    #[serde(flatten)]
    repo: WorkspaceRepoEntry,
    #[serde(default)]
    indexes: RepoAvailability,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerRepoInput {
    repo_id: String,
    #[serde(default)]
    repo_alias: Option<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    result: RepoSearchResult,
}

#[pyfunction]
#[pyo3(name = "select_cohorts", signature = (repos, mode=None, cohort=None, cohort_policy=None, allow_unsafe_mix=false))]
fn py_select_cohorts(
    py: Python<'_>,
    repos: &Bound<'_, PyAny>,
    mode: Option<&str>,
    cohort: Option<Vec<String>>,
    cohort_policy: Option<&str>,
    allow_unsafe_mix: bool,
) -> PyResult<PyObject> {
    let inputs: Vec<CandidateInput> = from_py(repos)?;
    let candidates: Vec<RepoCandidate> = inputs
        .into_iter()
        .map(|input| {
            let mut repo = input.repo;
            if repo.repo_id.trim().is_empty() {
                repo.repo_id = repo_id_from_path(repo.root_trimmed());
            }
            RepoCandidate {
                repo,
                indexes: input.indexes,
            }
        })
        .collect();
    let modes = SearchMode::resolve_requested(mode);
    let selectors = CohortSelectors::parse(&cohort.unwrap_or_default())?;
    let selection = cohorts::select_cohorts(&CohortRequest {
        repos: &candidates,
        modes: &modes,
        policy: parse_policy(cohort_policy)?,
        selectors: &selectors,
        allow_unsafe_mix,
    })?;
    to_py(py, &selection)
}

#[pyfunction]
#[pyo3(name = "merge_federated_results", signature = (per_repo_results, selected_repos_by_mode, top=10, per_repo_top=None, rrf_k=60))]
fn py_merge_federated_results(
    py: Python<'_>,
    per_repo_results: &Bound<'_, PyAny>,
    selected_repos_by_mode: &Bound<'_, PyAny>,
    top: i64,
    per_repo_top: Option<i64>,
    rrf_k: i64,
) -> PyResult<PyObject> {
    let inputs: Vec<PerRepoInput> = from_py(per_repo_results)?;
    let per_repo: Vec<PerRepoResult> = inputs
        .into_iter()
        .map(|input| PerRepoResult {
            repo_id: input.repo_id,
            repo_alias: input.repo_alias,
            priority: input.priority,
            result: input.result,
        })
        .collect();
    let by_mode: Value = from_py(selected_repos_by_mode)?;
    let participants = ModeParticipants::by_mode_from_value(&by_mode);

    let top = coerce_limit(Some(top), 0, 0, MAX_FEDERATED_TOP);
    let per_repo_top = coerce_limit(
        per_repo_top,
        default_per_repo_top(top),
        0,
        MAX_FEDERATED_PER_REPO_TOP,
    );
    let merged = merge::merge_federated_results(
        &per_repo,
        &participants,
        &MergeParams {
            top_n: top as usize,
            per_repo_top: per_repo_top as usize,
            rrf_k: rrf_k.max(1) as f64,
        },
    );
    to_py(
        py,
        &serde_json::json!({
            "code": merged.code,
            "prose": merged.prose,
            "extractedProse": merged.extracted_prose,
            "records": merged.records,
        }),
    )
}

/// Redact every path-typed field of a federated response dict.
#[pyfunction]
#[pyo3(name = "redact_path_fields")]
fn py_redact_path_fields(py: Python<'_>, response: &Bound<'_, PyAny>) -> PyResult<PyObject> {
    let mut response: FederatedResponse = from_py(response)?;
    redact::redact_response(&mut response);
    to_py(py, &response)
}

#[pyfunction]
#[pyo3(name = "redact_path")]
fn py_redact_path(value: &str) -> String {
    redact::redact_path(value)
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

#[pymodule]
fn _federation_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyFederatedSearch>()?;
    m.add_class::<PyCancellation>()?;

    m.add("MAX_QUERY_LENGTH", guards::MAX_QUERY_LENGTH)?;
    m.add("MAX_FEDERATED_TOP", guards::MAX_FEDERATED_TOP)?;
    m.add("MAX_FEDERATED_PER_REPO_TOP", guards::MAX_FEDERATED_PER_REPO_TOP)?;
    m.add("MAX_FEDERATED_CONCURRENCY", guards::MAX_FEDERATED_CONCURRENCY)?;
    m.add("DEFAULT_RRF_K", guards::DEFAULT_RRF_K)?;
    m.add("REDACTED_MARKER", redact::REDACTED_MARKER)?;

    m.add_function(wrap_pyfunction!(py_select_cohorts, m)?)?;
    m.add_function(wrap_pyfunction!(py_merge_federated_results, m)?)?;
    m.add_function(wrap_pyfunction!(py_redact_path_fields, m)?)?;
    m.add_function(wrap_pyfunction!(py_redact_path, m)?)?;
    Ok(())
}
