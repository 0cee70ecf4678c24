//! Bounded-concurrency fanout of one query across repo backends.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::errors::{ErrorKind, FederationError, FederationResult};
use crate::models::{
    DiagnosticError, PerRepoDiagnostic, PerRepoResult, RepoSearchResult, RepoStatus,
};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cooperative cancellation shared by the coordinator and every task.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> FederationResult<()> {
        if self.is_cancelled() {
            return Err(FederationError::cancelled());
        }
        Ok(())
    }
}

/// Parameters handed to a backend for one repo.
#[derive(Debug, Clone, Default)]
pub struct BackendParams {
    pub mode: Option<String>,
    pub query: String,
    pub top: i64,
    pub args: Vec<String>,
    pub cancellation: CancellationToken,
}

/// Per-repo search collaborator. Implementations may block on I/O and should
/// watch `params.cancellation` for long operations.
pub trait SearchBackend: Send + Sync {
    fn search(&self, repo_root: &str, params: &BackendParams) -> FederationResult<RepoSearchResult>;
}

/// One repo to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutTask {
    pub repo_id: String,
    pub repo_alias: Option<String>,
    pub priority: i64,
    pub root: String,
}

struct Settled {
    outcome: FederationResult<RepoSearchResult>,
    latency: Duration,
}

/// Everything the fanout produced once every task reached a terminal state.
#[derive(Debug, Clone, Default)]
pub struct FanoutReport {
    pub results: Vec<PerRepoResult>,
    pub diagnostics: Vec<PerRepoDiagnostic>,
    pub first_hard_error: Option<FederationError>,
    pub first_failure: Option<FederationError>,
    pub elapsed_ms: i64,
}

impl FanoutReport {
    pub fn has_failures(&self) -> bool {
        self.first_failure.is_some()
    }

    /// Decide whether the settled fanout fails the call.
    ///
    /// Strict calls fail on the first failure of any kind, others only on a
    /// hard failure or when no repo produced results at all.
    pub fn settle(&self, strict: bool) -> FederationResult<()> {
        if strict {
            if let Some(err) = &self.first_failure {
                return Err(err.clone());
            }
        }
        if let Some(err) = &self.first_hard_error {
            return Err(err.clone());
        }
        if self.results.is_empty() && !self.diagnostics.is_empty() {
            return Err(FederationError::no_index(
                "No repositories produced results for the federated query.",
            ));
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// A backend panic settles its own slot as `INTERNAL`; it never unwinds into
/// the pool, where rayon would abort the process.
fn run_task(
    backend: &dyn SearchBackend,
    root: &str,
    params: &BackendParams,
) -> Settled {
    let started = Instant::now();
    let outcome = match params.cancellation.check() {
        Ok(()) => panic::catch_unwind(AssertUnwindSafe(|| backend.search(root, params)))
            .unwrap_or_else(|payload| {
                Err(FederationError::internal(format!(
                    "Repo search panicked: {}",
                    panic_message(payload.as_ref())
                )))
            }),
        Err(err) => Err(err),
    };
    Settled {
        outcome,
        latency: started.elapsed(),
    }
}

/// Query every task's repo with at most `concurrency` searches in flight.
///
/// Tasks are settled into slots in repo-id order so diagnostics and the
/// surfaced error never depend on completion order. Firing the token returns
/// `CANCELLED` immediately without waiting for stragglers.
pub fn run_fanout(
    backend: Arc<dyn SearchBackend>,
    mut tasks: Vec<FanoutTask>,
    params: &BackendParams,
    concurrency: usize,
) -> FederationResult<FanoutReport> {
    let started = Instant::now();
    tasks.sort_by(|a, b| a.repo_id.cmp(&b.repo_id).then_with(|| a.root.cmp(&b.root)));
    tasks.dedup_by(|a, b| a.repo_id == b.repo_id);
    params.cancellation.check()?;
    if tasks.is_empty() {
        return Ok(FanoutReport::default());
    }

    let workers = concurrency.clamp(1, tasks.len());
    debug!(repos = tasks.len(), workers, "federated fanout starting");

    let mut slots: Vec<Option<Settled>> = (0..tasks.len()).map(|_| None).collect();
    match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => {
            let (tx, rx) = mpsc::channel::<(usize, Settled)>();
            for (idx, task) in tasks.iter().enumerate() {
                let tx = tx.clone();
                let backend = Arc::clone(&backend);
                let root = task.root.clone();
                let params = params.clone();
                pool.spawn(move || {
                    let settled = run_task(backend.as_ref(), &root, &params);
                    // The receiver is gone once the call was cancelled.
                    let _ = tx.send((idx, settled));
                });
            }
            drop(tx);

            let mut pending = tasks.len();
            while pending > 0 {
                params.cancellation.check()?;
                match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                    Ok((idx, settled)) => {
                        slots[idx] = Some(settled);
                        pending -= 1;
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        Err(err) => {
            warn!("fanout pool unavailable, running sequentially: {err}");
            for (idx, task) in tasks.iter().enumerate() {
                params.cancellation.check()?;
                slots[idx] = Some(run_task(backend.as_ref(), &task.root, params));
            }
        }
    }
    params.cancellation.check()?;

    let mut report = FanoutReport::default();
    for (task, slot) in tasks.into_iter().zip(slots) {
        let settled = slot.unwrap_or_else(|| Settled {
            outcome: Err(FederationError::internal("Repo search task did not settle.")),
            latency: Duration::ZERO,
        });
        let latency_ms = settled.latency.as_millis() as i64;
        match settled.outcome {
            Ok(result) => {
                debug!(repo_id = %task.repo_id, latency_ms, "repo search ok");
                report.diagnostics.push(PerRepoDiagnostic {
                    repo_id: task.repo_id.clone(),
                    repo_alias: task.repo_alias.clone(),
                    status: RepoStatus::Ok,
                    error: None,
                    priority: task.priority,
                });
                report.results.push(PerRepoResult {
                    repo_id: task.repo_id,
                    repo_alias: task.repo_alias,
                    priority: task.priority,
                    result,
                });
            }
            Err(err) if err.kind == ErrorKind::Cancelled => {
                return Err(FederationError::cancelled());
            }
            Err(err) => {
                let status = if err.kind.is_soft() {
                    RepoStatus::MissingIndex
                } else {
                    RepoStatus::Error
                };
                warn!(
                    repo_id = %task.repo_id,
                    code = err.code(),
                    latency_ms,
                    "repo search failed: {}",
                    err.message
                );
                report.diagnostics.push(PerRepoDiagnostic {
                    repo_id: task.repo_id,
                    repo_alias: task.repo_alias,
                    status,
                    error: Some(DiagnosticError {
                        code: err.code().to_string(),
                        message: err.message.clone(),
                    }),
                    priority: task.priority,
                });
                if !err.kind.is_soft() && report.first_hard_error.is_none() {
                    report.first_hard_error = Some(err.clone());
                }
                if report.first_failure.is_none() {
                    report.first_failure = Some(err);
                }
            }
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as i64;
    info!(
        repos = report.diagnostics.len(),
        ok = report.results.len(),
        elapsed_ms = report.elapsed_ms,
        "federated fanout settled"
    );
    Ok(report)
}
