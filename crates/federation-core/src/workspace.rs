//! Workspace collaborators and identity hashing.
//!
//! Loading and validating workspace files, and resolving per-repo index
//! availability, happen outside this crate. The federation layer consumes them
//! through [`WorkspaceLoader`] and [`IndexResolver`] and derives stable
//! identity hashes from what they return.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::{FederationError, FederationResult};
use crate::models::{
    sha256_hex, AvailabilityReason, RepoAvailability, RepoModeAvailability, SearchMode,
    WorkspaceConfig, WorkspaceRepoEntry,
};

/// Loads and validates a workspace file. Called once per request.
pub trait WorkspaceLoader: Send + Sync {
    fn load(&self, workspace_path: &str) -> FederationResult<WorkspaceConfig>;
}

/// Reports per-mode index availability for a repo. Called once per repo per request.
pub trait IndexResolver: Send + Sync {
    fn resolve(&self, repo: &WorkspaceRepoEntry) -> FederationResult<RepoAvailability>;
}

/// Loader serving fixed snapshots keyed by workspace path.
#[derive(Debug, Default, Clone)]
pub struct StaticWorkspaceLoader {
    configs: BTreeMap<String, WorkspaceConfig>,
}

impl StaticWorkspaceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, path: impl Into<String>, config: WorkspaceConfig) -> Self {
        self.configs.insert(normalize_workspace_path(&path.into()), config);
        self
    }
}

impl WorkspaceLoader for StaticWorkspaceLoader {
    fn load(&self, workspace_path: &str) -> FederationResult<WorkspaceConfig> {
        self.configs
            .get(&normalize_workspace_path(workspace_path))
            .cloned()
            .ok_or_else(|| {
                FederationError::invalid_request(format!(
                    "Workspace file not found: {workspace_path}"
                ))
            })
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Canonical POSIX-style form of a workspace path for identity comparisons.
///
/// Resolves symlinks when the path exists; otherwise falls back to a lexical
/// form with trailing separators removed.
pub fn normalize_workspace_path(path: &str) -> String {
    let expanded = expand_tilde(path.trim());
    let resolved = std::fs::canonicalize(&expanded).unwrap_or(expanded);
    let posix = resolved.to_string_lossy().replace('\\', "/");
    let trimmed = posix.trim_end_matches('/');
    if trimmed.is_empty() {
        posix
    } else {
        trimmed.to_string()
    }
}

pub fn same_workspace_path(a: &str, b: &str) -> bool {
    normalize_workspace_path(a) == normalize_workspace_path(b)
}

/// Directory of the workspace file (or the path itself when it is a directory).
pub fn workspace_dir(workspace_path: &str) -> PathBuf {
    let path = Path::new(workspace_path);
    if path.is_dir() {
        return path.to_path_buf();
    }
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Identity hashes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RepoIdentity<'a> {
    repo_id: &'a str,
    root: &'a str,
}

#[derive(Serialize)]
struct RepoSetPayload<'a> {
    v: u32,
    repos: Vec<RepoIdentity<'a>>,
}

/// Identity of the repo set, independent of aliases, tags, and priorities.
pub fn compute_repo_set_id(config: &WorkspaceConfig) -> FederationResult<String> {
    let mut repos: Vec<RepoIdentity<'_>> = config
        .repos
        .iter()
        .map(|r| RepoIdentity {
            repo_id: &r.repo_id,
            root: r.root_trimmed(),
        })
        .collect();
    repos.sort_by(|a, b| a.repo_id.cmp(b.repo_id).then_with(|| a.root.cmp(b.root)));
    let canonical = serde_json::to_string(&RepoSetPayload { v: 1, repos })?;
    Ok(format!("ws1-{}", sha256_hex(&canonical)))
}

#[derive(Serialize)]
struct RepoConfigEntry<'a> {
    root: &'a str,
    alias: Option<&'a str>,
    enabled: bool,
    priority: i64,
    tags: Vec<&'a str>,
}

#[derive(Serialize)]
struct ConfigPayload<'a> {
    schema_version: i64,
    name: &'a str,
    cache_root: Option<&'a str>,
    repos: Vec<RepoConfigEntry<'a>>,
}

/// Hash of every workspace field that can change a federated answer.
pub fn compute_config_hash(config: &WorkspaceConfig) -> FederationResult<String> {
    let mut repos: Vec<RepoConfigEntry<'_>> = config
        .repos
        .iter()
        .map(|r| {
            let mut tags: Vec<&str> = r.tags.iter().map(String::as_str).collect();
            tags.sort_unstable();
            RepoConfigEntry {
                root: r.root_trimmed(),
                alias: r.alias.as_deref(),
                enabled: r.enabled,
                priority: r.priority,
                tags,
            }
        })
        .collect();
    repos.sort_by(|a, b| a.root.cmp(b.root));
    let canonical = serde_json::to_string(&ConfigPayload {
        schema_version: config.schema_version,
        name: config.name.trim(),
        cache_root: config.cache_root.as_deref(),
        repos,
    })?;
    Ok(format!("wsc1-{}", sha256_hex(&canonical)))
}

/// Hash of the availability snapshot resolved for this request.
pub fn compute_manifest_hash(
    availability: &BTreeMap<String, RepoAvailability>,
) -> FederationResult<String> {
    let canonical = serde_json::to_string(availability)?;
    Ok(format!("wm1-{}", sha256_hex(&canonical)))
}

/// Resolve availability for every repo, keyed by repo id.
///
/// A resolver failure for one repo marks all of its modes unavailable rather
/// than failing the request; the repo then simply never joins a cohort.
pub fn resolve_availability(
    resolver: &dyn IndexResolver,
    config: &WorkspaceConfig,
) -> BTreeMap<String, RepoAvailability> {
    let mut out = BTreeMap::new();
    for repo in &config.repos {
        let availability = match resolver.resolve(repo) {
            Ok(avail) => avail,
            Err(err) => {
                tracing::warn!(repo_id = %repo.repo_id, "index resolution failed: {err}");
                SearchMode::ALL
                    .iter()
                    .map(|mode| {
                        (
                            *mode,
                            RepoModeAvailability::missing(AvailabilityReason::MissingIndexDir),
                        )
                    })
                    .collect()
            }
        };
        out.insert(repo.repo_id.clone(), availability);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn config() -> WorkspaceConfig {
        WorkspaceConfig::new(
            "ws",
            vec![
                WorkspaceRepoEntry::new("/r/a").with_repo_id("a").with_priority(1),
                WorkspaceRepoEntry::new("/r/b").with_repo_id("b").with_tags(["x"]),
            ],
        )
    }

    #[test]
    fn repo_set_id_ignores_order_and_metadata() {
        let a = config();
        let mut b = config();
        b.repos.reverse();
        b.repos[0].priority = 50;
        assert_eq!(compute_repo_set_id(&a).unwrap(), compute_repo_set_id(&b).unwrap());
        assert!(compute_repo_set_id(&a).unwrap().starts_with("ws1-"));
    }

    #[test]
    fn config_hash_tracks_metadata() {
        let a = config();
        let mut b = config();
        b.repos[0].priority = 50;
        assert_ne!(compute_config_hash(&a).unwrap(), compute_config_hash(&b).unwrap());
        let mut c = config();
        c.name = "renamed".to_string();
        assert_ne!(compute_config_hash(&a).unwrap(), compute_config_hash(&c).unwrap());
        let mut d = config();
        d.repos.reverse();
        assert_eq!(compute_config_hash(&a).unwrap(), compute_config_hash(&d).unwrap());
    }

    #[test]
    fn workspace_paths_compare_lexically_when_missing() {
        assert!(same_workspace_path("/no/such/ws/", "/no/such/ws"));
        assert!(!same_workspace_path("/no/such/ws", "/no/such/other"));
    }

    #[test]
    fn workspace_paths_resolve_existing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        let dotted = format!("{path}/./");
        assert!(same_workspace_path(&path, &dotted));
    }

    struct FlakyResolver;

    impl IndexResolver for FlakyResolver {
        fn resolve(&self, repo: &WorkspaceRepoEntry) -> FederationResult<RepoAvailability> {
            if repo.repo_id == "b" {
                return Err(FederationError::internal("disk on fire"));
            }
            Ok([(SearchMode::Code, RepoModeAvailability::present(Some("k")))]
                .into_iter()
                .collect())
        }
    }

    #[test]
    fn resolver_failure_marks_repo_unavailable() {
        let availability = resolve_availability(&FlakyResolver, &config());
        assert!(availability["a"][&SearchMode::Code].present);
        assert!(availability["b"].values().all(|m| !m.present));
        let hash = compute_manifest_hash(&availability).unwrap();
        assert!(hash.starts_with("wm1-"));
    }

    #[test]
    fn static_loader_reports_unknown_workspace() {
        let loader = StaticWorkspaceLoader::new().with_workspace("/ws/one", config());
        assert!(loader.load("/ws/one/").is_ok());
        let err = loader.load("/ws/two").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }
}
