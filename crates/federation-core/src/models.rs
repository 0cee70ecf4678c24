//! Shared typed models used across selection, fanout, merge, and response layers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::query::federated::cohorts::CohortSelection;

// ---------------------------------------------------------------------------
// Contract constants
// ---------------------------------------------------------------------------

/// Backend label stamped on every federated payload.
pub const FEDERATED_BACKEND: &str = "federated";

/// Workspace config schema understood by the federation layer.
pub const WORKSPACE_SCHEMA_VERSION: i64 = 1;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Derive a short repo identifier (first 16 hex chars of SHA-256) from a canonical path.
pub fn repo_id_from_path(canonical_path: &str) -> String {
    let posix = canonical_path.replace('\\', "/");
    let mut hasher = Sha256::new();
    hasher.update(posix.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Hex SHA-256 of an arbitrary string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn default_true() -> bool {
    true
}

fn default_schema_version() -> i64 {
    WORKSPACE_SCHEMA_VERSION
}

/// Accept hit ids emitted either as strings or as numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "hit id must be a string or number, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// 1. SearchMode
// ---------------------------------------------------------------------------

/// Index flavour a repo can be searched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    Code,
    Prose,
    ExtractedProse,
    Records,
}

impl SearchMode {
    pub const ALL: [SearchMode; 4] = [
        SearchMode::Code,
        SearchMode::Prose,
        SearchMode::ExtractedProse,
        SearchMode::Records,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Code => "code",
            SearchMode::Prose => "prose",
            SearchMode::ExtractedProse => "extracted-prose",
            SearchMode::Records => "records",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "code" => Some(SearchMode::Code),
            "prose" => Some(SearchMode::Prose),
            "extracted-prose" => Some(SearchMode::ExtractedProse),
            "records" => Some(SearchMode::Records),
            _ => None,
        }
    }

    /// Expand a requested `search.mode` value into the modes that are searched.
    pub fn resolve_requested(mode: Option<&str>) -> Vec<SearchMode> {
        let default = vec![
            SearchMode::Code,
            SearchMode::Prose,
            SearchMode::ExtractedProse,
        ];
        let normalized = mode.map(|m| m.trim().to_ascii_lowercase()).unwrap_or_default();
        match normalized.as_str() {
            "" | "default" | "both" => default,
            "all" => SearchMode::ALL.to_vec(),
            "code" => vec![SearchMode::Code],
            "prose" => vec![SearchMode::Prose, SearchMode::ExtractedProse],
            "extracted-prose" => vec![SearchMode::ExtractedProse],
            "records" => vec![SearchMode::Records],
            _ => default,
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 2. Workspace entries
// ---------------------------------------------------------------------------

/// One repository declared by a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRepoEntry {
    #[serde(default)]
    pub repo_id: String,
    pub root: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl WorkspaceRepoEntry {
    /// Entry rooted at a canonical path, with its id derived from that path.
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            repo_id: repo_id_from_path(&root),
            root,
            alias: None,
            priority: 0,
            tags: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_repo_id(mut self, repo_id: impl Into<String>) -> Self {
        self.repo_id = repo_id.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Root with trailing separators removed, used for identity comparisons.
    pub fn root_trimmed(&self) -> &str {
        let trimmed = self.root.trim_end_matches(['/', '\\']);
        if trimmed.is_empty() {
            &self.root
        } else {
            trimmed
        }
    }
}

/// A pre-validated workspace snapshot as produced by the external loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: i64,
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub name: String,
    /// Path of the workspace file this snapshot was loaded from.
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub repos: Vec<WorkspaceRepoEntry>,
}

impl WorkspaceConfig {
    pub fn new(name: impl Into<String>, repos: Vec<WorkspaceRepoEntry>) -> Self {
        Self {
            schema_version: WORKSPACE_SCHEMA_VERSION,
            cache_root: None,
            name: name.into(),
            workspace_path: None,
            repos,
        }
    }

    pub fn with_workspace_path(mut self, path: impl Into<String>) -> Self {
        self.workspace_path = Some(path.into());
        self
    }

    pub fn with_cache_root(mut self, path: impl Into<String>) -> Self {
        self.cache_root = Some(path.into());
        self
    }

    /// Fill missing repo ids from roots and trim aliases/tags.
    pub fn normalized(mut self) -> Self {
        for repo in &mut self.repos {
            if repo.repo_id.trim().is_empty() {
                repo.repo_id = repo_id_from_path(repo.root_trimmed());
            }
            repo.alias = repo
                .alias
                .take()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
            repo.tags = repo
                .tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        self
    }
}

// ---------------------------------------------------------------------------
// 3. Index availability
// ---------------------------------------------------------------------------

/// Why a repo's index for one mode is or is not usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvailabilityReason {
    Present,
    InvalidPointer,
    MissingIndexDir,
    MissingRequiredArtifacts,
    CompatKeyMissing,
}

/// Per repo, per mode availability as reported by the index resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoModeAvailability {
    #[serde(default)]
    pub present: bool,
    #[serde(default)]
    pub cohort_key: Option<String>,
    #[serde(default)]
    pub compatibility_key: Option<String>,
    #[serde(default)]
    pub index_dir: Option<String>,
    #[serde(default = "default_availability_reason")]
    pub availability_reason: AvailabilityReason,
}

fn default_availability_reason() -> AvailabilityReason {
    AvailabilityReason::MissingIndexDir
}

impl RepoModeAvailability {
    pub fn present(cohort_key: Option<&str>) -> Self {
        Self {
            present: true,
            cohort_key: cohort_key.map(str::to_string),
            compatibility_key: None,
            index_dir: None,
            availability_reason: AvailabilityReason::Present,
        }
    }

    pub fn missing(reason: AvailabilityReason) -> Self {
        Self {
            present: false,
            cohort_key: None,
            compatibility_key: None,
            index_dir: None,
            availability_reason: reason,
        }
    }

    pub fn with_compatibility_key(mut self, key: impl Into<String>) -> Self {
        self.compatibility_key = Some(key.into());
        self
    }

    pub fn with_index_dir(mut self, dir: impl Into<String>) -> Self {
        self.index_dir = Some(dir.into());
        self
    }

    /// Bucket key: cohort key, else compatibility key, else none.
    pub fn effective_key(&self) -> Option<&str> {
        self.cohort_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                self.compatibility_key
                    .as_deref()
                    .filter(|k| !k.trim().is_empty())
            })
    }
}

/// All modes of one repo.
pub type RepoAvailability = BTreeMap<SearchMode, RepoModeAvailability>;

/// A candidate repo paired with its freshly resolved availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCandidate {
    pub repo: WorkspaceRepoEntry,
    pub indexes: RepoAvailability,
}

/// Repo reference carried in cohort selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoRef {
    pub repo_id: String,
    pub alias: Option<String>,
    pub priority: i64,
    pub root: String,
    pub index_dir: Option<String>,
    pub effective_key: Option<String>,
}

// ---------------------------------------------------------------------------
// 4. Backend hits
// ---------------------------------------------------------------------------

/// One ranked hit as returned by a per-repo backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHit {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub score: f64,
    /// Remaining backend fields (snippets, line ranges, ...), passed through untouched.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RawHit {
    pub fn new(id: impl Into<String>, file: Option<&str>, score: f64) -> Self {
        Self {
            id: id.into(),
            file: file.map(str::to_string),
            score,
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }
}

/// Full per-repo backend result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSearchResult {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub code: Vec<RawHit>,
    #[serde(default)]
    pub prose: Vec<RawHit>,
    #[serde(default)]
    pub extracted_prose: Vec<RawHit>,
    #[serde(default)]
    pub records: Vec<RawHit>,
}

impl RepoSearchResult {
    pub fn hits(&self, mode: SearchMode) -> &[RawHit] {
        match mode {
            SearchMode::Code => &self.code,
            SearchMode::Prose => &self.prose,
            SearchMode::ExtractedProse => &self.extracted_prose,
            SearchMode::Records => &self.records,
        }
    }
}

/// A successful per-repo result tagged with its repo identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PerRepoResult {
    pub repo_id: String,
    pub repo_alias: Option<String>,
    pub priority: i64,
    pub result: RepoSearchResult,
}

/// A fused hit in the federated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedHit {
    pub id: String,
    pub global_id: String,
    pub repo_id: String,
    pub repo_alias: Option<String>,
    pub file: Option<String>,
    pub score: f64,
    pub payload: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// 5. Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Ok,
    MissingIndex,
    Error,
}

impl RepoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoStatus::Ok => "ok",
            RepoStatus::MissingIndex => "missing_index",
            RepoStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticError {
    pub code: String,
    pub message: String,
}

/// Status of one attempted repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerRepoDiagnostic {
    pub repo_id: String,
    pub repo_alias: Option<String>,
    pub status: RepoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DiagnosticError>,
    pub priority: i64,
}

// ---------------------------------------------------------------------------
// 6. Federated response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMeta {
    pub name: String,
    pub workspace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedRepoSummary {
    pub repo_id: String,
    pub alias: Option<String>,
    pub priority: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionMeta {
    pub selected_repo_ids: Vec<String>,
    pub selected_repos: Vec<SelectedRepoSummary>,
    pub explicit_selects: Vec<String>,
    pub tags: Vec<String>,
    pub repo_filter: Vec<String>,
    pub include_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsMeta {
    pub top: i64,
    pub per_repo_top: i64,
    pub concurrency: i64,
    pub merge: String,
    pub rrf_k: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub hit: bool,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub repo_set_id: String,
    pub manifest_hash: String,
    pub workspace: WorkspaceMeta,
    pub selection: SelectionMeta,
    pub cohorts: CohortSelection,
    pub limits: LimitsMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheMeta>,
}

/// Final federated payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedResponse {
    pub ok: bool,
    pub backend: String,
    pub code: Vec<MergedHit>,
    pub prose: Vec<MergedHit>,
    pub extracted_prose: Vec<MergedHit>,
    pub records: Vec<MergedHit>,
    pub repos: Vec<PerRepoDiagnostic>,
    pub warnings: Vec<String>,
    pub meta: ResponseMeta,
}

impl FederatedResponse {
    pub fn hits(&self, mode: SearchMode) -> &[MergedHit] {
        match mode {
            SearchMode::Code => &self.code,
            SearchMode::Prose => &self.prose,
            SearchMode::ExtractedProse => &self.extracted_prose,
            SearchMode::Records => &self.records,
        }
    }

    pub fn total_hits(&self) -> usize {
        SearchMode::ALL.iter().map(|m| self.hits(*m).len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repo_id_is_stable_and_short() {
        let a = repo_id_from_path("/work/alpha");
        assert_eq!(a.len(), 16);
        assert_eq!(a, repo_id_from_path("/work/alpha"));
        assert_eq!(a, repo_id_from_path("\\work\\alpha"));
        assert_ne!(a, repo_id_from_path("/work/beta"));
    }

    #[test]
    fn resolve_requested_modes() {
        assert_eq!(
            SearchMode::resolve_requested(None),
            vec![SearchMode::Code, SearchMode::Prose, SearchMode::ExtractedProse]
        );
        assert_eq!(SearchMode::resolve_requested(Some("all")).len(), 4);
        assert_eq!(
            SearchMode::resolve_requested(Some("prose")),
            vec![SearchMode::Prose, SearchMode::ExtractedProse]
        );
        assert_eq!(
            SearchMode::resolve_requested(Some(" Records ")),
            vec![SearchMode::Records]
        );
        assert_eq!(SearchMode::resolve_requested(Some("bogus")).len(), 3);
    }

    #[test]
    fn effective_key_prefers_cohort_key() {
        let avail = RepoModeAvailability::present(Some("c1")).with_compatibility_key("k1");
        assert_eq!(avail.effective_key(), Some("c1"));
        let avail = RepoModeAvailability::present(None).with_compatibility_key("k1");
        assert_eq!(avail.effective_key(), Some("k1"));
        let avail = RepoModeAvailability::present(Some("  "));
        assert_eq!(avail.effective_key(), None);
    }

    #[test]
    fn raw_hit_keeps_unknown_fields_in_payload() {
        let hit: RawHit = serde_json::from_value(json!({
            "id": 7,
            "file": "src/lib.rs",
            "score": 1.5,
            "snippet": "fn main() {}",
        }))
        .unwrap();
        assert_eq!(hit.id, "7");
        assert_eq!(hit.file.as_deref(), Some("src/lib.rs"));
        assert_eq!(hit.payload.get("snippet"), Some(&json!("fn main() {}")));
    }

    #[test]
    fn workspace_normalization_fills_ids() {
        let config: WorkspaceConfig = serde_json::from_value(json!({
            "name": "ws",
            "repos": [{ "root": "/r/a/", "alias": "  ", "tags": [" x ", ""] }]
        }))
        .unwrap();
        let config = config.normalized();
        let repo = &config.repos[0];
        assert_eq!(repo.repo_id, repo_id_from_path("/r/a"));
        assert_eq!(repo.alias, None);
        assert_eq!(repo.tags, vec!["x".to_string()]);
        assert!(repo.enabled);
    }

    #[test]
    fn mode_serializes_kebab_case() {
        let value = serde_json::to_value(SearchMode::ExtractedProse).unwrap();
        assert_eq!(value, json!("extracted-prose"));
    }
}
