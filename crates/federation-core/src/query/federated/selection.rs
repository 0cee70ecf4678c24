//! Repo selection and the workspace-config trust boundary.
//!
//! `select` directives arrive in several equivalent shapes: a bare token, a
//! token list, an object with `repos`/`select`/`tag`/`repo-filter`/
//! `includeDisabled`, or the same fields spread onto the request itself. All
//! of them normalize into one [`SelectionDirectives`], which is what drives
//! both repo filtering and the cache key.

use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{FederationError, FederationResult};
use crate::models::{SelectedRepoSummary, SelectionMeta, WorkspaceConfig, WorkspaceRepoEntry};
use crate::query::federated::redact::redact_path;
use crate::workspace::{same_workspace_path, WorkspaceLoader};

pub const WARN_EMPTY_SELECTION: &str = "WARN_FEDERATED_EMPTY_SELECTION";

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn values(&self) -> Vec<String> {
        match self {
            StringOrList::One(v) => vec![v.clone()],
            StringOrList::Many(vs) => vs.clone(),
        }
    }
}

/// Object form of `select`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectObject {
    #[serde(default)]
    pub repos: Option<StringOrList>,
    #[serde(default)]
    pub select: Option<StringOrList>,
    #[serde(default, alias = "tags")]
    pub tag: Option<StringOrList>,
    #[serde(default, rename = "repo-filter", alias = "repoFilter")]
    pub repo_filter: Option<StringOrList>,
    #[serde(default)]
    pub include_disabled: Option<bool>,
}

/// Any accepted `select` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectInput {
    Tokens(StringOrList),
    Object(SelectObject),
}

/// Selection fields spread directly onto a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadSelection {
    #[serde(default, alias = "tags")]
    pub tag: Option<StringOrList>,
    #[serde(default, rename = "repo-filter", alias = "repoFilter")]
    pub repo_filter: Option<StringOrList>,
    #[serde(default)]
    pub include_disabled: Option<bool>,
}

fn normalize_list<I: IntoIterator<Item = String>>(values: I) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Canonical selection: every list trimmed, deduplicated, and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionDirectives {
    pub explicit_selects: Vec<String>,
    pub tags: Vec<String>,
    pub repo_filter: Vec<String>,
    pub include_disabled: bool,
}

impl SelectionDirectives {
    pub fn normalize(select: Option<&SelectInput>, spread: &SpreadSelection) -> Self {
        let mut explicit = Vec::new();
        let mut tags = Vec::new();
        let mut repo_filter = Vec::new();
        let mut include_disabled = spread.include_disabled == Some(true);

        match select {
            Some(SelectInput::Tokens(tokens)) => explicit.extend(tokens.values()),
            Some(SelectInput::Object(obj)) => {
                for list in [&obj.repos, &obj.select].into_iter().flatten() {
                    explicit.extend(list.values());
                }
                if let Some(list) = &obj.tag {
                    tags.extend(list.values());
                }
                if let Some(list) = &obj.repo_filter {
                    repo_filter.extend(list.values());
                }
                include_disabled |= obj.include_disabled == Some(true);
            }
            None => {}
        }
        if let Some(list) = &spread.tag {
            tags.extend(list.values());
        }
        if let Some(list) = &spread.repo_filter {
            repo_filter.extend(list.values());
        }

        Self {
            explicit_selects: normalize_list(explicit),
            tags: normalize_list(tags.into_iter().map(|t| t.to_lowercase())),
            repo_filter: normalize_list(repo_filter),
            include_disabled,
        }
    }
}

// ---------------------------------------------------------------------------
// Trust boundary
// ---------------------------------------------------------------------------

/// Pick the workspace snapshot for a request.
///
/// A caller-supplied snapshot is only used when the caller vouches for it
/// (`trusted`) and it was loaded from the very workspace path the request
/// names. Under the trusted flag any mismatch is rejected outright rather than
/// silently reloading.
pub fn resolve_workspace_config(
    workspace_path: &str,
    supplied: Option<&WorkspaceConfig>,
    trusted: bool,
    loader: Option<&dyn WorkspaceLoader>,
) -> FederationResult<WorkspaceConfig> {
    let workspace_path = workspace_path.trim();
    if let (true, Some(config)) = (trusted, supplied) {
        let declared = config.workspace_path.as_deref().map(str::trim).unwrap_or("");
        if workspace_path.is_empty() || declared.is_empty() {
            return Err(FederationError::invalid_request(
                "Trusted workspace configuration requires both workspacePath and its declared source path.",
            ));
        }
        if !same_workspace_path(workspace_path, declared) {
            return Err(FederationError::invalid_request(
                "workspacePath does not match the provided workspace configuration.",
            ));
        }
        return Ok(config.clone().normalized());
    }

    if workspace_path.is_empty() {
        return Err(FederationError::invalid_request(
            "Federated search requires workspacePath.",
        ));
    }
    if supplied.is_some() {
        debug!("ignoring untrusted workspace configuration; loading from disk");
    }
    let loader = loader.ok_or_else(|| {
        FederationError::invalid_request("No workspace loader is configured for untrusted requests.")
    })?;
    Ok(loader.load(workspace_path)?.normalized())
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Outcome of applying directives to a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSelection {
    /// Selected repos, sorted by repo id.
    pub repos: Vec<WorkspaceRepoEntry>,
    pub meta: SelectionMeta,
    pub warnings: Vec<String>,
}

fn compile_filter(pattern: &str) -> FederationResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .build()
        .map_err(|e| FederationError::invalid_request(format!("Invalid repo filter \"{pattern}\": {e}")))
}

fn trim_separators(value: &str) -> &str {
    let trimmed = value.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        value
    } else {
        trimmed
    }
}

fn matches_token(repo: &WorkspaceRepoEntry, token: &str) -> bool {
    let lowered = token.to_lowercase();
    repo.alias.as_deref().map(str::to_lowercase).as_deref() == Some(lowered.as_str())
        || repo.repo_id.eq_ignore_ascii_case(token)
        || repo.root_trimmed() == trim_separators(token)
}

/// Apply selection directives to the workspace repo list.
pub fn select_workspace_repos(
    config: &WorkspaceConfig,
    directives: &SelectionDirectives,
) -> FederationResult<RepoSelection> {
    for token in &directives.explicit_selects {
        if !config.repos.iter().any(|repo| matches_token(repo, token)) {
            return Err(FederationError::invalid_request(format!(
                "Selected repo \"{}\" is not part of the workspace.",
                redact_path(token)
            )));
        }
    }
    let filters = directives
        .repo_filter
        .iter()
        .map(|p| compile_filter(p))
        .collect::<FederationResult<Vec<_>>>()?;

    let mut repos: Vec<WorkspaceRepoEntry> = config
        .repos
        .iter()
        .filter(|repo| repo.enabled || directives.include_disabled)
        .filter(|repo| {
            directives.explicit_selects.is_empty()
                || directives
                    .explicit_selects
                    .iter()
                    .any(|token| matches_token(repo, token))
        })
        .filter(|repo| {
            directives.tags.is_empty()
                || repo
                    .tags
                    .iter()
                    .any(|tag| directives.tags.contains(&tag.to_lowercase()))
        })
        .filter(|repo| {
            filters.is_empty()
                || filters.iter().any(|re| {
                    repo.alias.as_deref().is_some_and(|a| re.is_match(a))
                        || re.is_match(&repo.repo_id)
                        || re.is_match(repo.root_trimmed())
                })
        })
        .cloned()
        .collect();
    repos.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));

    let mut warnings = Vec::new();
    if repos.is_empty() {
        warnings.push(WARN_EMPTY_SELECTION.to_string());
    }

    let meta = SelectionMeta {
        selected_repo_ids: repos.iter().map(|r| r.repo_id.clone()).collect(),
        selected_repos: repos
            .iter()
            .map(|r| SelectedRepoSummary {
                repo_id: r.repo_id.clone(),
                alias: r.alias.clone(),
                priority: r.priority,
                enabled: r.enabled,
            })
            .collect(),
        explicit_selects: directives.explicit_selects.clone(),
        tags: directives.tags.clone(),
        repo_filter: directives.repo_filter.clone(),
        include_disabled: directives.include_disabled,
    };
    Ok(RepoSelection {
        repos,
        meta,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::workspace::StaticWorkspaceLoader;
    use serde_json::json;

    fn workspace() -> WorkspaceConfig {
        WorkspaceConfig::new(
            "ws",
            vec![
                WorkspaceRepoEntry::new("/src/api")
                    .with_repo_id("api")
                    .with_alias("Api")
                    .with_tags(["backend", "core"]),
                WorkspaceRepoEntry::new("/src/web")
                    .with_repo_id("web")
                    .with_alias("web")
                    .with_tags(["frontend"]),
                WorkspaceRepoEntry::new("/src/legacy")
                    .with_repo_id("legacy")
                    .with_alias("legacy-api")
                    .with_tags(["backend"])
                    .disabled(),
            ],
        )
        .with_workspace_path("/ws/.workspace.jsonc")
    }

    fn ids(selection: &RepoSelection) -> Vec<&str> {
        selection.repos.iter().map(|r| r.repo_id.as_str()).collect()
    }

    fn directives(select: serde_json::Value, spread: serde_json::Value) -> SelectionDirectives {
        let select: Option<SelectInput> = serde_json::from_value(select).unwrap();
        let spread: SpreadSelection = serde_json::from_value(spread).unwrap();
        SelectionDirectives::normalize(select.as_ref(), &spread)
    }

    #[test]
    fn disabled_repos_need_include_disabled() {
        let out = select_workspace_repos(&workspace(), &SelectionDirectives::default()).unwrap();
        assert_eq!(ids(&out), vec!["api", "web"]);
        let d = directives(json!({"includeDisabled": true}), json!({}));
        let out = select_workspace_repos(&workspace(), &d).unwrap();
        assert_eq!(ids(&out), vec!["api", "legacy", "web"]);
    }

    #[test]
    fn explicit_selects_match_alias_id_and_root() {
        let d = directives(json!(["api", "/src/web/"]), json!({}));
        let out = select_workspace_repos(&workspace(), &d).unwrap();
        assert_eq!(ids(&out), vec!["api", "web"]);
        assert_eq!(out.meta.explicit_selects, vec!["/src/web/", "api"]);
    }

    #[test]
    fn unknown_explicit_select_is_rejected() {
        let d = directives(json!("nowhere"), json!({}));
        let err = select_workspace_repos(&workspace(), &d).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn tag_and_repo_filter_intersect() {
        let d = directives(
            json!({"tag": ["BACKEND"], "repo-filter": "*api*", "includeDisabled": true}),
            json!({}),
        );
        let out = select_workspace_repos(&workspace(), &d).unwrap();
        assert_eq!(ids(&out), vec!["api", "legacy"]);

        let d = directives(json!({"tags": "frontend", "repoFilter": ["api"]}), json!({}));
        let out = select_workspace_repos(&workspace(), &d).unwrap();
        assert!(out.repos.is_empty());
        assert_eq!(out.warnings, vec![WARN_EMPTY_SELECTION.to_string()]);
    }

    #[test]
    fn object_and_spread_forms_normalize_identically() {
        let object_only = directives(
            json!({"tag": ["core", "backend"], "repo-filter": ["a*"], "includeDisabled": true}),
            json!({}),
        );
        let spread = directives(
            json!(null),
            json!({"tags": ["backend", "core", "core"], "repoFilter": "a*", "includeDisabled": true}),
        );
        assert_eq!(object_only, spread);
    }

    #[test]
    fn empty_object_select_has_no_explicit_tokens() {
        let d = directives(json!({"includeDisabled": false}), json!({}));
        assert!(d.explicit_selects.is_empty());
    }

    #[test]
    fn trusted_config_must_match_workspace_path() {
        let config = workspace();
        let resolved =
            resolve_workspace_config("/ws/.workspace.jsonc", Some(&config), true, None).unwrap();
        assert_eq!(resolved.name, "ws");

        let err = resolve_workspace_config("/other/.workspace.jsonc", Some(&config), true, None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let mut undeclared = workspace();
        undeclared.workspace_path = None;
        let err = resolve_workspace_config("/ws/.workspace.jsonc", Some(&undeclared), true, None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn untrusted_config_is_reloaded() {
        let mut tampered = workspace();
        tampered.repos.clear();
        let loader = StaticWorkspaceLoader::new().with_workspace("/ws/.workspace.jsonc", workspace());
        let resolved = resolve_workspace_config(
            "/ws/.workspace.jsonc",
            Some(&tampered),
            false,
            Some(&loader),
        )
        .unwrap();
        assert_eq!(resolved.repos.len(), 3);

        let err = resolve_workspace_config("/ws/.workspace.jsonc", Some(&tampered), false, None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        let err = resolve_workspace_config("  ", None, false, Some(&loader)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }
}
