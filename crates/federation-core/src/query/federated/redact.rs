//! Scrubbing of absolute filesystem paths from typed response fields.
//!
//! Only fields known to carry paths are touched. Backend payload content
//! (snippets and the like) is opaque and passes through verbatim.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{FederatedResponse, SearchMode};

pub const REDACTED_MARKER: &str = "<redacted>";

static WINDOWS_DRIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]:[\\/]").unwrap());

static UNC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\\\\[^\\]").unwrap());

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\S+").unwrap());

const LEADING_PUNCT: &[char] = &['"', '\'', '`', '(', '[', '{', '<'];
const TRAILING_PUNCT: &[char] = &['"', '\'', '`', ')', ']', '}', '>', ',', '.', ';', ':'];

/// True for POSIX absolute paths, drive-letter paths and UNC shares,
/// regardless of the host platform.
pub fn is_absolute_like(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    trimmed.starts_with('/')
        || WINDOWS_DRIVE_RE.is_match(trimmed)
        || UNC_RE.is_match(trimmed)
        || Path::new(trimmed).is_absolute()
}

pub fn redact_path(value: &str) -> String {
    if is_absolute_like(value) {
        REDACTED_MARKER.to_string()
    } else {
        value.to_string()
    }
}

fn redact_in_place(value: &mut String) {
    if is_absolute_like(value) {
        *value = REDACTED_MARKER.to_string();
    }
}

fn redact_opt(value: &mut Option<String>) {
    if let Some(inner) = value.as_mut() {
        redact_in_place(inner);
    }
}

/// Replace absolute-path tokens inside a coordinator-built message.
///
/// Tokens are whitespace-separated; quoting and trailing punctuation around a
/// path are kept so the sentence still reads.
pub fn redact_embedded_paths(message: &str) -> String {
    TOKEN_RE
        .replace_all(message, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            let head = token.len() - token.trim_start_matches(LEADING_PUNCT).len();
            let body = &token[head..];
            let core = body.trim_end_matches(TRAILING_PUNCT);
            if core.is_empty() || !is_absolute_like(core) {
                return token.to_string();
            }
            format!(
                "{}{}{}",
                &token[..head],
                REDACTED_MARKER,
                &body[core.len()..]
            )
        })
        .into_owned()
}

/// Redact every path-typed field of a federated response in place.
pub fn redact_response(response: &mut FederatedResponse) {
    for mode in SearchMode::ALL {
        let hits = match mode {
            SearchMode::Code => &mut response.code,
            SearchMode::Prose => &mut response.prose,
            SearchMode::ExtractedProse => &mut response.extracted_prose,
            SearchMode::Records => &mut response.records,
        };
        for hit in hits.iter_mut() {
            redact_opt(&mut hit.file);
        }
    }

    for select in &mut response.meta.selection.explicit_selects {
        redact_in_place(select);
    }

    for repos in response.meta.cohorts.selected_repos_by_mode.values_mut() {
        for repo in repos.iter_mut() {
            redact_in_place(&mut repo.root);
            redact_opt(&mut repo.index_dir);
        }
    }

    for diagnostic in &mut response.repos {
        if let Some(error) = diagnostic.error.as_mut() {
            error.message = redact_embedded_paths(&error.message);
        }
    }
}
