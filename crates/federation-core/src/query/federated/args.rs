//! Argument lists forwarded to each per-repo search.

use serde::Serialize;

/// Flags that only mean something to the federation layer and take a value.
const FEDERATION_VALUE_FLAGS: &[&str] = &[
    "--workspace",
    "--select",
    "--tag",
    "--repo-filter",
    "--cohort",
    "--concurrency",
    "--per-repo-top",
    "--merge",
    "--rrf-k",
    "--top",
    "-n",
];

/// Federation-only switches without a value.
const FEDERATION_BOOL_FLAGS: &[&str] = &["--include-disabled", "--allow-unsafe-mix", "--strict"];

/// What a backend receives for one repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerRepoInvocation {
    pub args: Vec<String>,
    /// Structured query. Empty when the raw args already carry it.
    pub query: String,
}

fn flag_name(arg: &str) -> &str {
    match arg.split_once('=') {
        Some((name, _)) if name.starts_with('-') => name,
        _ => arg,
    }
}

/// Strip federation-only flags from a caller's raw argument list and pin the
/// per-repo depth.
pub fn per_repo_args_from_raw(raw_args: &[String], per_repo_top: i64) -> Vec<String> {
    let mut out = Vec::with_capacity(raw_args.len() + 2);
    let mut iter = raw_args.iter();
    while let Some(arg) = iter.next() {
        let name = flag_name(arg);
        if FEDERATION_BOOL_FLAGS.contains(&name) {
            continue;
        }
        if FEDERATION_VALUE_FLAGS.contains(&name) {
            if name.len() == arg.len() {
                iter.next();
            }
            continue;
        }
        out.push(arg.clone());
    }
    out.push("--top".to_string());
    out.push(per_repo_top.to_string());
    out
}

pub fn per_repo_args_from_request(mode: Option<&str>, per_repo_top: i64) -> Vec<String> {
    let mut out = Vec::with_capacity(4);
    if let Some(mode) = mode.map(str::trim).filter(|m| !m.is_empty()) {
        out.push("--mode".to_string());
        out.push(mode.to_string());
    }
    out.push("--top".to_string());
    out.push(per_repo_top.to_string());
    out
}

/// Raw args win when present; the query then travels inside them and is not
/// duplicated into the structured field.
pub fn per_repo_invocation(
    raw_args: Option<&[String]>,
    mode: Option<&str>,
    query: &str,
    per_repo_top: i64,
) -> PerRepoInvocation {
    match raw_args {
        Some(raw) if !raw.is_empty() => PerRepoInvocation {
            args: per_repo_args_from_raw(raw, per_repo_top),
            query: String::new(),
        },
        _ => PerRepoInvocation {
            args: per_repo_args_from_request(mode, per_repo_top),
            query: query.to_string(),
        },
    }
}
