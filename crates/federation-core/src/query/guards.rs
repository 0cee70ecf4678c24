//! Shared guardrails for federated request bounds.

pub const MAX_QUERY_LENGTH: usize = 512;

// Federated fanout guards
pub const MAX_FEDERATED_TOP: i64 = 500;
pub const MAX_FEDERATED_PER_REPO_TOP: i64 = 1000;
pub const MAX_FEDERATED_CONCURRENCY: i64 = 32;
pub const DEFAULT_FEDERATED_TOP: i64 = 10;
pub const DEFAULT_FEDERATED_CONCURRENCY: i64 = 4;
pub const DEFAULT_PER_REPO_TOP_CAP: i64 = 50;
pub const DEFAULT_RRF_K: i64 = 60;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

/// Resolve an optional caller value against a fallback and clamp it.
pub fn coerce_limit(value: Option<i64>, fallback: i64, minimum: i64, maximum: i64) -> i64 {
    clamp_int(value.unwrap_or(fallback), minimum, maximum)
}

/// Default per-repo depth: twice the merged top, capped so small merges stay cheap.
pub fn default_per_repo_top(top: i64) -> i64 {
    (top * 2).max(top).min(DEFAULT_PER_REPO_TOP_CAP)
}

pub fn truncate_query(query: &str) -> String {
    let stripped = query.trim();
    if stripped.len() <= MAX_QUERY_LENGTH {
        return stripped.to_string();
    }
    let mut end = MAX_QUERY_LENGTH;
    while !stripped.is_char_boundary(end) {
        end -= 1;
    }
    stripped[..end].to_string()
}
