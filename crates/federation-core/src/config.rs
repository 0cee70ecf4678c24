//! Coordinator configuration with environment overrides.

use serde::Deserialize;

use crate::query::guards::{
    clamp_int, DEFAULT_FEDERATED_CONCURRENCY, DEFAULT_FEDERATED_TOP, DEFAULT_RRF_K,
    MAX_FEDERATED_CONCURRENCY, MAX_FEDERATED_TOP,
};

/// Longest TTL any cache honors: ten years.
pub const MAX_CACHE_TTL_SECONDS: f64 = 10.0 * 365.0 * 24.0 * 60.0 * 60.0;

const MIN_CACHE_TTL_SECONDS: f64 = 0.1;

/// Response cache bounds. Entries never outlive `ttl_seconds` and the cache
/// never holds more than `max_entries` entries or `max_bytes` of payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CachePolicy {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_seconds: f64,
    pub max_bytes: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 200,
            ttl_seconds: 30.0 * 24.0 * 60.0 * 60.0,
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl CachePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// `ttl_seconds` bounded to `[0.1, MAX_CACHE_TTL_SECONDS]`. NaN falls back
    /// to the default TTL and positive infinity to the maximum.
    pub fn effective_ttl_seconds(&self) -> f64 {
        if self.ttl_seconds.is_nan() {
            return Self::default().ttl_seconds;
        }
        self.ttl_seconds
            .clamp(MIN_CACHE_TTL_SECONDS, MAX_CACHE_TTL_SECONDS)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorOptions {
    pub default_top: i64,
    pub default_concurrency: i64,
    pub rrf_k: i64,
    pub cache: CachePolicy,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            default_top: DEFAULT_FEDERATED_TOP,
            default_concurrency: DEFAULT_FEDERATED_CONCURRENCY,
            rrf_k: DEFAULT_RRF_K,
            cache: CachePolicy::default(),
        }
    }
}

impl CoordinatorOptions {
    /// Defaults overlaid with `FEDERATION_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source. Unparseable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_i64(lookup("FEDERATION_TOP")) {
            self.default_top = clamp_int(v, 0, MAX_FEDERATED_TOP);
        }
        if let Some(v) = parse_i64(lookup("FEDERATION_CONCURRENCY")) {
            self.default_concurrency = clamp_int(v, 1, MAX_FEDERATED_CONCURRENCY);
        }
        if let Some(v) = parse_i64(lookup("FEDERATION_RRF_K")) {
            self.rrf_k = v.max(1);
        }
        if let Some(v) = parse_i64(lookup("FEDERATION_CACHE_MAX_ENTRIES")) {
            self.cache.max_entries = v.max(1) as usize;
        }
        if let Some(v) = lookup("FEDERATION_CACHE_TTL_SECONDS")
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
        {
            self.cache.ttl_seconds = v.clamp(MIN_CACHE_TTL_SECONDS, MAX_CACHE_TTL_SECONDS);
        }
        if let Some(val) = lookup("FEDERATION_CACHE") {
            let v = val.trim().to_lowercase();
            self.cache.enabled = !matches!(v.as_str(), "0" | "false" | "no" | "off");
        }
        self
    }
}

fn parse_i64(value: Option<String>) -> Option<i64> {
    value.and_then(|s| s.trim().parse::<i64>().ok())
}
