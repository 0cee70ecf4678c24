//! Federation core: one search fanned out across every repo of a workspace.
//!
//! The coordinator picks a compatible index cohort per mode, queries each
//! selected repo through a host-supplied backend, fuses the per-repo rankings
//! with reciprocal rank fusion, and memoizes settled responses. It is compiled
//! as a plain Rust library and, with the `python` feature, as the
//! `_federation_core` extension module.

pub mod config;
pub mod errors;
pub mod models;
pub mod query;
pub mod store;
pub mod workspace;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod test_support;

pub use config::{CachePolicy, CoordinatorOptions};
pub use errors::{ErrorKind, FederationError, FederationResult};
pub use models::{FederatedResponse, SearchMode, WorkspaceConfig, WorkspaceRepoEntry};
pub use query::federated::coordinator::{FederatedCoordinator, RequestContext};
pub use query::federated::executor::{BackendParams, CancellationToken, SearchBackend};
pub use query::federated::planner::FederatedSearchRequest;
pub use store::query_cache::{MemoryQueryCache, QueryCache};
pub use store::sqlite_cache::SqliteQueryCache;
pub use workspace::{IndexResolver, StaticWorkspaceLoader, WorkspaceLoader};
