pub mod args;
pub mod cache_key;
pub mod cohorts;
pub mod coordinator;
pub mod executor;
pub mod merge;
pub mod planner;
pub mod redact;
pub mod selection;
