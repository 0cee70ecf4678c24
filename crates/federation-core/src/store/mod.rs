pub mod query_cache;
pub mod schema;
pub mod sqlite_cache;
