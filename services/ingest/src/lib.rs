// ingest: Library entry point.
// Exposes modules for integration testing.

pub mod acceptor;
pub mod allowlist;
pub mod config;
pub mod handler;
pub mod query;
pub mod storage;
