pub mod heartbeats;
pub mod schema;

pub use heartbeats::{HeartbeatRecord, HeartbeatStore, StoreError, format_timestamp};
