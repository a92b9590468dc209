//! Wire-level types for Halo sensor heartbeats.
//!
//! Shared by the ingest service (writer) and anything that reads the
//! persisted table back, so both sides agree on the known field set.

pub mod field;
pub mod message;

pub use field::{SensorField, SensorFields};
pub use message::{Heartbeat, ParseError, parse_message};
