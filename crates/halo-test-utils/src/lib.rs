// halo-test-utils: Shared test utilities for the heartbeat ingest service.
//
// Provides a mock sensor TCP client and a heartbeat line builder for
// integration tests.

pub mod mock_sensor;

pub use mock_sensor::{MockSensor, heartbeat_line};
