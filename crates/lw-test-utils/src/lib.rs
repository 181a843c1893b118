// lw-test-utils: shared test doubles for the pipeline components.
//
// Provides a recording AckNacker, a scripted Adapter, a recording
// Subscriber, frame/metadata fixtures and a store whose writes can be made
// to fail.

pub mod faults;
pub mod fixtures;
pub mod mocks;

pub use faults::FaultyStore;
pub use fixtures::{DeviceKeys, eu_metadata, uplink_frame};
pub use mocks::{AckOutcome, MockAdapter, MockSubscriber, RecordingAckNacker, SentPacket};
