// broker: network-side component of the pipeline.
//
// Resolves which registered device an uplink belongs to, keeps its frame
// counter and forwards it to the owning Handler.

pub mod component;
pub mod controller;

pub use component::Broker;
pub use controller::{ApplicationEntry, DeviceEntry, NetworkController};
