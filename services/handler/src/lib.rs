// handler: application-facing component of the pipeline.
//
// Holds application session keys, merges the copies of an uplink received
// through several gateways into one application delivery and schedules at
// most one downlink per uplink.

pub mod bundle;
pub mod component;
pub mod queue;
pub mod storage;

pub use bundle::{Bundle, BundleEngine, BundleId, BundleOptions};
pub use component::{Handler, HandlerOptions};
pub use queue::PQueue;
pub use storage::{DevStorage, HandlerDevice};
