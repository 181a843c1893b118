// router: gateway-facing component of the pipeline.
//
// Receives uplinks from gateways (SemTech UDP or in-process), annotates them
// with duty-cycle availability and forwards them to the owning Broker(s).

pub mod component;
pub mod semtech;
pub mod storage;

pub use component::Router;
pub use semtech::{GatewayKeeper, GatewayServer};
pub use storage::{RouterStorage, RoutingEntry};
