// crate: lorawan-stack
//
// Single-process LoRaWAN network: SemTech gateway listener, Router, Broker,
// Handler and an application sink joined by the in-process transport.

pub mod app;
pub mod config;
pub mod local;
pub mod node;

pub use app::ApplicationSink;
pub use config::{ConfigError, StackConfig};
pub use local::{LocalAdapter, LocalSubscriber};
pub use node::{Node, NodeStores};
