//! Wiring of a single-process stack: Router → Broker → Handler → application.
//!
//! Component names on the local transport:
//!
//! | Hop                  | Recipient                      |
//! |----------------------|--------------------------------|
//! | Router → Broker      | `broker`                       |
//! | Broker → Handler     | `handler`                      |
//! | Handler → app        | raw AppEUI bytes               |

use std::sync::Arc;
use std::time::Duration;

use broker::{Broker, NetworkController};
use chrono::TimeDelta;
use handler::{DevStorage, Handler, HandlerOptions};
use lw_core::Eui64;
use lw_dutycycle::DutyManager;
use lw_protocol::{
    APacket, Activation, Error, OneshotAckNacker, Packet, Recipient, Registration, Result, marshal,
};
use lw_storage::{KvStore, StorageResult};
use router::{GatewayServer, Router, RouterStorage};
use tracing::{info, warn};

use crate::app::ApplicationSink;
use crate::config::{DeviceConfig, StackConfig, StorageConfig};
use crate::local::{BrokerEndpoint, HandlerEndpoint, LocalAdapter, LocalSubscriber};

pub const BROKER_NAME: &str = "broker";
pub const HANDLER_NAME: &str = "handler";

/// One store per component.
pub struct NodeStores {
    pub router: KvStore,
    pub duty: KvStore,
    pub broker: KvStore,
    pub handler: KvStore,
}

impl NodeStores {
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        Ok(Self {
            router: KvStore::open(&config.router_path())?,
            duty: KvStore::open(&config.duty_path())?,
            broker: KvStore::open(&config.broker_path())?,
            handler: KvStore::open(&config.handler_path())?,
        })
    }

    pub fn in_memory() -> StorageResult<Self> {
        Ok(Self {
            router: KvStore::open_in_memory()?,
            duty: KvStore::open_in_memory()?,
            broker: KvStore::open_in_memory()?,
            handler: KvStore::open_in_memory()?,
        })
    }
}

pub struct Node {
    router: Arc<Router>,
    broker: Arc<Broker>,
    handler: Arc<Handler>,
    sink: Arc<ApplicationSink>,
    to_brokers: LocalAdapter,
    to_handlers: LocalAdapter,
    to_apps: LocalAdapter,
    subscriber: LocalSubscriber,
    timeout: Duration,
}

impl Node {
    /// Builds every component and connects them. Must be called within a
    /// tokio runtime.
    pub fn start(stores: NodeStores, config: &StackConfig) -> Result<Self> {
        let timeout = config.transport.response_timeout;
        let expiry = to_delta(config.router.routing_expiry, "router.routing_expiry")?;
        let cycle = to_delta(config.router.duty_cycle, "router.duty_cycle")?;

        let duty = DutyManager::new(stores.duty, cycle, config.router.region)?;
        let router = Arc::new(Router::new(RouterStorage::new(stores.router, expiry), duty));
        let broker = Arc::new(Broker::new(NetworkController::new(stores.broker)));
        let handler = Arc::new(Handler::start(
            DevStorage::new(stores.handler),
            HandlerOptions {
                bundle_delay: config.handler.bundle_delay,
                processed_capacity: config.handler.processed_capacity,
                region: config.router.region,
                recipient: Recipient::from_name(HANDLER_NAME),
            },
        )?);
        let sink = Arc::new(ApplicationSink::new());

        let to_apps = LocalAdapter::new(timeout);
        let to_handlers = LocalAdapter::new(timeout);
        to_handlers.add_peer(
            Recipient::from_name(HANDLER_NAME),
            Arc::new(HandlerEndpoint::new(handler.clone(), Arc::new(to_apps.clone()))),
        );
        let to_brokers = LocalAdapter::new(timeout);
        to_brokers.add_peer(
            Recipient::from_name(BROKER_NAME),
            Arc::new(BrokerEndpoint::new(broker.clone(), Arc::new(to_handlers.clone()))),
        );
        let subscriber = LocalSubscriber::new(
            broker.clone(),
            Recipient::from_name(BROKER_NAME),
            Some(router.clone()),
            timeout,
        );

        info!(region = ?config.router.region, "node started");
        Ok(Self {
            router,
            broker,
            handler,
            sink,
            to_brokers,
            to_handlers,
            to_apps,
            subscriber,
            timeout,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn sink(&self) -> &ApplicationSink {
        &self.sink
    }

    /// Personalizes an ABP device and makes its application reachable.
    pub async fn register_device(&self, device: &DeviceConfig) -> Result<()> {
        self.to_apps
            .add_peer(Recipient(device.app_eui.as_bytes().to_vec()), self.sink.clone());
        let registration = Registration::Handler {
            app_eui: device.app_eui,
            dev_eui: device.dev_eui,
            activation: Activation::Abp {
                dev_addr: device.dev_addr,
                nwk_skey: device.nwk_skey,
                app_skey: device.app_skey,
            },
        };
        let (an, rx) = OneshotAckNacker::pair();
        let _ = self
            .handler
            .register(registration, &an, &self.subscriber)
            .await;
        rx.wait(self.timeout).await?;
        info!(dev_eui = %device.dev_eui, dev_addr = %device.dev_addr, "device registered");
        Ok(())
    }

    /// Queues a cleartext downlink, sent after the device's next uplink.
    pub async fn enqueue_downlink(&self, app_eui: Eui64, dev_eui: Eui64, payload: Vec<u8>) -> Result<()> {
        let data = marshal(&Packet::A(APacket {
            app_eui,
            dev_eui,
            payload,
            metadata: Vec::new(),
        }))?;
        let (an, rx) = OneshotAckNacker::pair();
        let _ = self.handler.handle_down(&data, &an).await;
        rx.wait(self.timeout).await.map(|_| ())
    }

    /// Runs one gateway-side packet through the pipeline and returns the
    /// Router's answer.
    pub async fn uplink(&self, packet: &Packet) -> Result<Option<Packet>> {
        let data = marshal(packet)?;
        let (an, rx) = OneshotAckNacker::pair();
        let _ = self.router.handle_up(&data, &an, &self.to_brokers).await;
        rx.wait(self.timeout).await
    }

    /// Binds the SemTech UDP listener in front of the Router.
    pub async fn bind_gateway(&self, addr: &str) -> std::io::Result<GatewayServer> {
        GatewayServer::bind(
            addr,
            self.router.clone(),
            Arc::new(self.to_brokers.clone()),
            self.timeout,
        )
        .await
    }

    /// Drains the bundling engine. Any gateway server must have stopped.
    pub async fn shutdown(self) {
        let Self {
            handler,
            to_brokers,
            to_handlers,
            to_apps,
            subscriber,
            ..
        } = self;
        drop((to_brokers, to_handlers, to_apps, subscriber));
        match Arc::try_unwrap(handler) {
            Ok(handler) => handler.shutdown().await,
            Err(_) => warn!("handler still referenced, bundles left to the runtime"),
        }
        info!("node stopped");
    }
}

fn to_delta(duration: Duration, field: &str) -> Result<TimeDelta> {
    TimeDelta::from_std(duration).map_err(|e| Error::structural(format!("{field}: {e}")))
}
