//! Handler: application-facing end of the pipeline.
//!
//! Owns the application session keys. Uplinks are checked against the
//! device store and handed to the bundling engine; downlinks pushed by
//! applications wait in a per-device queue until the next uplink.

use std::sync::Arc;
use std::time::Duration;

use lw_dutycycle::{BandPlan, Region};
use lw_protocol::{
    AckGuard, AckNacker, Activation, Adapter, Error, Packet, Recipient, Registration, Result,
    Subscriber, unmarshal,
};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::bundle::{Bundle, BundleEngine, BundleId, BundleOptions};
use crate::storage::DevStorage;

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub bundle_delay: Duration,
    pub processed_capacity: usize,
    pub region: Region,
    /// How Brokers reach this Handler.
    pub recipient: Recipient,
}

pub struct Handler {
    storage: Arc<DevStorage>,
    engine: BundleEngine,
    recipient: Recipient,
}

impl Handler {
    /// Builds the Handler and spawns its bundling engine. Must be called
    /// within a tokio runtime.
    pub fn start(storage: DevStorage, options: HandlerOptions) -> Result<Self> {
        let plan = BandPlan::for_region(options.region)?;
        let storage = Arc::new(storage);
        let engine = BundleEngine::start(
            storage.clone(),
            BundleOptions {
                delay: options.bundle_delay,
                processed_capacity: options.processed_capacity,
                rx2: plan.rx2().clone(),
            },
        );
        info!(
            delay = ?options.bundle_delay,
            capacity = options.processed_capacity,
            "handler started"
        );
        Ok(Self {
            storage,
            engine,
            recipient: options.recipient,
        })
    }

    pub fn storage(&self) -> &DevStorage {
        &self.storage
    }

    /// Registers a device and subscribes it upstream: ABP devices at the
    /// Broker, OTAA devices through their application.
    pub async fn register(
        &self,
        registration: Registration,
        an: &dyn AckNacker,
        subscriber: &dyn Subscriber,
    ) -> Result<()> {
        let guard = AckGuard::new(an);
        let outcome = self.process_registration(registration, subscriber).await;
        guard.resolve(outcome.map(|()| None))
    }

    async fn process_registration(
        &self,
        registration: Registration,
        subscriber: &dyn Subscriber,
    ) -> Result<()> {
        let (app_eui, dev_eui, activation) = match registration {
            Registration::Handler {
                app_eui,
                dev_eui,
                activation,
            } => (app_eui, dev_eui, activation),
            other => {
                return Err(Error::structural(format!(
                    "handler cannot handle {} registration",
                    other.kind()
                )));
            }
        };
        match activation {
            Activation::Abp {
                dev_addr,
                nwk_skey,
                app_skey,
            } => {
                info!(app_eui = %app_eui, dev_eui = %dev_eui, dev_addr = %dev_addr, "abp registration");
                self.storage
                    .upsert_abp(app_eui, dev_eui, dev_addr, nwk_skey, app_skey)
                    .await?;
                subscriber
                    .subscribe(Registration::Broker {
                        app_eui,
                        dev_eui,
                        dev_addr,
                        nwk_skey,
                        recipient: self.recipient.clone(),
                    })
                    .await
            }
            Activation::Otaa { app_key } => {
                info!(app_eui = %app_eui, dev_eui = %dev_eui, "otaa registration");
                self.storage.upsert_otaa(app_eui, dev_eui, app_key).await?;
                subscriber
                    .subscribe(Registration::Application {
                        app_eui,
                        recipient: self.recipient.clone(),
                    })
                    .await
            }
        }
    }

    /// Handles one marshalled `HPacket`. Resolves `an` once the uplink's
    /// bundle has been flushed: with the downlink for the elected copy,
    /// `None` for the others.
    pub async fn handle_up(
        &self,
        data: &[u8],
        an: &dyn AckNacker,
        up: Arc<dyn Adapter>,
    ) -> Result<()> {
        let guard = AckGuard::new(an);
        let outcome = self.process_up(data, up).await;
        if let Err(e) = &outcome {
            debug!(kind = ?e.kind, error = %e, "uplink rejected");
        }
        guard.resolve(outcome)
    }

    async fn process_up(&self, data: &[u8], up: Arc<dyn Adapter>) -> Result<Option<Packet>> {
        let hpacket = match unmarshal(data)? {
            Packet::H(p) => p,
            other => {
                return Err(Error::structural(format!(
                    "handler cannot handle {}",
                    other.kind()
                )));
            }
        };
        let fcnt = hpacket
            .fcnt()
            .ok_or_else(|| Error::structural("uplink carries no frame counter"))?;
        let device = self.storage.lookup(hpacket.app_eui, hpacket.dev_eui).await?;

        let (reply, answer) = oneshot::channel();
        self.engine
            .submit(Bundle {
                id: BundleId::new(hpacket.app_eui, hpacket.dev_eui, fcnt),
                packet: hpacket,
                device,
                adapter: up,
                reply,
            })
            .await?;
        answer
            .await
            .map_err(|_| Error::operational("connection lost"))?
    }

    /// Queues the cleartext downlink of an `APacket` for its device.
    pub async fn handle_down(&self, data: &[u8], an: &dyn AckNacker) -> Result<()> {
        let guard = AckGuard::new(an);
        let outcome = self.process_down(data).await;
        guard.resolve(outcome.map(|()| None))
    }

    async fn process_down(&self, data: &[u8]) -> Result<()> {
        let apacket = match unmarshal(data)? {
            Packet::A(p) => p,
            other => {
                return Err(Error::structural(format!(
                    "handler cannot queue {}",
                    other.kind()
                )));
            }
        };
        self.storage
            .lookup(apacket.app_eui, apacket.dev_eui)
            .await?;
        debug!(
            app_eui = %apacket.app_eui,
            dev_eui = %apacket.dev_eui,
            size = apacket.payload.len(),
            "downlink queued"
        );
        self.storage
            .push(apacket.app_eui, apacket.dev_eui, apacket.payload)
            .await
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}
