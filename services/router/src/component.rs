//! Router: gateway-facing entry point of the pipeline.
//!
//! Uplinks are annotated with the duty-cycle state of both receive windows
//! and forwarded to the Broker(s) owning the device, or broadcast when no
//! live route is known. A Broker answer is accounted in the DutyManager and
//! handed back to the gateway side.

use lw_core::Eui64;
use lw_dutycycle::{Cycles, DutyManager, state_from_duty};
use lw_protocol::{
    AckGuard, AckNacker, Adapter, BPacket, Error, Packet, RPacket, Recipient, Registration,
    Result, unmarshal,
};
use tracing::{debug, info, warn};

use crate::storage::RouterStorage;

pub struct Router {
    storage: RouterStorage,
    duty: DutyManager,
}

impl Router {
    pub fn new(storage: RouterStorage, duty: DutyManager) -> Self {
        Self { storage, duty }
    }

    /// The duty-cycle manager backing this router.
    pub fn duty(&self) -> &DutyManager {
        &self.duty
    }

    /// Stores a device → Broker route. Only `Registration::Router` is
    /// accepted.
    pub async fn register(&self, registration: Registration, an: &dyn AckNacker) -> Result<()> {
        let guard = AckGuard::new(an);
        let outcome = match registration {
            Registration::Router { dev_eui, recipient } => {
                info!(dev_eui = %dev_eui, recipient = %recipient, "router registration");
                self.storage.store(dev_eui, recipient).await.map(|()| None)
            }
            other => Err(Error::structural(format!(
                "router cannot handle {} registration",
                other.kind()
            ))),
        };
        guard.resolve(outcome)
    }

    /// Handles one marshalled packet coming from the gateway side. `an` is
    /// resolved exactly once; a downlink answer travels in the ack.
    pub async fn handle_up(&self, data: &[u8], an: &dyn AckNacker, up: &dyn Adapter) -> Result<()> {
        let guard = AckGuard::new(an);
        let outcome = self.process_up(data, up).await;
        if let Err(e) = &outcome {
            debug!(kind = ?e.kind, error = %e, "uplink rejected");
        }
        guard.resolve(outcome)
    }

    async fn process_up(&self, data: &[u8], up: &dyn Adapter) -> Result<Option<Packet>> {
        let rpacket = match unmarshal(data)? {
            Packet::R(p) => p,
            Packet::J(_) => return Err(Error::implementation("join requests are not supported")),
            Packet::S(_) => return Err(Error::implementation("gateway stats are not supported")),
            other => {
                return Err(Error::structural(format!(
                    "router cannot handle {}",
                    other.kind()
                )));
            }
        };
        let dev_eui = rpacket
            .dev_eui()
            .ok_or_else(|| Error::structural("uplink carries no device address"))?;

        let recipients = self.resolve_recipients(dev_eui).await?;

        let freq = rpacket
            .metadata
            .freq
            .ok_or_else(|| Error::structural("uplink without frequency is not supported"))?;

        let cycles = match self.duty.lookup(rpacket.gateway_id).await {
            Ok(cycles) => cycles,
            Err(e) => {
                warn!(gateway = %rpacket.gateway_id, error = %e, "duty lookup failed, assuming unconstrained");
                Cycles::new()
            }
        };

        let plan = self.duty.plan();
        let rx1_band = plan.sub_band(freq)?;
        let rx2_band = plan.sub_band(plan.rx2().freq)?;
        let usage = |band| cycles.get(&band).copied().unwrap_or(0);

        let RPacket {
            gateway_id,
            payload,
            mut metadata,
        } = rpacket;
        metadata.duty_rx1 = Some(state_from_duty(usage(rx1_band)));
        metadata.duty_rx2 = Some(state_from_duty(usage(rx2_band)));
        metadata.gateway = Some(gateway_id);

        let bpacket = Packet::B(BPacket { payload, metadata });
        let response = self.forward(&bpacket, &recipients, up).await?;

        let Some(bytes) = response else {
            debug!(dev_eui = %dev_eui, "uplink forwarded, no downlink");
            return Ok(None);
        };
        let answer = match unmarshal(&bytes) {
            Ok(Packet::R(answer)) => answer,
            Ok(other) => {
                return Err(Error::operational(format!(
                    "broker answered with {}",
                    other.kind()
                )));
            }
            Err(e) => return Err(Error::operational(format!("invalid broker answer: {e}"))),
        };
        self.account_downlink(&answer).await?;
        debug!(dev_eui = %dev_eui, gateway = %answer.gateway_id, "downlink relayed");
        Ok(Some(Packet::R(answer)))
    }

    /// Recipients owning `dev_eui`; empty means broadcast.
    async fn resolve_recipients(&self, dev_eui: Eui64) -> Result<Vec<Recipient>> {
        match self.storage.lookup(dev_eui).await {
            Ok(entries) => Ok(entries.into_iter().map(|e| e.recipient).collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(Error::operational(format!("routing lookup failed: {e}"))),
        }
    }

    async fn forward(
        &self,
        packet: &Packet,
        recipients: &[Recipient],
        up: &dyn Adapter,
    ) -> Result<Option<Vec<u8>>> {
        match up.send(packet, recipients).await {
            Err(e) if e.is_not_found() && !recipients.is_empty() => {
                // Stale or colliding route: the owner may have moved.
                warn!(recipients = recipients.len(), "targeted send found nobody, broadcasting");
                up.send(packet, &[]).await
            }
            other => other,
        }
    }

    async fn account_downlink(&self, answer: &RPacket) -> Result<()> {
        let md = &answer.metadata;
        let (Some(freq), Some(datr), Some(codr), Some(size)) =
            (md.freq, md.datr.as_deref(), md.codr.as_deref(), md.size)
        else {
            return Err(Error::operational(
                "downlink misses mandatory metadata (freq, datr, codr, size)",
            ));
        };
        self.duty
            .update(answer.gateway_id, freq, size, datr, codr)
            .await
            .map_err(|e| Error::operational(format!("duty cycle update failed: {e}")))
    }
}
