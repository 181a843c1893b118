//! Broker: owns the device ↔ Handler bindings.
//!
//! Several devices may share one address; the uplink belongs to the entry
//! whose network session key validates its MIC, with the frame counter
//! reconciled against that entry's stored counter.

use lw_protocol::{
    AckGuard, AckNacker, Adapter, BPacket, Error, HPacket, Packet, RPacket, Registration, Result,
    unmarshal,
};
use tracing::{debug, info, warn};

use crate::controller::{ApplicationEntry, DeviceEntry, NetworkController};

pub struct Broker {
    controller: NetworkController,
}

impl Broker {
    pub fn new(controller: NetworkController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &NetworkController {
        &self.controller
    }

    /// Binds a device (`Registration::Broker`) or an application
    /// (`Registration::Application`) to a Handler.
    pub async fn register(&self, registration: Registration, an: &dyn AckNacker) -> Result<()> {
        let guard = AckGuard::new(an);
        let outcome = match registration {
            Registration::Broker {
                app_eui,
                dev_eui,
                dev_addr,
                nwk_skey,
                recipient,
            } => {
                info!(app_eui = %app_eui, dev_eui = %dev_eui, dev_addr = %dev_addr, "broker device registration");
                self.controller
                    .store_device(DeviceEntry {
                        app_eui,
                        dev_eui,
                        dev_addr,
                        recipient,
                        nwk_skey,
                        fcnt_up: 0,
                    })
                    .await
                    .map(|()| None)
            }
            Registration::Application { app_eui, recipient } => {
                info!(app_eui = %app_eui, recipient = %recipient, "broker application registration");
                self.controller
                    .store_application(ApplicationEntry { app_eui, recipient })
                    .await
                    .map(|previous| {
                        if let Some(previous) = previous {
                            info!(app_eui = %app_eui, from = %previous.recipient, "application rebound");
                        }
                        None
                    })
            }
            other => Err(Error::structural(format!(
                "broker cannot handle {} registration",
                other.kind()
            ))),
        };
        guard.resolve(outcome)
    }

    /// Handles one marshalled `BPacket` from a Router. A Handler downlink,
    /// re-signed with the device's network key, travels back in the ack.
    pub async fn handle_up(&self, data: &[u8], an: &dyn AckNacker, up: &dyn Adapter) -> Result<()> {
        let guard = AckGuard::new(an);
        let outcome = self.process_up(data, up).await;
        if let Err(e) = &outcome {
            debug!(kind = ?e.kind, error = %e, "uplink rejected");
        }
        guard.resolve(outcome)
    }

    async fn process_up(&self, data: &[u8], up: &dyn Adapter) -> Result<Option<Packet>> {
        let bpacket = match unmarshal(data)? {
            Packet::B(p) => p,
            other => {
                return Err(Error::structural(format!(
                    "broker cannot handle {}",
                    other.kind()
                )));
            }
        };
        let dev_addr = bpacket
            .payload
            .dev_addr()
            .ok_or_else(|| Error::structural("uplink carries no device address"))?;

        let candidates = match self.controller.lookup_devices(dev_addr).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dev_addr = %dev_addr, error = %e, "no candidate device");
                return Err(e);
            }
        };

        let (entry, fcnt) = match_device(&bpacket, candidates)?;

        self.controller
            .update_fcnt(entry.app_eui, entry.dev_eui, entry.dev_addr, fcnt)
            .await?;

        let BPacket {
            mut payload,
            metadata,
        } = bpacket;
        payload.set_fcnt(fcnt);
        let gateway = metadata.gateway;
        let hpacket = Packet::H(HPacket {
            app_eui: entry.app_eui,
            dev_eui: entry.dev_eui,
            payload,
            metadata,
        });

        let Some(bytes) = up
            .send(&hpacket, std::slice::from_ref(&entry.recipient))
            .await?
        else {
            debug!(dev_eui = %entry.dev_eui, fcnt, "uplink forwarded, no downlink");
            return Ok(None);
        };

        let mut answer = match unmarshal(&bytes) {
            Ok(Packet::B(answer)) => answer,
            Ok(other) => {
                return Err(Error::operational(format!(
                    "handler answered with {}",
                    other.kind()
                )));
            }
            Err(e) => return Err(Error::operational(format!("invalid handler answer: {e}"))),
        };
        answer
            .payload
            .set_mic(&entry.nwk_skey)
            .map_err(|e| Error::operational(format!("unable to sign downlink: {e}")))?;
        let gateway_id = answer.metadata.gateway.or(gateway).ok_or_else(|| {
            Error::operational("downlink does not name the gateway to transmit on")
        })?;
        debug!(dev_eui = %entry.dev_eui, gateway = %gateway_id, "downlink relayed");
        Ok(Some(Packet::R(RPacket {
            gateway_id,
            payload: answer.payload,
            metadata: answer.metadata,
        })))
    }
}

/// Picks the candidate whose network key validates the frame, with the
/// full counter reconciled against that candidate.
fn match_device(bpacket: &BPacket, candidates: Vec<DeviceEntry>) -> Result<(DeviceEntry, u32)> {
    for entry in candidates {
        let fcnt = match bpacket.compute_fcnt(entry.fcnt_up) {
            Ok(fcnt) => fcnt,
            Err(e) => {
                debug!(dev_eui = %entry.dev_eui, error = %e, "counter out of range for candidate");
                continue;
            }
        };
        let mut trial = bpacket.payload.clone();
        trial.set_fcnt(fcnt);
        match trial.validate_mic(&entry.nwk_skey) {
            Ok(true) => return Ok((entry, fcnt)),
            Ok(false) => {}
            Err(e) => warn!(dev_eui = %entry.dev_eui, error = %e, "unable to compute MIC"),
        }
    }
    Err(Error::not_found("MIC check returned no matches"))
}
