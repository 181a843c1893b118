//! Bundling engine: merges the copies of one uplink.
//!
//! The same frame reaches the Handler once per gateway (and Broker) that
//! heard it. Copies share a [`BundleId`]; they are buffered for a fixed
//! delay after the first one arrives, then flushed as one group.
//!
//! Two tasks cooperate:
//!
//! - the **collector** owns the buffers and the processed-id memory. It arms
//!   one alarm per id, and on expiry moves the group to the consumer and
//!   records the id so later copies are rejected.
//! - the **consumer** decrypts the group once, delivers a single
//!   [`APacket`] to the application, elects the gateway and window for the
//!   answer and builds at most one downlink.
//!
//! Every bundle receives exactly one reply: the elected one gets the
//! downlink (if any), the others `None`, and a failure is sent to all.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lw_core::{Eui64, MType, MacPayload, PhyPayload};
use lw_dutycycle::{Election, Rx2Params, ScoreComputer, Window};
use lw_protocol::{
    APacket, Adapter, BPacket, Error, HPacket, Metadata, Packet, Result, advance_counter,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::queue::PQueue;
use crate::storage::{DevStorage, HandlerDevice};

const INPUT_CAPACITY: usize = 1024;
/// Receive window delays after the end of the uplink, microseconds.
const RX1_DELAY_US: u32 = 1_000_000;
const RX2_DELAY_US: u32 = 2_000_000;
const DEFAULT_TX_POWER: u32 = 14;

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// `app_eui ‖ dev_eui ‖ fcnt` (big-endian). The first 16 bytes identify the
/// device, the last 4 the frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleId([u8; 20]);

impl BundleId {
    pub fn new(app_eui: Eui64, dev_eui: Eui64, fcnt: u32) -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(app_eui.as_bytes());
        id[8..16].copy_from_slice(dev_eui.as_bytes());
        id[16..].copy_from_slice(&fcnt.to_be_bytes());
        Self(id)
    }

    pub fn prefix(&self) -> [u8; 16] {
        let mut p = [0u8; 16];
        p.copy_from_slice(&self.0[..16]);
        p
    }

    pub fn suffix(&self) -> [u8; 4] {
        let mut s = [0u8; 4];
        s.copy_from_slice(&self.0[16..]);
        s
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleId({self})")
    }
}

pub type Reply = Result<Option<Packet>>;

/// One copy of an uplink waiting to be merged.
pub struct Bundle {
    pub id: BundleId,
    pub packet: HPacket,
    pub device: HandlerDevice,
    /// Where the application packet goes if this copy is elected.
    pub adapter: Arc<dyn Adapter>,
    pub reply: oneshot::Sender<Reply>,
}

impl Bundle {
    fn answer(self, reply: Reply) {
        if self.reply.send(reply).is_err() {
            debug!(bundle = %self.id, "bundle caller went away");
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Buffering window after the first copy of an uplink arrives.
    pub delay: Duration,
    pub processed_capacity: usize,
    pub rx2: Rx2Params,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BundleEngine {
    input: mpsc::Sender<Bundle>,
    collector: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl BundleEngine {
    /// Spawns the collector and consumer tasks.
    pub fn start(storage: Arc<DevStorage>, options: BundleOptions) -> Self {
        let (input, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (groups_tx, groups_rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(collect(
            input_rx,
            groups_tx,
            options.delay,
            options.processed_capacity,
        ));
        let consumer = tokio::spawn(consume(
            groups_rx,
            Consumer {
                storage,
                rx2: options.rx2,
            },
        ));
        Self {
            input,
            collector,
            consumer,
        }
    }

    pub async fn submit(&self, bundle: Bundle) -> Result<()> {
        self.input
            .send(bundle)
            .await
            .map_err(|_| Error::operational("bundling engine stopped"))
    }

    /// Stops accepting bundles and waits for both tasks. Bundles still
    /// buffering are answered with an `Operational` error.
    pub async fn shutdown(self) {
        drop(self.input);
        if let Err(e) = self.collector.await {
            warn!(error = %e, "bundle collector ended abnormally");
        }
        if let Err(e) = self.consumer.await {
            warn!(error = %e, "bundle consumer ended abnormally");
        }
    }
}

async fn collect(
    mut input: mpsc::Receiver<Bundle>,
    groups: mpsc::UnboundedSender<Vec<Bundle>>,
    delay: Duration,
    processed_capacity: usize,
) {
    let (alarm_tx, mut alarms) = mpsc::unbounded_channel::<BundleId>();
    let mut buffers: HashMap<BundleId, Vec<Bundle>> = HashMap::new();
    let mut processed = PQueue::new(processed_capacity);

    loop {
        tokio::select! {
            incoming = input.recv() => {
                let Some(bundle) = incoming else {
                    break;
                };
                if processed.contains(&bundle.id.prefix(), &bundle.id.suffix()) {
                    debug!(bundle = %bundle.id, "late copy of a flushed uplink");
                    bundle.answer(Err(Error::behavioural("already processed")));
                    continue;
                }
                match buffers.entry(bundle.id) {
                    Entry::Occupied(mut buffered) => buffered.get_mut().push(bundle),
                    Entry::Vacant(slot) => {
                        let id = *slot.key();
                        slot.insert(vec![bundle]);
                        let alarm = alarm_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = alarm.send(id);
                        });
                    }
                }
            }
            Some(id) = alarms.recv() => {
                let Some(group) = buffers.remove(&id) else {
                    continue;
                };
                processed.put(id.prefix(), id.suffix());
                debug!(bundle = %id, copies = group.len(), "flushing bundle");
                if let Err(mpsc::error::SendError(group)) = groups.send(group) {
                    for bundle in group {
                        bundle.answer(Err(Error::operational("bundle consumer stopped")));
                    }
                }
            }
        }
    }

    for (_, group) in buffers.drain() {
        for bundle in group {
            bundle.answer(Err(Error::operational("bundling engine stopped")));
        }
    }
}

async fn consume(mut groups: mpsc::UnboundedReceiver<Vec<Bundle>>, consumer: Consumer) {
    while let Some(group) = groups.recv().await {
        consumer.flush(group).await;
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct Consumer {
    storage: Arc<DevStorage>,
    rx2: Rx2Params,
}

impl Consumer {
    async fn flush(&self, group: Vec<Bundle>) {
        if group.is_empty() {
            return;
        }
        match self.merge(&group).await {
            Ok((winner, downlink)) => {
                for (i, bundle) in group.into_iter().enumerate() {
                    let reply = if winner == Some(i) {
                        downlink.clone()
                    } else {
                        None
                    };
                    bundle.answer(Ok(reply));
                }
            }
            Err(e) => {
                warn!(kind = ?e.kind, error = %e, copies = group.len(), "bundle failed");
                for bundle in group {
                    bundle.answer(Err(e.clone()));
                }
            }
        }
    }

    /// Index of the elected copy and the downlink it must carry.
    async fn merge(&self, group: &[Bundle]) -> Result<(Option<usize>, Option<Packet>)> {
        let first = group
            .first()
            .ok_or_else(|| Error::behavioural("empty bundle group"))?;
        let (app_eui, dev_eui) = (first.packet.app_eui, first.packet.dev_eui);

        let key = first
            .packet
            .payload
            .payload_key(&first.device.nwk_skey, &first.device.app_skey);
        let clear = first
            .packet
            .payload
            .decrypt_frm_payload(key)
            .ok_or_else(|| Error::structural("uplink carries no application payload"))?;
        let metadata: Vec<Metadata> = group.iter().map(|b| b.packet.metadata.clone()).collect();
        let election = elect(group)?;

        let sender = &group[election.map_or(0, |e| e.id)];
        let recipient = sender.adapter.get_recipient(app_eui.as_bytes())?;
        let apacket = Packet::A(APacket {
            app_eui,
            dev_eui,
            payload: clear,
            metadata,
        });
        sender
            .adapter
            .send(&apacket, std::slice::from_ref(&recipient))
            .await?;

        let mut device = self.storage.lookup(app_eui, dev_eui).await?;
        if let Some(fcnt) = first.packet.fcnt() {
            device.fcnt_up = advance_counter(device.fcnt_up, fcnt);
        }

        let Some(election) = election else {
            debug!(dev_eui = %dev_eui, "no gateway available for a downlink");
            self.storage.commit_uplink(&device, false).await?;
            return Ok((None, None));
        };

        let queued = match self.storage.peek(app_eui, dev_eui).await {
            Ok(payload) => Some(payload),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let confirmed = first.packet.is_confirmed();
        if queued.is_none() && !confirmed {
            self.storage.commit_uplink(&device, false).await?;
            return Ok((Some(election.id), None));
        }

        let sent = queued.is_some();
        let uplink = &group[election.id].packet.metadata;
        let downlink = self.build_downlink(&mut device, queued, confirmed, uplink, election.window)?;
        self.storage.commit_uplink(&device, sent).await?;
        debug!(
            dev_eui = %dev_eui,
            window = ?election.window,
            fcnt_down = device.fcnt_down,
            "downlink scheduled"
        );
        Ok((Some(election.id), Some(Packet::B(downlink))))
    }

    /// Encrypted downlink for `device`, unsigned (the Broker holds the
    /// network key). Advances the device's downlink counter.
    fn build_downlink(
        &self,
        device: &mut HandlerDevice,
        payload: Option<Vec<u8>>,
        ack: bool,
        uplink: &Metadata,
        window: Window,
    ) -> Result<BPacket> {
        let mut mac = MacPayload::new(device.dev_addr, device.fcnt_down);
        mac.fctrl.ack = ack;
        if let Some(payload) = payload {
            mac.fport = Some(1);
            mac.frm_payload = payload;
        }
        let mut phy = PhyPayload::data(MType::UnconfirmedDataDown, mac);
        let key = phy.payload_key(&device.nwk_skey, &device.app_skey);
        phy.encrypt_frm_payload(key);
        device.fcnt_down = device.fcnt_down.wrapping_add(1);

        let size = u32::try_from(phy.encode()?.len())
            .map_err(|_| Error::structural("downlink frame too large"))?;
        let (freq, datr, codr, delay) = match window {
            Window::Rx1 => (
                uplink.freq,
                uplink.datr.clone(),
                uplink.codr.clone(),
                RX1_DELAY_US,
            ),
            Window::Rx2 => (
                Some(self.rx2.freq),
                Some(self.rx2.datr.clone()),
                Some(self.rx2.codr.clone()),
                RX2_DELAY_US,
            ),
        };
        Ok(BPacket {
            payload: phy,
            metadata: Metadata {
                codr,
                datr,
                freq,
                imme: Some(false),
                ipol: Some(true),
                modu: Some("LORA".to_owned()),
                powe: Some(DEFAULT_TX_POWER),
                rfch: uplink.rfch,
                size: Some(size),
                tmst: uplink.tmst.map(|t| t.wrapping_add(delay)),
                gateway: uplink.gateway,
                ..Metadata::default()
            },
        })
    }
}

/// Elects the copy (gateway) and window to answer through. `None` when the
/// uplink datarate is unknown or no window has a usable candidate.
fn elect(group: &[Bundle]) -> Result<Option<Election>> {
    let Some(datr) = group.first().and_then(|b| b.packet.metadata.datr.as_deref()) else {
        return Ok(None);
    };
    let (computer, mut scores) = ScoreComputer::new(datr)?;
    for (id, bundle) in group.iter().enumerate() {
        scores = computer.update(scores, id, &bundle.packet.metadata);
    }
    Ok(computer.get(&scores))
}
