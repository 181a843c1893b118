//! SemTech UDP packet-forwarder front end.
//!
//! # Framing
//! ```text
//! PUSH_DATA  ver | token(2) | 0x00 | gateway EUI(8) | JSON {rxpk, stat}
//! PUSH_ACK   ver | token(2) | 0x01
//! PULL_DATA  ver | token(2) | 0x02 | gateway EUI(8)
//! PULL_RESP  ver | token(2) | 0x03 | JSON {txpk}
//! PULL_ACK   ver | token(2) | 0x04
//! TX_ACK     ver | token(2) | 0x05 | gateway EUI(8) | JSON? (v2 only)
//! ```
//!
//! Every `rxpk` becomes an `RPacket` (a `JPacket` for join requests) and
//! every `stat` an `SPacket`, each fed to [`Router::handle_up`]. Downlink
//! answers are sent back as `PULL_RESP` to the address the gateway last
//! pulled from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use lw_core::{Eui64, MType, PhyPayload};
use lw_protocol::{
    Adapter, GatewayStats, JPacket, Metadata, OneshotAckNacker, Packet, RPacket, SPacket, marshal,
};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::component::Router;

pub const PROTOCOL_VERSION: u8 = 0x01;
const MAX_DATAGRAM: usize = 65_507;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PushData,
    PushAck,
    PullData,
    PullResp,
    PullAck,
    TxAck,
}

impl Command {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Command::PushData),
            1 => Some(Command::PushAck),
            2 => Some(Command::PullData),
            3 => Some(Command::PullResp),
            4 => Some(Command::PullAck),
            5 => Some(Command::TxAck),
            _ => None,
        }
    }

    fn byte(self) -> u8 {
        match self {
            Command::PushData => 0,
            Command::PushAck => 1,
            Command::PullData => 2,
            Command::PullResp => 3,
            Command::PullAck => 4,
            Command::TxAck => 5,
        }
    }
}

/// `datr` is a string for LoRa and a bit rate for FSK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datr {
    Lora(String),
    Fsk(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datr: Option<Datr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    pub imme: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    pub freq: f64,
    pub rfch: u32,
    pub powe: u32,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub ipol: bool,
    pub size: u32,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rxpk: Vec<Rxpk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<GatewayStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PullRespPayload {
    txpk: Txpk,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    PushData {
        version: u8,
        token: [u8; 2],
        gateway_id: Eui64,
        payload: PushPayload,
    },
    PullData {
        version: u8,
        token: [u8; 2],
        gateway_id: Eui64,
    },
    TxAck {
        version: u8,
        token: [u8; 2],
        gateway_id: Eui64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SemtechError {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("unexpected downstream command {0:?}")]
    Unexpected(Command),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn decode(buf: &[u8]) -> Result<Datagram, SemtechError> {
    if buf.len() < 4 {
        return Err(SemtechError::TooShort(buf.len()));
    }
    let version = buf[0];
    if version != 0x01 && version != 0x02 {
        return Err(SemtechError::Version(version));
    }
    let token = [buf[1], buf[2]];
    let command = Command::from_byte(buf[3]).ok_or(SemtechError::UnknownCommand(buf[3]))?;

    let gateway = || -> Result<Eui64, SemtechError> {
        if buf.len() < 12 {
            return Err(SemtechError::TooShort(buf.len()));
        }
        let mut eui = [0u8; 8];
        eui.copy_from_slice(&buf[4..12]);
        Ok(Eui64(eui))
    };

    match command {
        Command::PushData => {
            let gateway_id = gateway()?;
            let payload = if buf.len() > 12 {
                serde_json::from_slice(&buf[12..])?
            } else {
                PushPayload::default()
            };
            Ok(Datagram::PushData {
                version,
                token,
                gateway_id,
                payload,
            })
        }
        Command::PullData => Ok(Datagram::PullData {
            version,
            token,
            gateway_id: gateway()?,
        }),
        Command::TxAck => Ok(Datagram::TxAck {
            version,
            token,
            gateway_id: gateway()?,
        }),
        other => Err(SemtechError::Unexpected(other)),
    }
}

fn header(version: u8, token: [u8; 2], command: Command) -> Vec<u8> {
    vec![version, token[0], token[1], command.byte()]
}

pub fn push_ack(version: u8, token: [u8; 2]) -> Vec<u8> {
    header(version, token, Command::PushAck)
}

pub fn pull_ack(version: u8, token: [u8; 2]) -> Vec<u8> {
    header(version, token, Command::PullAck)
}

pub fn pull_resp(version: u8, token: [u8; 2], txpk: &Txpk) -> Result<Vec<u8>, SemtechError> {
    let mut out = header(version, token, Command::PullResp);
    out.extend(serde_json::to_vec(&PullRespPayload { txpk: txpk.clone() })?);
    Ok(out)
}

/// Gateway metadata of a received frame.
pub fn rxpk_metadata(rxpk: &Rxpk) -> Metadata {
    Metadata {
        chan: rxpk.chan,
        codr: rxpk.codr.clone(),
        datr: match &rxpk.datr {
            Some(Datr::Lora(s)) => Some(s.clone()),
            _ => None,
        },
        freq: rxpk.freq,
        lsnr: rxpk.lsnr,
        modu: rxpk.modu.clone(),
        rfch: rxpk.rfch,
        rssi: rxpk.rssi,
        size: rxpk.size,
        stat: rxpk.stat,
        time: rxpk.time.clone(),
        tmst: rxpk.tmst,
        ..Metadata::default()
    }
}

/// Turns a received frame into the packet fed to the Router.
pub fn rxpk_to_packet(gateway_id: Eui64, rxpk: &Rxpk) -> Result<Packet, String> {
    let bytes = B64
        .decode(&rxpk.data)
        .map_err(|e| format!("invalid base64 in rxpk: {e}"))?;
    let payload = PhyPayload::decode(&bytes).map_err(|e| e.to_string())?;
    let metadata = rxpk_metadata(rxpk);
    Ok(if payload.mtype() == MType::JoinRequest {
        Packet::J(JPacket {
            gateway_id,
            payload,
            metadata,
        })
    } else {
        Packet::R(RPacket {
            gateway_id,
            payload,
            metadata,
        })
    })
}

/// Transmission request for a downlink answer.
pub fn downlink_txpk(packet: &RPacket) -> Result<Txpk, String> {
    let md = &packet.metadata;
    let bytes = packet.payload.encode().map_err(|e| e.to_string())?;
    let missing = |field: &str| format!("downlink metadata misses {field}");
    let size = match md.size {
        Some(size) => size,
        None => u32::try_from(bytes.len()).map_err(|e| e.to_string())?,
    };
    Ok(Txpk {
        imme: md.imme.unwrap_or(false),
        tmst: md.tmst,
        freq: md.freq.ok_or_else(|| missing("freq"))?,
        rfch: md.rfch.unwrap_or(0),
        powe: md.powe.unwrap_or(14),
        modu: md.modu.clone().unwrap_or_else(|| "LORA".to_owned()),
        datr: md.datr.clone().ok_or_else(|| missing("datr"))?,
        codr: md.codr.clone().ok_or_else(|| missing("codr"))?,
        ipol: md.ipol.unwrap_or(true),
        size,
        data: B64.encode(&bytes),
    })
}

// ---------------------------------------------------------------------------
// Gateway keeper
// ---------------------------------------------------------------------------

/// Last known pull address of each gateway.
#[derive(Clone, Default)]
pub struct GatewayKeeper {
    inner: Arc<RwLock<HashMap<Eui64, SocketAddr>>>,
}

impl GatewayKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, gateway: Eui64, addr: SocketAddr) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(gateway, addr);
        }
    }

    pub fn get(&self, gateway: Eui64) -> Option<SocketAddr> {
        self.inner.read().ok()?.get(&gateway).copied()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct GatewayServer {
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
    up: Arc<dyn Adapter>,
    keeper: GatewayKeeper,
    response_timeout: Duration,
}

impl GatewayServer {
    /// Binds the UDP listener (use `"127.0.0.1:0"` for an ephemeral port).
    pub async fn bind(
        addr: &str,
        router: Arc<Router>,
        up: Arc<dyn Adapter>,
        response_timeout: Duration,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            router,
            up,
            keeper: GatewayKeeper::new(),
            response_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn keeper(&self) -> GatewayKeeper {
        self.keeper.clone()
    }

    /// Serves datagrams until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if *shutdown.borrow() {
                info!("gateway server stopping (shutdown)");
                return Ok(());
            }
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    self.on_datagram(&buf[..len], from).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("gateway server stopping (shutdown)");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        let datagram = match decode(buf) {
            Ok(d) => d,
            Err(e) => {
                warn!(from = %from, error = %e, "dropping invalid datagram");
                return;
            }
        };
        match datagram {
            Datagram::PushData {
                version,
                token,
                gateway_id,
                payload,
            } => {
                self.reply(&push_ack(version, token), from).await;
                debug!(gateway = %gateway_id, rxpk = payload.rxpk.len(), "push data");
                for rxpk in &payload.rxpk {
                    match rxpk_to_packet(gateway_id, rxpk) {
                        Ok(packet) => self.spawn_uplink(packet, version),
                        Err(e) => warn!(gateway = %gateway_id, error = %e, "dropping rxpk"),
                    }
                }
                if let Some(stats) = payload.stat {
                    self.spawn_uplink(Packet::S(SPacket { gateway_id, stats }), version);
                }
            }
            Datagram::PullData {
                version,
                token,
                gateway_id,
            } => {
                self.keeper.set(gateway_id, from);
                self.reply(&pull_ack(version, token), from).await;
            }
            Datagram::TxAck { gateway_id, .. } => {
                debug!(gateway = %gateway_id, "tx ack");
            }
        }
    }

    async fn reply(&self, bytes: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(bytes, to).await {
            warn!(to = %to, error = %e, "unable to answer gateway");
        }
    }

    fn spawn_uplink(&self, packet: Packet, version: u8) {
        let router = self.router.clone();
        let up = self.up.clone();
        let socket = self.socket.clone();
        let keeper = self.keeper.clone();
        let timeout = self.response_timeout;
        tokio::spawn(async move {
            let data = match marshal(&packet) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "unable to marshal uplink");
                    return;
                }
            };
            let (an, rx) = OneshotAckNacker::pair();
            if tokio::time::timeout(timeout, router.handle_up(&data, &an, up.as_ref()))
                .await
                .is_err()
            {
                debug!("uplink not answered in time");
                return;
            }
            let answer = match rx.wait(timeout).await {
                Ok(Some(Packet::R(answer))) => answer,
                Ok(_) => return,
                Err(e) => {
                    debug!(kind = ?e.kind, error = %e, "uplink not answered");
                    return;
                }
            };
            let Some(addr) = keeper.get(answer.gateway_id) else {
                warn!(gateway = %answer.gateway_id, "no pull address for downlink gateway");
                return;
            };
            let datagram = downlink_txpk(&answer)
                .and_then(|txpk| pull_resp(version, [0, 0], &txpk).map_err(|e| e.to_string()));
            match datagram {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, addr).await {
                        warn!(to = %addr, error = %e, "unable to send downlink");
                    }
                }
                Err(e) => {
                    warn!(gateway = %answer.gateway_id, error = %e, "unable to build pull_resp");
                }
            }
        });
    }
}
