//! Packet variants exchanged between pipeline components.
//!
//! Every packet travels as a JSON [`Envelope`]: a `version` and a packet
//! object discriminated by its `kind` field. PHYPayloads are carried as
//! base64 next to their full 32-bit frame counter, which the 16-bit wire
//! encoding cannot hold.

use lw_core::{Eui64, MType, PhyPayload};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::metadata::{GatewayStats, Metadata};

pub const WIRE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Gateway-level packet: what the Router receives from a gateway, and what
/// it hands back to the gateway side as a downlink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RPacket {
    pub gateway_id: Eui64,
    #[serde(with = "phy_serde")]
    pub payload: PhyPayload,
    pub metadata: Metadata,
}

/// Broker-level packet: radio payload plus duty-annotated metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BPacket {
    #[serde(with = "phy_serde")]
    pub payload: PhyPayload,
    pub metadata: Metadata,
}

/// Handler-level packet, addressed by the identity the Broker resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HPacket {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    #[serde(with = "phy_serde")]
    pub payload: PhyPayload,
    pub metadata: Metadata,
}

/// Application-level packet: cleartext payload and one metadata record per
/// gateway that saw the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct APacket {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    #[serde(with = "bytes_serde")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

/// Join request as received from a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JPacket {
    pub gateway_id: Eui64,
    #[serde(with = "phy_serde")]
    pub payload: PhyPayload,
    pub metadata: Metadata,
}

/// Gateway status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SPacket {
    pub gateway_id: Eui64,
    pub stats: GatewayStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Packet {
    #[serde(rename = "rpacket")]
    R(RPacket),
    #[serde(rename = "bpacket")]
    B(BPacket),
    #[serde(rename = "hpacket")]
    H(HPacket),
    #[serde(rename = "apacket")]
    A(APacket),
    #[serde(rename = "jpacket")]
    J(JPacket),
    #[serde(rename = "spacket")]
    S(SPacket),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::R(_) => "rpacket",
            Packet::B(_) => "bpacket",
            Packet::H(_) => "hpacket",
            Packet::A(_) => "apacket",
            Packet::J(_) => "jpacket",
            Packet::S(_) => "spacket",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    packet: Packet,
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

/// The EUI under which an uplink is routed: the DevEUI of a join request,
/// or the zero-padded DevAddr of a data frame.
fn routing_eui(payload: &PhyPayload) -> Option<Eui64> {
    match &payload.payload {
        lw_core::FramePayload::Mac(mac) => Some(mac.dev_addr.to_eui()),
        lw_core::FramePayload::JoinRequest(join) => Some(join.dev_eui),
        lw_core::FramePayload::Raw(_) => None,
    }
}

impl RPacket {
    pub fn dev_eui(&self) -> Option<Eui64> {
        routing_eui(&self.payload)
    }
}

impl BPacket {
    pub fn dev_eui(&self) -> Option<Eui64> {
        routing_eui(&self.payload)
    }

    /// Frame counter as carried on the wire.
    pub fn wire_fcnt(&self) -> Option<u16> {
        self.payload.mac_payload().map(lw_core::MacPayload::wire_fcnt)
    }

    /// Full counter computed against a stored baseline; see
    /// [`whole_counter`].
    pub fn compute_fcnt(&self, baseline: u32) -> Result<u32> {
        let wire = self
            .wire_fcnt()
            .ok_or_else(|| Error::structural("frame carries no counter"))?;
        whole_counter(wire, baseline)
    }
}

impl HPacket {
    pub fn fcnt(&self) -> Option<u32> {
        self.payload.fcnt()
    }

    pub fn is_confirmed(&self) -> bool {
        self.payload.mtype() == MType::ConfirmedDataUp
    }
}

/// Reconciles a 16-bit wire counter with the last stored 32-bit counter.
///
/// The counter may only move forward, by at most a quarter of the 16-bit
/// space; larger gaps are treated as a reset or a replay. The 32-bit
/// counter rolls over past `u32::MAX`.
pub fn whole_counter(dev_cnt: u16, entry_cnt: u32) -> Result<u32> {
    const UPPER_SUP: i64 = 1 << 16;
    let diff = i64::from(dev_cnt) - i64::from(entry_cnt) % UPPER_SUP;
    let offset = if diff >= 0 { diff } else { UPPER_SUP + diff };
    if offset > UPPER_SUP / 4 {
        return Err(Error::structural("gap too big, counter is errored"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(entry_cnt.wrapping_add(offset as u32))
}

/// The later of two full counters, comparing across the 32-bit rollover.
pub fn advance_counter(stored: u32, candidate: u32) -> u32 {
    if candidate.wrapping_sub(stored) < 1 << 31 {
        candidate
    } else {
        stored
    }
}

// ---------------------------------------------------------------------------
// Marshalling
// ---------------------------------------------------------------------------

pub fn marshal(packet: &Packet) -> Result<Vec<u8>> {
    serde_json::to_vec(&Envelope {
        version: WIRE_VERSION,
        packet: packet.clone(),
    })
    .map_err(|e| Error::structural(format!("unable to marshal {}: {e}", packet.kind())))
}

pub fn unmarshal(data: &[u8]) -> Result<Packet> {
    let envelope: Envelope = serde_json::from_slice(data)
        .map_err(|e| Error::structural(format!("unable to unmarshal packet: {e}")))?;
    if envelope.version != WIRE_VERSION {
        return Err(Error::structural(format!(
            "unsupported packet version {}",
            envelope.version
        )));
    }
    Ok(envelope.packet)
}

mod phy_serde {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use lw_core::PhyPayload;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct PhyWire {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fcnt: Option<u32>,
    }

    pub fn serialize<S: Serializer>(phy: &PhyPayload, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = phy.encode().map_err(serde::ser::Error::custom)?;
        PhyWire {
            data: B64.encode(bytes),
            fcnt: phy.fcnt(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PhyPayload, D::Error> {
        let wire = PhyWire::deserialize(deserializer)?;
        let bytes = B64.decode(wire.data).map_err(serde::de::Error::custom)?;
        let mut phy = PhyPayload::decode(&bytes).map_err(serde::de::Error::custom)?;
        if let Some(fcnt) = wire.fcnt {
            phy.set_fcnt(fcnt);
        }
        Ok(phy)
    }
}

mod bytes_serde {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        B64.decode(s).map_err(serde::de::Error::custom)
    }
}
