use lw_core::Eui64;
use serde::{Deserialize, Serialize};

/// Availability of a sub-band for a downlink, derived from its duty-cycle
/// usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutyState {
    HighlyAvailable,
    Available,
    Warning,
    Blocked,
}

/// Radio metadata attached to a packet on its way through the pipeline.
///
/// Field names follow the SemTech `rxpk`/`txpk` vocabulary. `duty_rx1` and
/// `duty_rx2` are added by the Router; `gateway` records which gateway saw
/// the uplink (and therefore which one must send the answer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duty_rx1: Option<DutyState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duty_rx2: Option<DutyState>,
    /// MHz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imme: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powe: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Concentrator internal timestamp, microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Eui64>,
}

/// Gateway status report (SemTech `stat` object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alti: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rxnb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rxok: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rxfw: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ackr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwnb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txnb: Option<u32>,
}
