use lw_core::{AesKey, DevAddr, Eui64, MType, MacPayload, PhyPayload};
use lw_protocol::Metadata;

/// Identity and session keys of a personalized test device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeys {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub nwk_skey: AesKey,
    pub app_skey: AesKey,
}

impl DeviceKeys {
    /// Deterministic keys derived from `seed`; devices with different seeds
    /// share the device address `26 01 1a 2b`.
    pub fn sample(seed: u8) -> Self {
        Self {
            app_eui: Eui64([0x70, 0xb3, 0xd5, 0x7e, 0xd0, 0, 0, seed]),
            dev_eui: Eui64([0x00, 0x04, 0xa3, 0x0b, 0x00, 0x1c, 0x05, seed]),
            dev_addr: DevAddr([0x26, 0x01, 0x1a, 0x2b]),
            nwk_skey: AesKey([seed.wrapping_mul(3).wrapping_add(1); 16]),
            app_skey: AesKey([seed.wrapping_mul(5).wrapping_add(2); 16]),
        }
    }

    pub fn with_dev_addr(mut self, dev_addr: DevAddr) -> Self {
        self.dev_addr = dev_addr;
        self
    }
}

/// An encrypted, MIC-signed uplink on FPort 1 with full counter `fcnt`.
pub fn uplink_frame(keys: &DeviceKeys, fcnt: u32, clear: &[u8], confirmed: bool) -> PhyPayload {
    let mut mac = MacPayload::new(keys.dev_addr, fcnt);
    mac.fport = Some(1);
    mac.frm_payload = clear.to_vec();
    let mtype = if confirmed {
        MType::ConfirmedDataUp
    } else {
        MType::UnconfirmedDataUp
    };
    let mut phy = PhyPayload::data(mtype, mac);
    phy.encrypt_frm_payload(&keys.app_skey);
    phy.set_mic(&keys.nwk_skey).unwrap();
    phy
}

/// Gateway metadata of an EU868 uplink at SF7BW125.
pub fn eu_metadata(freq: f64, rssi: i32, lsnr: f64) -> Metadata {
    Metadata {
        chan: Some(0),
        codr: Some("4/5".to_owned()),
        datr: Some("SF7BW125".to_owned()),
        freq: Some(freq),
        lsnr: Some(lsnr),
        modu: Some("LORA".to_owned()),
        rfch: Some(0),
        rssi: Some(rssi),
        size: Some(20),
        stat: Some(1),
        tmst: Some(3_512_348_611),
        ..Metadata::default()
    }
}
