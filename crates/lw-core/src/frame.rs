//! LoRaWAN 1.0 PHYPayload codec.
//!
//! ```text
//! PHYPayload = MHDR | MACPayload | MIC
//! MACPayload = FHDR | FPort? | FRMPayload
//! FHDR       = DevAddr(4, LE) | FCtrl(1) | FCnt(2, LE) | FOpts(0..15)
//! JoinReq    = AppEUI(8, LE) | DevEUI(8, LE) | DevNonce(2)
//! ```
//!
//! Only the low 16 bits of the frame counter go over the air. [`MacPayload`]
//! keeps a full 32-bit counter so that the MIC, which is computed over the
//! 32-bit value, can be checked once the counter has been reconciled.

use crate::crypto::{self, Direction};
use crate::types::{AesKey, DevAddr, Eui64};

const MIC_LEN: usize = 4;
const FHDR_MIN_LEN: usize = 7;
const JOIN_REQUEST_LEN: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame too short: need at least {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("FOpts length {0} exceeds the frame")]
    BadFOptsLen(usize),
    #[error("FOpts longer than 15 bytes")]
    FOptsTooLong,
    #[error("no MIC defined for {0:?} frames")]
    NoMic(MType),
    #[error("invalid datarate: {0}")]
    InvalidDataRate(String),
    #[error("invalid coding rate: {0}")]
    InvalidCodingRate(String),
}

// ---------------------------------------------------------------------------
// MAC header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Rfu,
    Proprietary,
}

impl MType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }

    fn bits(self) -> u8 {
        match self {
            MType::JoinRequest => 0,
            MType::JoinAccept => 1,
            MType::UnconfirmedDataUp => 2,
            MType::UnconfirmedDataDown => 3,
            MType::ConfirmedDataUp => 4,
            MType::ConfirmedDataDown => 5,
            MType::Rfu => 6,
            MType::Proprietary => 7,
        }
    }

    pub fn is_data(self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }

    pub fn is_uplink(self) -> bool {
        matches!(
            self,
            MType::JoinRequest | MType::UnconfirmedDataUp | MType::ConfirmedDataUp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    pub mtype: MType,
    pub major: u8,
}

impl Mhdr {
    pub fn new(mtype: MType) -> Self {
        Self { mtype, major: 0 }
    }

    fn to_byte(self) -> u8 {
        (self.mtype.bits() << 5) | (self.major & 0x03)
    }

    fn from_byte(b: u8) -> Self {
        Self {
            mtype: MType::from_bits(b >> 5),
            major: b & 0x03,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame header
// ---------------------------------------------------------------------------

/// Frame control flags. The FOpts length nibble is derived from
/// [`MacPayload::fopts`] when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub fpending: bool,
}

impl FCtrl {
    fn to_byte(self, fopts_len: u8) -> u8 {
        let mut b = fopts_len & 0x0f;
        if self.adr {
            b |= 0x80;
        }
        if self.adr_ack_req {
            b |= 0x40;
        }
        if self.ack {
            b |= 0x20;
        }
        if self.fpending {
            b |= 0x10;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            adr: b & 0x80 != 0,
            adr_ack_req: b & 0x40 != 0,
            ack: b & 0x20 != 0,
            fpending: b & 0x10 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacPayload {
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    /// Full frame counter; only the low 16 bits are encoded.
    pub fcnt: u32,
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    pub frm_payload: Vec<u8>,
}

impl MacPayload {
    pub fn new(dev_addr: DevAddr, fcnt: u32) -> Self {
        Self {
            dev_addr,
            fctrl: FCtrl::default(),
            fcnt,
            fopts: Vec::new(),
            fport: None,
            frm_payload: Vec::new(),
        }
    }

    /// Counter value as transmitted.
    #[allow(clippy::cast_possible_truncation)]
    pub fn wire_fcnt(&self) -> u16 {
        self.fcnt as u16
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.fopts.len() > 15 {
            return Err(CodecError::FOptsTooLong);
        }
        let mut addr = self.dev_addr.0;
        addr.reverse();
        out.extend_from_slice(&addr);
        #[allow(clippy::cast_possible_truncation)]
        out.push(self.fctrl.to_byte(self.fopts.len() as u8));
        out.extend_from_slice(&self.wire_fcnt().to_le_bytes());
        out.extend_from_slice(&self.fopts);
        if let Some(port) = self.fport {
            out.push(port);
            out.extend_from_slice(&self.frm_payload);
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < FHDR_MIN_LEN {
            return Err(CodecError::TooShort {
                needed: FHDR_MIN_LEN,
                got: bytes.len(),
            });
        }
        let dev_addr = DevAddr([bytes[3], bytes[2], bytes[1], bytes[0]]);
        let fctrl = FCtrl::from_byte(bytes[4]);
        let fopts_len = usize::from(bytes[4] & 0x0f);
        let fcnt = u16::from_le_bytes([bytes[5], bytes[6]]);
        let rest = &bytes[FHDR_MIN_LEN..];
        if rest.len() < fopts_len {
            return Err(CodecError::BadFOptsLen(fopts_len));
        }
        let (fopts, rest) = rest.split_at(fopts_len);
        let (fport, frm_payload) = match rest.split_first() {
            Some((port, payload)) => (Some(*port), payload.to_vec()),
            None => (None, Vec::new()),
        };
        Ok(Self {
            dev_addr,
            fctrl,
            fcnt: u32::from(fcnt),
            fopts: fopts.to_vec(),
            fport,
            frm_payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: [u8; 2],
}

impl JoinRequest {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend(self.app_eui.0.iter().rev());
        out.extend(self.dev_eui.0.iter().rev());
        out.extend_from_slice(&self.dev_nonce);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != JOIN_REQUEST_LEN {
            return Err(CodecError::TooShort {
                needed: JOIN_REQUEST_LEN,
                got: bytes.len(),
            });
        }
        let mut app_eui = [0u8; 8];
        let mut dev_eui = [0u8; 8];
        app_eui.copy_from_slice(&bytes[0..8]);
        dev_eui.copy_from_slice(&bytes[8..16]);
        app_eui.reverse();
        dev_eui.reverse();
        Ok(Self {
            app_eui: Eui64(app_eui),
            dev_eui: Eui64(dev_eui),
            dev_nonce: [bytes[16], bytes[17]],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Mac(MacPayload),
    JoinRequest(JoinRequest),
    /// Join-accept (still encrypted), RFU and proprietary bodies.
    Raw(Vec<u8>),
}

// ---------------------------------------------------------------------------
// PHYPayload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyPayload {
    pub mhdr: Mhdr,
    pub payload: FramePayload,
    pub mic: [u8; 4],
}

impl PhyPayload {
    /// A data frame with an unset MIC.
    pub fn data(mtype: MType, mac: MacPayload) -> Self {
        Self {
            mhdr: Mhdr::new(mtype),
            payload: FramePayload::Mac(mac),
            mic: [0; 4],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 1 + MIC_LEN {
            return Err(CodecError::TooShort {
                needed: 1 + MIC_LEN,
                got: bytes.len(),
            });
        }
        let mhdr = Mhdr::from_byte(bytes[0]);
        let body = &bytes[1..bytes.len() - MIC_LEN];
        let mut mic = [0u8; 4];
        mic.copy_from_slice(&bytes[bytes.len() - MIC_LEN..]);
        let payload = match mhdr.mtype {
            MType::JoinRequest => FramePayload::JoinRequest(JoinRequest::decode(body)?),
            t if t.is_data() => FramePayload::Mac(MacPayload::decode(body)?),
            _ => FramePayload::Raw(body.to_vec()),
        };
        Ok(Self { mhdr, payload, mic })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = self.mic_input()?;
        out.extend_from_slice(&self.mic);
        Ok(out)
    }

    fn mic_input(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![self.mhdr.to_byte()];
        match &self.payload {
            FramePayload::Mac(mac) => mac.encode_into(&mut out)?,
            FramePayload::JoinRequest(join) => join.encode_into(&mut out),
            FramePayload::Raw(body) => out.extend_from_slice(body),
        }
        Ok(out)
    }

    pub fn mtype(&self) -> MType {
        self.mhdr.mtype
    }

    pub fn is_uplink(&self) -> bool {
        self.mhdr.mtype.is_uplink()
    }

    pub fn mac_payload(&self) -> Option<&MacPayload> {
        match &self.payload {
            FramePayload::Mac(mac) => Some(mac),
            _ => None,
        }
    }

    pub fn mac_payload_mut(&mut self) -> Option<&mut MacPayload> {
        match &mut self.payload {
            FramePayload::Mac(mac) => Some(mac),
            _ => None,
        }
    }

    pub fn dev_addr(&self) -> Option<DevAddr> {
        self.mac_payload().map(|m| m.dev_addr)
    }

    pub fn fcnt(&self) -> Option<u32> {
        self.mac_payload().map(|m| m.fcnt)
    }

    /// Replaces the full frame counter (after reconciliation). No-op on
    /// frames without a MAC payload.
    pub fn set_fcnt(&mut self, fcnt: u32) {
        if let Some(mac) = self.mac_payload_mut() {
            mac.fcnt = fcnt;
        }
    }

    fn direction(&self) -> Direction {
        if self.is_uplink() {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    /// Computes the MIC with the NwkSKey (data frames) or the AppKey (join
    /// requests).
    pub fn compute_mic(&self, key: &AesKey) -> Result<[u8; 4], CodecError> {
        let msg = self.mic_input()?;
        match &self.payload {
            FramePayload::Mac(mac) => Ok(crypto::data_mic(
                key,
                self.direction(),
                mac.dev_addr,
                mac.fcnt,
                &msg,
            )),
            FramePayload::JoinRequest(_) => Ok(crypto::join_mic(key, &msg)),
            FramePayload::Raw(_) => Err(CodecError::NoMic(self.mhdr.mtype)),
        }
    }

    pub fn validate_mic(&self, key: &AesKey) -> Result<bool, CodecError> {
        Ok(self.compute_mic(key)? == self.mic)
    }

    pub fn set_mic(&mut self, key: &AesKey) -> Result<(), CodecError> {
        self.mic = self.compute_mic(key)?;
        Ok(())
    }

    /// Session key protecting the FRMPayload: FPort 0 carries MAC commands
    /// under the NwkSKey, any other port uses the AppSKey.
    pub fn payload_key<'k>(&self, nwk_skey: &'k AesKey, app_skey: &'k AesKey) -> &'k AesKey {
        match self.mac_payload().and_then(|mac| mac.fport) {
            Some(0) => nwk_skey,
            _ => app_skey,
        }
    }

    /// Encrypts the FRMPayload in place with `key`, normally the one picked
    /// by [`payload_key`](Self::payload_key).
    pub fn encrypt_frm_payload(&mut self, key: &AesKey) {
        let dir = self.direction();
        if let Some(mac) = self.mac_payload_mut() {
            mac.frm_payload =
                crypto::encrypt_frm_payload(key, dir, mac.dev_addr, mac.fcnt, &mac.frm_payload);
        }
    }

    /// Returns the cleartext FRMPayload, leaving the frame untouched.
    pub fn decrypt_frm_payload(&self, key: &AesKey) -> Option<Vec<u8>> {
        let mac = self.mac_payload()?;
        Some(crypto::encrypt_frm_payload(
            key,
            self.direction(),
            mac.dev_addr,
            mac.fcnt,
            &mac.frm_payload,
        ))
    }
}
