// lw-core: LoRaWAN primitives shared by the router, broker and handler.
//
// Identifiers (EUI-64, device address, AES-128 keys), the PHYPayload frame
// codec, the MIC / FRMPayload crypto and datarate parsing.

pub mod crypto;
pub mod datarate;
pub mod frame;
pub mod types;

pub use datarate::{CodingRate, DataRate};
pub use frame::{CodecError, FCtrl, FramePayload, JoinRequest, MType, MacPayload, Mhdr, PhyPayload};
pub use types::{AesKey, DevAddr, Eui64, ParseIdError};
