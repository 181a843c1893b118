//! Fixed-size LoRaWAN identifiers.
//!
//! All identifiers are stored most-significant byte first (the order in
//! which they are printed and configured). The frame codec takes care of
//! the little-endian order used on the radio link.
//!
//! Each type renders as lowercase hex and parses from hex (upper or lower
//! case); the serde representation is the same hex string so identifiers
//! can be written directly in TOML configuration and JSON packets.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error returned when an identifier cannot be parsed or built from bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what}: {reason}")]
pub struct ParseIdError {
    what: &'static str,
    reason: String,
}

macro_rules! fixed_bytes {
    ($name:ident, $len:expr, $what:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseIdError> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| ParseIdError {
                    what: $what,
                    reason: format!("expected {} bytes, got {}", $len, bytes.len()),
                })?;
                Ok(Self(array))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s.trim()).map_err(|e| ParseIdError {
                    what: $what,
                    reason: e.to_string(),
                })?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(Eui64, 8, "EUI-64");
fixed_bytes!(DevAddr, 4, "device address");
fixed_bytes!(AesKey, 16, "AES-128 key");

impl fmt::Debug for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eui64({self})")
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevAddr({self})")
    }
}

// Keys never show up in logs.
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

impl DevAddr {
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// The EUI-64 under which a device address is routed: four zero bytes
    /// followed by the address.
    pub fn to_eui(self) -> Eui64 {
        let mut eui = [0u8; 8];
        eui[4..].copy_from_slice(&self.0);
        Eui64(eui)
    }
}

impl From<u32> for DevAddr {
    fn from(value: u32) -> Self {
        DevAddr(value.to_be_bytes())
    }
}
