use std::fmt;

use lw_core::{AesKey, DevAddr, Eui64};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque transport address of a component endpoint. Only the transport
/// layer interprets the bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Recipient(pub Vec<u8>);

impl Recipient {
    pub fn from_name(name: &str) -> Self {
        Recipient(name.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => f.write_str(&hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Recipient({self})")
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map(Recipient).map_err(serde::de::Error::custom)
    }
}

/// How a Handler device obtains its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Activation {
    Abp {
        dev_addr: DevAddr,
        nwk_skey: AesKey,
        app_skey: AesKey,
    },
    Otaa {
        app_key: AesKey,
    },
}

/// Registration requests, one variant per receiving component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Registration {
    /// Router: route uplinks of `dev_eui` to `recipient` (a Broker).
    Router { dev_eui: Eui64, recipient: Recipient },
    /// Broker: a personalized device served by the Handler at `recipient`.
    Broker {
        app_eui: Eui64,
        dev_eui: Eui64,
        dev_addr: DevAddr,
        nwk_skey: AesKey,
        recipient: Recipient,
    },
    /// Broker: an application served by the Handler at `recipient`.
    Application { app_eui: Eui64, recipient: Recipient },
    /// Handler: a device of one of its applications.
    Handler {
        app_eui: Eui64,
        dev_eui: Eui64,
        activation: Activation,
    },
}

impl Registration {
    pub fn kind(&self) -> &'static str {
        match self {
            Registration::Router { .. } => "router",
            Registration::Broker { .. } => "broker",
            Registration::Application { .. } => "application",
            Registration::Handler { .. } => "handler",
        }
    }
}
