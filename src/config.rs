//! Stack configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/lorawan-stack/stack.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has a default. `[[devices]]` entries are ABP
//! personalizations applied at startup; all their fields are required and
//! written as hex strings.

use lw_core::{AesKey, DevAddr, Eui64};
use lw_dutycycle::Region;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lorawan-stack/stack.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub schema_version: u32,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub router: RouterConfig,
    pub handler: HandlerConfig,
    pub transport: TransportConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// SemTech UDP listen address.
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub dir: PathBuf,
}

impl StorageConfig {
    pub fn router_path(&self) -> PathBuf {
        self.dir.join("router.sqlite3")
    }

    pub fn duty_path(&self) -> PathBuf {
        self.dir.join("duty.sqlite3")
    }

    pub fn broker_path(&self) -> PathBuf {
        self.dir.join("broker.sqlite3")
    }

    pub fn handler_path(&self) -> PathBuf {
        self.dir.join("handler.sqlite3")
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub routing_expiry: Duration,
    pub duty_cycle: Duration,
    pub region: Region,
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub bundle_delay: Duration,
    pub processed_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub response_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub nwk_skey: AesKey,
    pub app_skey: AesKey,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    gateway: Option<RawGatewayConfig>,
    storage: Option<RawStorageConfig>,
    router: Option<RawRouterConfig>,
    handler: Option<RawHandlerConfig>,
    transport: Option<RawTransportConfig>,
    devices: Option<Vec<RawDeviceConfig>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGatewayConfig {
    bind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorageConfig {
    dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRouterConfig {
    routing_expiry_secs: Option<u64>,
    duty_cycle_secs: Option<u64>,
    region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHandlerConfig {
    bundle_delay_ms: Option<u64>,
    processed_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTransportConfig {
    response_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    app_eui: Option<String>,
    dev_eui: Option<String>,
    dev_addr: Option<String>,
    nwk_skey: Option<String>,
    app_skey: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<StackConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<StackConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let gateway = raw.gateway.unwrap_or_default();
    let storage = raw.storage.unwrap_or_default();
    let router = raw.router.unwrap_or_default();
    let handler = raw.handler.unwrap_or_default();
    let transport = raw.transport.unwrap_or_default();

    let region_name = router.region.unwrap_or_else(|| "europe".to_owned());
    let region = Region::from_str(&region_name)
        .map_err(|e| ConfigError::InvalidValue(format!("router.region: {e}")))?;

    let processed_capacity = handler.processed_capacity.unwrap_or(10_000);
    if processed_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "handler.processed_capacity must be greater than 0".to_owned(),
        ));
    }

    let mut devices = Vec::new();
    for (i, d) in raw.devices.unwrap_or_default().into_iter().enumerate() {
        devices.push(DeviceConfig {
            app_eui: parse_field(d.app_eui, i, "app_eui")?,
            dev_eui: parse_field(d.dev_eui, i, "dev_eui")?,
            dev_addr: parse_field(d.dev_addr, i, "dev_addr")?,
            nwk_skey: parse_field(d.nwk_skey, i, "nwk_skey")?,
            app_skey: parse_field(d.app_skey, i, "app_skey")?,
        });
    }

    Ok(StackConfig {
        schema_version,
        gateway: GatewayConfig {
            bind: gateway.bind.unwrap_or_else(|| "0.0.0.0:1700".to_owned()),
        },
        storage: StorageConfig {
            dir: PathBuf::from(
                storage
                    .dir
                    .unwrap_or_else(|| "/var/lib/lorawan-stack".to_owned()),
            ),
        },
        router: RouterConfig {
            routing_expiry: Duration::from_secs(router.routing_expiry_secs.unwrap_or(28_800)),
            duty_cycle: Duration::from_secs(router.duty_cycle_secs.unwrap_or(3_600)),
            region,
        },
        handler: HandlerConfig {
            bundle_delay: Duration::from_millis(handler.bundle_delay_ms.unwrap_or(300)),
            processed_capacity,
        },
        transport: TransportConfig {
            response_timeout: Duration::from_millis(transport.response_timeout_ms.unwrap_or(2_000)),
        },
        devices,
    })
}

fn parse_field<T>(value: Option<String>, index: usize, name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = value.ok_or_else(|| ConfigError::MissingField(format!("devices[{index}].{name}")))?;
    value
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("devices[{index}].{name}: {e}")))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
