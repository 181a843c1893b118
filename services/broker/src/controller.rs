//! Network controller: the Broker's device and application bindings.
//!
//! Device entries are keyed by the zero-padded device address, so devices of
//! different applications that share an address live under one key. Every
//! mutation reads, filters and rewrites the sets it touches inside a single
//! storage batch, so a device moving between addresses is never left
//! half-moved.

use lw_core::{AesKey, DevAddr, Eui64};
use lw_protocol::{Error, Recipient, Result, advance_counter};
use lw_storage::{Batch, KvStore, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

const DEVICES: &str = "devices";
const APPLICATIONS: &str = "applications";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub recipient: Recipient,
    pub nwk_skey: AesKey,
    /// Last accepted full uplink counter.
    pub fcnt_up: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEntry {
    pub app_eui: Eui64,
    pub recipient: Recipient,
}

pub struct NetworkController {
    store: Mutex<KvStore>,
}

fn read_all<T: serde::de::DeserializeOwned>(
    batch: &Batch<'_>,
    bucket: &str,
    key: &[u8],
) -> Result<Vec<T>> {
    match batch.lookup(bucket, key) {
        Ok(entries) => Ok(entries),
        Err(StorageError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

impl NetworkController {
    pub fn new(store: KvStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    /// Every device currently using `dev_addr`; `NotFound` when none.
    pub async fn lookup_devices(&self, dev_addr: DevAddr) -> Result<Vec<DeviceEntry>> {
        let store = self.store.lock().await;
        store
            .lookup(DEVICES, dev_addr.to_eui().as_bytes())
            .map_err(|e| match e {
                StorageError::NotFound(_) => {
                    Error::not_found(format!("no device registered for {dev_addr}"))
                }
                other => other.into(),
            })
    }

    /// Inserts or replaces the device identified by `app_eui`/`dev_eui`.
    ///
    /// A device moving to a new address is removed from its old one. The
    /// counter survives only when the session key is unchanged. On failure
    /// no binding changes.
    pub async fn store_device(&self, entry: DeviceEntry) -> Result<()> {
        let mut store = self.store.lock().await;
        let mut batch = store.batch()?;
        let key = entry.dev_addr.to_eui();

        for old_key in batch.keys(DEVICES)? {
            if old_key.as_slice() == key.as_bytes() {
                continue;
            }
            let siblings: Vec<DeviceEntry> = read_all(&batch, DEVICES, &old_key)?;
            let before = siblings.len();
            let kept: Vec<DeviceEntry> = siblings
                .into_iter()
                .filter(|d| !(d.app_eui == entry.app_eui && d.dev_eui == entry.dev_eui))
                .collect();
            if kept.len() != before {
                debug!(dev_eui = %entry.dev_eui, "device changed address");
                if kept.is_empty() {
                    batch.flush(DEVICES, &old_key)?;
                } else {
                    batch.replace(DEVICES, &old_key, &kept)?;
                }
            }
        }

        let mut entries: Vec<DeviceEntry> = read_all(&batch, DEVICES, key.as_bytes())?;
        let fcnt_up = entries
            .iter()
            .find(|d| d.app_eui == entry.app_eui && d.dev_eui == entry.dev_eui)
            .filter(|d| d.nwk_skey == entry.nwk_skey)
            .map_or(0, |d| d.fcnt_up);
        entries.retain(|d| !(d.app_eui == entry.app_eui && d.dev_eui == entry.dev_eui));
        entries.push(DeviceEntry { fcnt_up, ..entry });
        batch.replace(DEVICES, key.as_bytes(), &entries)?;
        batch.commit()?;
        Ok(())
    }

    /// Records `fcnt` as the last accepted counter of `app_eui`/`dev_eui`,
    /// unless a newer counter was recorded meanwhile.
    pub async fn update_fcnt(
        &self,
        app_eui: Eui64,
        dev_eui: Eui64,
        dev_addr: DevAddr,
        fcnt: u32,
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        let mut batch = store.batch()?;
        let key = dev_addr.to_eui();
        let mut entries: Vec<DeviceEntry> = read_all(&batch, DEVICES, key.as_bytes())?;
        let entry = entries
            .iter_mut()
            .find(|d| d.app_eui == app_eui && d.dev_eui == dev_eui)
            .ok_or_else(|| Error::not_found(format!("device {dev_eui} vanished")))?;
        let advanced = advance_counter(entry.fcnt_up, fcnt);
        if advanced == entry.fcnt_up {
            return Ok(());
        }
        entry.fcnt_up = advanced;
        batch.replace(DEVICES, key.as_bytes(), &entries)?;
        batch.commit()?;
        Ok(())
    }

    /// Binds `entry.app_eui` to its Handler and returns the binding it
    /// replaced, if any.
    pub async fn store_application(
        &self,
        entry: ApplicationEntry,
    ) -> Result<Option<ApplicationEntry>> {
        let mut store = self.store.lock().await;
        let mut batch = store.batch()?;
        let previous: Vec<ApplicationEntry> =
            read_all(&batch, APPLICATIONS, entry.app_eui.as_bytes())?;
        batch.replace(APPLICATIONS, entry.app_eui.as_bytes(), std::slice::from_ref(&entry))?;
        batch.commit()?;
        Ok(previous.into_iter().next())
    }
}
