//! Handler device store and per-device downlink queue.

use lw_core::{AesKey, DevAddr, Eui64};
use lw_protocol::{Error, Result};
use lw_storage::{Batch, KvStore, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const DEVICES: &str = "devices";
const DOWNLINKS: &str = "downlinks";

/// A device of one of the Handler's applications.
///
/// `app_key` is `None` for personalized (ABP) devices and set for OTAA
/// devices, whose session fields stay zeroed until a join completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDevice {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub app_skey: AesKey,
    pub nwk_skey: AesKey,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    #[serde(default)]
    pub app_key: Option<AesKey>,
}

impl HandlerDevice {
    pub fn is_abp(&self) -> bool {
        self.app_key.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedDownlink {
    payload: Vec<u8>,
}

fn device_key(app_eui: Eui64, dev_eui: Eui64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(app_eui.as_bytes());
    key[8..].copy_from_slice(dev_eui.as_bytes());
    key
}

pub struct DevStorage {
    store: Mutex<KvStore>,
}

impl DevStorage {
    pub fn new(store: KvStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub async fn lookup(&self, app_eui: Eui64, dev_eui: Eui64) -> Result<HandlerDevice> {
        let store = self.store.lock().await;
        Self::read(&store, app_eui, dev_eui)
    }

    fn read(store: &KvStore, app_eui: Eui64, dev_eui: Eui64) -> Result<HandlerDevice> {
        let entries: Vec<HandlerDevice> = match store.lookup(DEVICES, &device_key(app_eui, dev_eui))
        {
            Ok(entries) => entries,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("device {app_eui}/{dev_eui} is not registered")))
    }

    /// Personalizes a device. Counters are kept when the session keys and
    /// address are unchanged, reset otherwise.
    pub async fn upsert_abp(
        &self,
        app_eui: Eui64,
        dev_eui: Eui64,
        dev_addr: DevAddr,
        nwk_skey: AesKey,
        app_skey: AesKey,
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        let (fcnt_up, fcnt_down) = match Self::read(&store, app_eui, dev_eui) {
            Ok(old)
                if old.dev_addr == dev_addr
                    && old.nwk_skey == nwk_skey
                    && old.app_skey == app_skey =>
            {
                (old.fcnt_up, old.fcnt_down)
            }
            Ok(_) => (0, 0),
            Err(e) if e.is_not_found() => (0, 0),
            Err(e) => return Err(e),
        };
        let device = HandlerDevice {
            app_eui,
            dev_eui,
            dev_addr,
            app_skey,
            nwk_skey,
            fcnt_up,
            fcnt_down,
            app_key: None,
        };
        store.replace(DEVICES, &device_key(app_eui, dev_eui), &[device])?;
        Ok(())
    }

    /// Registers an over-the-air activated device with its root key.
    pub async fn upsert_otaa(&self, app_eui: Eui64, dev_eui: Eui64, app_key: AesKey) -> Result<()> {
        let mut store = self.store.lock().await;
        let device = HandlerDevice {
            app_eui,
            dev_eui,
            dev_addr: DevAddr::default(),
            app_skey: AesKey::default(),
            nwk_skey: AesKey::default(),
            fcnt_up: 0,
            fcnt_down: 0,
            app_key: Some(app_key),
        };
        store.replace(DEVICES, &device_key(app_eui, dev_eui), &[device])?;
        Ok(())
    }

    /// Appends a cleartext downlink to the device's queue.
    pub async fn push(&self, app_eui: Eui64, dev_eui: Eui64, payload: Vec<u8>) -> Result<()> {
        let mut store = self.store.lock().await;
        store.store(
            DOWNLINKS,
            &device_key(app_eui, dev_eui),
            &[QueuedDownlink { payload }],
        )?;
        Ok(())
    }

    /// The oldest queued downlink, left in the queue; `NotFound` when the
    /// queue is empty.
    pub async fn peek(&self, app_eui: Eui64, dev_eui: Eui64) -> Result<Vec<u8>> {
        let store = self.store.lock().await;
        let queue = Self::queue(&store, app_eui, dev_eui)?;
        queue
            .into_iter()
            .next()
            .map(|head| head.payload)
            .ok_or_else(|| Error::not_found(format!("no downlink queued for {dev_eui}")))
    }

    /// Writes back the counters of `device` and, when `sent` is set, drops
    /// the head of its downlink queue, both or neither.
    pub async fn commit_uplink(&self, device: &HandlerDevice, sent: bool) -> Result<()> {
        let mut store = self.store.lock().await;
        let mut batch = store.batch()?;
        if sent {
            Self::pop(&mut batch, device.app_eui, device.dev_eui)?;
        }
        batch.replace(
            DEVICES,
            &device_key(device.app_eui, device.dev_eui),
            std::slice::from_ref(device),
        )?;
        batch.commit()?;
        Ok(())
    }

    fn queue(store: &KvStore, app_eui: Eui64, dev_eui: Eui64) -> Result<Vec<QueuedDownlink>> {
        store
            .lookup(DOWNLINKS, &device_key(app_eui, dev_eui))
            .map_err(|e| match e {
                StorageError::NotFound(_) => {
                    Error::not_found(format!("no downlink queued for {dev_eui}"))
                }
                other => other.into(),
            })
    }

    fn pop(batch: &mut Batch<'_>, app_eui: Eui64, dev_eui: Eui64) -> Result<()> {
        let key = device_key(app_eui, dev_eui);
        let mut queue: Vec<QueuedDownlink> = batch.lookup(DOWNLINKS, &key)?;
        queue.remove(0);
        if queue.is_empty() {
            batch.flush(DOWNLINKS, &key)?;
        } else {
            batch.replace(DOWNLINKS, &key, &queue)?;
        }
        Ok(())
    }
}
