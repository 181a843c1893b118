//! Routing table: which Broker(s) own a device.
//!
//! Entries expire a fixed time after registration. Expiry is lazy: a lookup
//! drops expired entries and rewrites the stored set without them.

use chrono::{DateTime, TimeDelta, Utc};
use lw_core::Eui64;
use lw_protocol::{Error, Recipient, Result};
use lw_storage::{KvStore, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

const BUCKET: &str = "routes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub recipient: Recipient,
    pub expires_at: DateTime<Utc>,
}

pub struct RouterStorage {
    store: Mutex<KvStore>,
    expiry: TimeDelta,
}

impl RouterStorage {
    pub fn new(store: KvStore, expiry: TimeDelta) -> Self {
        Self {
            store: Mutex::new(store),
            expiry,
        }
    }

    /// Live routes of `dev_eui`; `NotFound` when there are none.
    pub async fn lookup(&self, dev_eui: Eui64) -> Result<Vec<RoutingEntry>> {
        self.lookup_at(Utc::now(), dev_eui).await
    }

    pub async fn lookup_at(&self, now: DateTime<Utc>, dev_eui: Eui64) -> Result<Vec<RoutingEntry>> {
        let mut store = self.store.lock().await;
        let entries: Vec<RoutingEntry> = store.lookup(BUCKET, dev_eui.as_bytes())?;
        let total = entries.len();
        let live: Vec<RoutingEntry> = entries.into_iter().filter(|e| e.expires_at > now).collect();

        if live.len() != total {
            debug!(dev_eui = %dev_eui, expired = total - live.len(), "dropping expired routes");
            if live.is_empty() {
                store.flush(BUCKET, dev_eui.as_bytes())?;
            } else {
                store.replace(BUCKET, dev_eui.as_bytes(), &live)?;
            }
        }
        if live.is_empty() {
            return Err(Error::not_found(format!("no live route for {dev_eui}")));
        }
        Ok(live)
    }

    /// Routes `dev_eui` to `recipient` for the configured expiry. A recipient
    /// already routed gets its expiry refreshed.
    pub async fn store(&self, dev_eui: Eui64, recipient: Recipient) -> Result<()> {
        self.store_at(Utc::now(), dev_eui, recipient).await
    }

    pub async fn store_at(&self, now: DateTime<Utc>, dev_eui: Eui64, recipient: Recipient) -> Result<()> {
        let mut store = self.store.lock().await;
        let mut entries: Vec<RoutingEntry> = match store.lookup(BUCKET, dev_eui.as_bytes()) {
            Ok(entries) => entries,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.retain(|e| e.expires_at > now && e.recipient != recipient);
        entries.push(RoutingEntry {
            recipient,
            expires_at: now + self.expiry,
        });
        store.replace(BUCKET, dev_eui.as_bytes(), &entries)?;
        Ok(())
    }
}
