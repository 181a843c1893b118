//! Per-gateway duty-cycle accounting.
//!
//! Each gateway owns one cycle window. Transmissions observed while the
//! window is open accumulate their time on air per sub-band; the first
//! observation after the window closed opens a new one and drops every
//! previous accumulator.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use lw_core::{CodingRate, DataRate, Eui64};
use lw_protocol::{DutyState, Error, Result};
use lw_storage::{KvStore, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::airtime::time_on_air;
use crate::region::{BandPlan, Region, SubBand};

const BUCKET: &str = "duty_cycles";

/// Usage per sub-band, in percent of the band's allowance.
pub type Cycles = BTreeMap<SubBand, u32>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DutyEntry {
    until: DateTime<Utc>,
    /// Accumulated time on air, microseconds.
    on_air: BTreeMap<SubBand, u64>,
}

pub struct DutyManager {
    store: Mutex<KvStore>,
    cycle_length: TimeDelta,
    plan: BandPlan,
}

impl DutyManager {
    pub fn new(store: KvStore, cycle_length: TimeDelta, region: Region) -> Result<Self> {
        if cycle_length <= TimeDelta::zero() {
            return Err(Error::structural("duty cycle length must be positive"));
        }
        Ok(Self {
            store: Mutex::new(store),
            cycle_length,
            plan: BandPlan::for_region(region)?,
        })
    }

    pub fn plan(&self) -> &BandPlan {
        &self.plan
    }

    /// Records a transmission of `size` bytes by `gateway`.
    pub async fn update(
        &self,
        gateway: Eui64,
        freq: f64,
        size: u32,
        datr: &str,
        codr: &str,
    ) -> Result<()> {
        self.update_at(Utc::now(), gateway, freq, size, datr, codr)
            .await
    }

    pub async fn update_at(
        &self,
        now: DateTime<Utc>,
        gateway: Eui64,
        freq: f64,
        size: u32,
        datr: &str,
        codr: &str,
    ) -> Result<()> {
        let band = self.plan.sub_band(freq)?;
        let datr: DataRate = datr.parse()?;
        let codr: CodingRate = codr.parse()?;
        let toa = u64::try_from(time_on_air(size, datr, codr).as_micros()).unwrap_or(u64::MAX);

        let mut store = self.store.lock().await;
        let current = match store.lookup::<DutyEntry>(BUCKET, gateway.as_bytes()) {
            Ok(mut entries) => entries.pop(),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let entry = match current {
            Some(mut entry) if now < entry.until => {
                let acc = entry.on_air.entry(band).or_insert(0);
                *acc = acc.saturating_add(toa);
                entry
            }
            _ => DutyEntry {
                until: now + self.cycle_length,
                on_air: BTreeMap::from([(band, toa)]),
            },
        };
        debug!(gateway = %gateway, band = ?band, toa_us = toa, "duty cycle updated");
        store.replace(BUCKET, gateway.as_bytes(), &[entry])?;
        Ok(())
    }

    /// Current usage of every sub-band `gateway` has transmitted on during
    /// the open cycle. Unknown gateways and closed cycles yield an empty map.
    pub async fn lookup(&self, gateway: Eui64) -> Result<Cycles> {
        self.lookup_at(Utc::now(), gateway).await
    }

    pub async fn lookup_at(&self, now: DateTime<Utc>, gateway: Eui64) -> Result<Cycles> {
        let entry = {
            let store = self.store.lock().await;
            match store.lookup::<DutyEntry>(BUCKET, gateway.as_bytes()) {
                Ok(mut entries) => entries.pop(),
                Err(StorageError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            }
        };
        let Some(entry) = entry.filter(|e| now < e.until) else {
            return Ok(Cycles::new());
        };

        #[allow(clippy::cast_precision_loss)]
        let cycle_us = self.cycle_length.num_microseconds().unwrap_or(i64::MAX) as f64;
        let mut cycles = Cycles::new();
        for (band, on_air) in entry.on_air {
            let max_duty = self.plan.max_duty(band);
            if max_duty <= 0.0 {
                continue;
            }
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let usage = (100.0 * (on_air as f64 / cycle_us) / max_duty).floor() as u32;
            cycles.insert(band, usage);
        }
        Ok(cycles)
    }
}

/// Maps a usage percentage to an availability bucket.
pub fn state_from_duty(usage: u32) -> DutyState {
    match usage {
        0..30 => DutyState::HighlyAvailable,
        30..85 => DutyState::Available,
        85..100 => DutyState::Warning,
        _ => DutyState::Blocked,
    }
}
