//! Regional band plans.
//!
//! Only the European plan (ETSI EN 300 220 sub-bands) is defined; other
//! regions are recognised by name but refused at construction.

use std::fmt;
use std::str::FromStr;

use lw_protocol::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Europe,
    UnitedStates,
    China,
    Australia,
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "europe" | "eu" | "eu868" => Ok(Region::Europe),
            "us" | "us915" | "united_states" => Ok(Region::UnitedStates),
            "china" | "cn" | "cn470" => Ok(Region::China),
            "australia" | "au" | "au915" => Ok(Region::Australia),
            other => Err(Error::structural(format!("unknown region {other:?}"))),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Region::Europe => "europe",
            Region::UnitedStates => "us",
            Region::China => "china",
            Region::Australia => "australia",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubBand {
    G,
    G1,
    G2,
    G3,
    G4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BandLimit {
    band: SubBand,
    /// Inclusive lower edge, MHz.
    low: f64,
    high: f64,
    high_inclusive: bool,
    /// Fraction of time the band may be occupied.
    max_duty: f64,
}

impl BandLimit {
    fn contains(&self, freq: f64) -> bool {
        freq >= self.low && (freq < self.high || (self.high_inclusive && freq <= self.high))
    }
}

/// Fixed downlink parameters of the second receive window.
#[derive(Debug, Clone, PartialEq)]
pub struct Rx2Params {
    pub freq: f64,
    pub datr: String,
    pub codr: String,
}

#[derive(Debug, Clone)]
pub struct BandPlan {
    region: Region,
    bands: Vec<BandLimit>,
    rx2: Rx2Params,
}

impl BandPlan {
    pub fn for_region(region: Region) -> Result<Self> {
        match region {
            Region::Europe => Ok(Self::europe()),
            other => Err(Error::implementation(format!(
                "duty cycle for region {other} is not implemented"
            ))),
        }
    }

    fn europe() -> Self {
        let band = |band, low, high, high_inclusive, max_duty| BandLimit {
            band,
            low,
            high,
            high_inclusive,
            max_duty,
        };
        Self {
            region: Region::Europe,
            bands: vec![
                band(SubBand::G, 863.0, 868.0, false, 0.01),
                band(SubBand::G1, 868.0, 868.6, true, 0.01),
                band(SubBand::G2, 868.7, 869.2, true, 0.001),
                band(SubBand::G3, 869.4, 869.65, true, 0.1),
                band(SubBand::G4, 869.7, 870.0, true, 0.01),
            ],
            rx2: Rx2Params {
                freq: 869.525,
                datr: "SF9BW125".to_owned(),
                codr: "4/5".to_owned(),
            },
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Sub-band of a frequency in MHz; `Structural` outside the plan.
    pub fn sub_band(&self, freq: f64) -> Result<SubBand> {
        self.bands
            .iter()
            .find(|b| b.contains(freq))
            .map(|b| b.band)
            .ok_or_else(|| Error::structural(format!("frequency {freq} MHz is not supported")))
    }

    pub fn max_duty(&self, band: SubBand) -> f64 {
        self.bands
            .iter()
            .find(|b| b.band == band)
            .map_or(0.0, |b| b.max_duty)
    }

    pub fn rx2(&self) -> &Rx2Params {
        &self.rx2
    }
}
