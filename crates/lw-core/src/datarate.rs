//! LoRa datarate (`SF7BW125`) and coding rate (`4/5`) strings as found in
//! SemTech gateway metadata.

use std::fmt;
use std::str::FromStr;

use crate::frame::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataRate {
    pub spreading_factor: u8,
    pub bandwidth_khz: u16,
}

impl DataRate {
    pub const fn new(spreading_factor: u8, bandwidth_khz: u16) -> Self {
        Self {
            spreading_factor,
            bandwidth_khz,
        }
    }
}

impl FromStr for DataRate {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CodecError::InvalidDataRate(s.to_owned());
        let rest = s.strip_prefix("SF").ok_or_else(invalid)?;
        let (sf, bw) = rest.split_once("BW").ok_or_else(invalid)?;
        let spreading_factor: u8 = sf.parse().map_err(|_| invalid())?;
        let bandwidth_khz: u16 = bw.parse().map_err(|_| invalid())?;
        if !(7..=12).contains(&spreading_factor) || ![125, 250, 500].contains(&bandwidth_khz) {
            return Err(invalid());
        }
        Ok(Self {
            spreading_factor,
            bandwidth_khz,
        })
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SF{}BW{}", self.spreading_factor, self.bandwidth_khz)
    }
}

/// Coding rate `4/n`, n in 5..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodingRate(u8);

impl CodingRate {
    pub const CR_4_5: CodingRate = CodingRate(5);

    pub fn denominator(self) -> u8 {
        self.0
    }

    /// The `CR` term of the time-on-air formula (1 for 4/5 ... 4 for 4/8).
    pub fn cr(self) -> u8 {
        self.0 - 4
    }
}

impl FromStr for CodingRate {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CodecError::InvalidCodingRate(s.to_owned());
        let den = s.strip_prefix("4/").ok_or_else(invalid)?;
        let den: u8 = den.parse().map_err(|_| invalid())?;
        if !(5..=8).contains(&den) {
            return Err(invalid());
        }
        Ok(CodingRate(den))
    }
}

impl fmt::Display for CodingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "4/{}", self.0)
    }
}
