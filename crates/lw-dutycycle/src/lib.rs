// lw-dutycycle: regional duty-cycle accounting and downlink scoring.

pub mod airtime;
pub mod manager;
pub mod region;
pub mod score;

pub use airtime::time_on_air;
pub use manager::{Cycles, DutyManager, state_from_duty};
pub use region::{BandPlan, Region, Rx2Params, SubBand};
pub use score::{Election, ScoreComputer, Scores, Window};
