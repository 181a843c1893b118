//! Downlink candidate scoring.
//!
//! Candidates are the gateways that received the same uplink. Each is scored
//! independently for both receive windows from the availability of the
//! window's sub-band, the link SNR and the RSSI; the computer then picks one
//! candidate and one window.

use lw_core::DataRate;
use lw_protocol::{DutyState, Metadata, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Rx1,
    Rx2,
}

/// The elected candidate and the window to answer in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Election {
    pub id: usize,
    pub window: Window,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Best {
    id: Option<usize>,
    score: i32,
}

impl Best {
    fn offer(&mut self, id: usize, score: Option<i32>) {
        if let Some(score) = score.filter(|s| *s > self.score) {
            self.id = Some(id);
            self.score = score;
        }
    }
}

/// Running best candidate for each window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scores {
    rx1: Best,
    rx2: Best,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreComputer {
    spreading_factor: u8,
}

impl ScoreComputer {
    /// `datr` is the uplink datarate, e.g. `SF7BW125`.
    pub fn new(datr: &str) -> Result<(Self, Scores)> {
        let datr: DataRate = datr.parse()?;
        Ok((
            Self {
                spreading_factor: datr.spreading_factor,
            },
            Scores::default(),
        ))
    }

    /// Folds candidate `id` into `scores`. A window is only considered when
    /// both its duty state and the RSSI are known.
    pub fn update(&self, mut scores: Scores, id: usize, metadata: &Metadata) -> Scores {
        let Some(rssi) = metadata.rssi else {
            return scores;
        };
        let lsnr = metadata.lsnr;
        scores
            .rx1
            .offer(id, metadata.duty_rx1.and_then(|d| score(d, lsnr, rssi)));
        scores
            .rx2
            .offer(id, metadata.duty_rx2.and_then(|d| score(d, lsnr, rssi)));
        scores
    }

    /// SF7 and SF8 answer in RX1 when it has a positive candidate, RX2
    /// otherwise. Slower datarates answer in RX2 and fall back to RX1 only
    /// when RX2 has no positive candidate. `None` when neither window does.
    pub fn get(&self, scores: &Scores) -> Option<Election> {
        let pick = |best: Best, window| {
            best.id
                .filter(|_| best.score > 0)
                .map(|id| Election { id, window })
        };
        let rx1 = pick(scores.rx1, Window::Rx1);
        let rx2 = pick(scores.rx2, Window::Rx2);
        if matches!(self.spreading_factor, 7 | 8) {
            rx1.or(rx2)
        } else {
            rx2.or(rx1)
        }
    }
}

/// `None` disqualifies the candidate for the window.
fn score(duty: DutyState, lsnr: Option<f64>, rssi: i32) -> Option<i32> {
    let base = match duty {
        DutyState::HighlyAvailable => 1000,
        DutyState::Available => 600,
        DutyState::Warning => 200,
        DutyState::Blocked => return None,
    };
    let bonus = match lsnr {
        Some(snr) if snr > 5.0 => 50,
        Some(snr) if snr > 3.0 => 25,
        _ => 0,
    };
    Some(base + bonus + rssi)
}
