use std::time::Duration;

use lw_core::{CodingRate, DataRate};

/// Preamble symbols programmed by LoRaWAN.
const PREAMBLE_SYMBOLS: f64 = 8.0;

/// Time on air of a LoRa frame of `size` bytes (explicit header, CRC on).
///
/// Low data rate optimisation is enabled when a symbol lasts more than
/// 16 ms.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn time_on_air(size: u32, datr: DataRate, codr: CodingRate) -> Duration {
    let sf = f64::from(datr.spreading_factor);
    let bw_khz = f64::from(datr.bandwidth_khz);
    let t_sym_ms = 2f64.powf(sf) / bw_khz;
    let de = if t_sym_ms > 16.0 { 1.0 } else { 0.0 };
    let crc = 1.0;
    let implicit_header = 0.0;

    let t_preamble_ms = (PREAMBLE_SYMBOLS + 4.25) * t_sym_ms;
    let numerator = 8.0 * f64::from(size) - 4.0 * sf + 28.0 + 16.0 * crc - 20.0 * implicit_header;
    let denominator = 4.0 * (sf - 2.0 * de);
    let extra = ((numerator / denominator).ceil() * (f64::from(codr.cr()) + 4.0)).max(0.0);
    let payload_symbols = 8.0 + extra;
    let total_ms = t_preamble_ms + payload_symbols * t_sym_ms;

    Duration::from_micros((total_ms * 1000.0).round() as u64)
}
