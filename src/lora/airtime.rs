//! LoRa time-on-air.
//!
//! Semtech formula (SX1272/73 datasheet, section 4.1.1.7). The scheduler uses
//! it to bound how long a transmission may keep the channel and to charge the
//! duty cycle budget.

use std::time::Duration;

/// Modulation parameters that determine airtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Modulation {
    /// 6..=12
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    /// Denominator of the 4/x coding rate (5..=8).
    pub coding_rate: u8,
    pub preamble_symbols: u16,
    pub explicit_header: bool,
    pub crc_enabled: bool,
    pub low_data_rate_optimize: bool,
}

impl Modulation {
    /// Symbol duration in microseconds.
    pub fn symbol_duration_us(&self) -> u64 {
        if self.bandwidth_hz == 0 {
            return 0;
        }
        (1u64 << self.spreading_factor) * 1_000_000 / u64::from(self.bandwidth_hz)
    }

    /// Whether the datasheet requires low data rate optimization
    /// (symbols longer than 16 ms).
    pub fn requires_low_data_rate_optimize(&self) -> bool {
        self.symbol_duration_us() > 16_000
    }

    /// Number of payload symbols for `payload_bytes`.
    pub fn payload_symbols(&self, payload_bytes: usize) -> u64 {
        let sf = f64::from(self.spreading_factor);
        let de = if self.low_data_rate_optimize { 1.0 } else { 0.0 };
        let ih = if self.explicit_header { 0.0 } else { 1.0 };
        let crc = if self.crc_enabled { 16.0 } else { 0.0 };

        let numerator = 8.0 * payload_bytes as f64 - 4.0 * sf + 28.0 + crc - 20.0 * ih;
        let denominator = 4.0 * (sf - 2.0 * de);
        if denominator <= 0.0 {
            return 8;
        }
        let blocks = (numerator / denominator).ceil().max(0.0);
        8 + (blocks * f64::from(self.coding_rate)) as u64
    }

    /// Time on air of a `payload_bytes` frame.
    pub fn time_on_air(&self, payload_bytes: usize) -> Duration {
        let t_sym = self.symbol_duration_us() as f64;
        let preamble = (f64::from(self.preamble_symbols) + 4.25) * t_sym;
        let payload = self.payload_symbols(payload_bytes) as f64 * t_sym;
        Duration::from_micros((preamble + payload) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(spreading_factor: u8, low_data_rate_optimize: bool) -> Modulation {
        Modulation {
            spreading_factor,
            bandwidth_hz: 125_000,
            coding_rate: 5,
            preamble_symbols: 8,
            explicit_header: true,
            crc_enabled: true,
            low_data_rate_optimize,
        }
    }

    #[test]
    fn test_symbol_duration() {
        assert_eq!(sf(7, false).symbol_duration_us(), 1024);
        assert_eq!(sf(12, true).symbol_duration_us(), 32_768);
    }

    #[test]
    fn test_low_data_rate_threshold() {
        assert!(!sf(10, false).requires_low_data_rate_optimize());
        assert!(sf(11, false).requires_low_data_rate_optimize());
        assert!(sf(12, false).requires_low_data_rate_optimize());
    }

    #[test]
    fn test_sf7_reference_value() {
        // 10 byte payload at SF7/125 kHz/4:5: 12.25 + 28 symbols of 1.024 ms.
        let airtime = sf(7, false).time_on_air(10);
        assert_eq!(airtime, Duration::from_micros(41_216));
    }

    #[test]
    fn test_sf12_join_reply_is_slow() {
        // A 9 byte JoinReply at SF12 keeps the channel for most of a second.
        let airtime = sf(12, true).time_on_air(9);
        assert!(airtime > Duration::from_millis(700));
        assert!(airtime < Duration::from_millis(1200));
    }

    #[test]
    fn test_airtime_grows_with_payload() {
        let m = sf(9, false);
        assert!(m.time_on_air(100) > m.time_on_air(10));
    }
}
