//! Gateway radio configuration.
//!
//! Modulation settings for the SX127x concentrator. The defaults are the
//! settings the node firmware listens on after boot: 868.5 MHz, SF12,
//! 125 kHz, coding rate 4/6, private sync word 0x34.

use super::airtime::Modulation;
use std::fmt;

/// Signal bandwidth, encoded as the 2-bit ModemConfig1 field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub fn code(self) -> u8 {
        match self {
            Self::Khz125 => 0,
            Self::Khz250 => 1,
            Self::Khz500 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Khz125),
            1 => Some(Self::Khz250),
            2 => Some(Self::Khz500),
            _ => None,
        }
    }

    pub fn hz(self) -> u32 {
        match self {
            Self::Khz125 => 125_000,
            Self::Khz250 => 250_000,
            Self::Khz500 => 500_000,
        }
    }
}

/// Forward error correction rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingRate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
}

impl CodingRate {
    /// Value of the 3-bit ModemConfig1 field.
    pub fn code(self) -> u8 {
        match self {
            Self::Cr4_5 => 1,
            Self::Cr4_6 => 2,
            Self::Cr4_7 => 3,
            Self::Cr4_8 => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Cr4_5),
            2 => Some(Self::Cr4_6),
            3 => Some(Self::Cr4_7),
            4 => Some(Self::Cr4_8),
            _ => None,
        }
    }

    /// Denominator of the 4/x rate.
    pub fn denominator(self) -> u8 {
        self.code() + 4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RadioConfigError {
    SpreadingFactor(u8),
    Frequency(f64),
    MaxPayload,
}

impl fmt::Display for RadioConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpreadingFactor(sf) => write!(f, "spreading factor {} outside 6..=12", sf),
            Self::Frequency(mhz) => write!(f, "frequency {} MHz outside 860..=1020", mhz),
            Self::MaxPayload => write!(f, "max payload must be greater than 0"),
        }
    }
}

impl std::error::Error for RadioConfigError {}

/// Concentrator modulation and front-end settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioConfig {
    pub frequency_mhz: f64,
    pub spreading_factor: u8,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    pub sync_word: u8,
    /// Check payload CRC on receive.
    pub rx_crc: bool,
    pub max_payload: u8,
    pub low_data_rate_optimize: bool,
    /// Raw PA_CONFIG value.
    pub pa_config: u8,
    pub preamble_symbols: u16,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 868.5,
            spreading_factor: 12,
            bandwidth: Bandwidth::Khz125,
            coding_rate: CodingRate::Cr4_6,
            sync_word: 0x34,
            rx_crc: true,
            max_payload: 0xFF,
            low_data_rate_optimize: true,
            pa_config: 0x0F,
            preamble_symbols: 8,
        }
    }
}

impl RadioConfig {
    pub fn validate(&self) -> Result<(), RadioConfigError> {
        if !(6..=12).contains(&self.spreading_factor) {
            return Err(RadioConfigError::SpreadingFactor(self.spreading_factor));
        }
        if !(860.0..=1020.0).contains(&self.frequency_mhz) {
            return Err(RadioConfigError::Frequency(self.frequency_mhz));
        }
        if self.max_payload == 0 {
            return Err(RadioConfigError::MaxPayload);
        }
        Ok(())
    }

    /// Parameters for time-on-air estimates.
    pub fn modulation(&self) -> Modulation {
        Modulation {
            spreading_factor: self.spreading_factor,
            bandwidth_hz: self.bandwidth.hz(),
            coding_rate: self.coding_rate.denominator(),
            preamble_symbols: self.preamble_symbols,
            explicit_header: true,
            crc_enabled: self.rx_crc,
            low_data_rate_optimize: self.low_data_rate_optimize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RadioConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coding_rate.code(), 2);
        assert_eq!(config.bandwidth.code(), 0);
        assert_eq!(config.modulation().coding_rate, 6);
    }

    #[test]
    fn test_codes_round_trip() {
        for bw in [Bandwidth::Khz125, Bandwidth::Khz250, Bandwidth::Khz500] {
            assert_eq!(Bandwidth::from_code(bw.code()), Some(bw));
        }
        assert_eq!(CodingRate::from_code(4), Some(CodingRate::Cr4_8));
        assert_eq!(CodingRate::from_code(0), None);
        assert_eq!(Bandwidth::from_code(3), None);
    }

    #[test]
    fn test_validation() {
        let config = RadioConfig {
            spreading_factor: 13,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(RadioConfigError::SpreadingFactor(13)));

        let config = RadioConfig {
            frequency_mhz: 433.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RadioConfigError::Frequency(_))));
    }
}
