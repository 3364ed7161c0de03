//! Option tables for node tunables.
//!
//! Several node parameters are only allowed to take a handful of values. The
//! radio protocol transmits the position of the value in a fixed, ordered
//! table instead of the value itself, and the backend refers to the entries
//! by name (`"ASYNC_DIV4"`, `"N_1024"`, ...).
//!
//! # Example
//!
//! ```
//! use lora_gateway::protocol::options::{fft_params, ADC_DIVIDERS, ADC_SAMPLING_TIMES, FFT_SAMPLES};
//!
//! let divider = ADC_DIVIDERS.index_of("ASYNC_DIV4").unwrap();
//! let sampling = ADC_SAMPLING_TIMES.index_of("7CYCLE5").unwrap();
//! let samples = FFT_SAMPLES.index_of("N_1024").unwrap();
//!
//! let params = fft_params(divider, sampling, samples).unwrap();
//! assert_eq!(params.fs, 200_000.0);
//! assert_eq!(params.n, 1024);
//! ```

use std::fmt;

/// Node ADC clock (HSI oscillator) in Hz.
pub const HSI_FREQUENCY_HZ: f64 = 16_000_000.0;

/// Fixed ADC conversion time in clock cycles.
pub const ADC_CONV_CONST: f64 = 12.5;

/// A fixed, ordered list of legal values for one tunable.
#[derive(Debug)]
pub struct OptionTable<T: 'static> {
    name: &'static str,
    entries: &'static [(&'static str, T)],
}

impl<T: Copy> OptionTable<T> {
    const fn new(name: &'static str, entries: &'static [(&'static str, T)]) -> Self {
        Self { name, entries }
    }

    /// Table name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire index of the entry with the given key.
    pub fn index_of(&self, key: &str) -> Option<u8> {
        self.entries
            .iter()
            .position(|(k, _)| *k == key)
            .map(|i| i as u8)
    }

    /// Value stored under the given key.
    pub fn value_of(&self, key: &str) -> Option<T> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Value at the given wire index.
    pub fn value_at(&self, index: u8) -> Option<T> {
        self.entries.get(index as usize).map(|(_, v)| *v)
    }

    /// Key at the given wire index.
    pub fn key_at(&self, index: u8) -> Option<&'static str> {
        self.entries.get(index as usize).map(|(k, _)| *k)
    }

    /// Whether `index` addresses an entry.
    pub fn contains_index(&self, index: u8) -> bool {
        (index as usize) < self.entries.len()
    }

    /// Resolve a key to its wire index or fail with a descriptive error.
    pub fn require_index(&self, key: &str) -> Result<u8, OptionError> {
        self.index_of(key).ok_or_else(|| OptionError::UnknownKey {
            table: self.name,
            key: key.to_string(),
        })
    }

    /// Resolve a wire index to its value or fail with a descriptive error.
    pub fn require_value_at(&self, index: u8) -> Result<T, OptionError> {
        self.value_at(index).ok_or(OptionError::IndexOutOfRange {
            table: self.name,
            index,
        })
    }
}

/// FFT sample counts.
pub static FFT_SAMPLES: OptionTable<u16> = OptionTable::new(
    "fft_samples_num",
    &[
        ("N_64", 64),
        ("N_128", 128),
        ("N_512", 512),
        ("N_1024", 1024),
        ("N_2048", 2048),
    ],
);

/// ADC sampling times in clock cycles.
pub static ADC_SAMPLING_TIMES: OptionTable<f64> = OptionTable::new(
    "fft_adc_sampling_time",
    &[
        ("1CYCLE5", 1.5),
        ("3CYCLE5", 3.5),
        ("7CYCLE5", 7.5),
        ("12CYCLE5", 12.5),
        ("19CYCLE5", 19.5),
        ("39CYCLE5", 39.5),
        ("79CYCLE5", 79.5),
        ("160CYCLE5", 160.5),
    ],
);

/// Asynchronous ADC clock dividers.
pub static ADC_DIVIDERS: OptionTable<u16> = OptionTable::new(
    "fft_adc_divider",
    &[
        ("ASYNC_DIV1", 1),
        ("ASYNC_DIV2", 2),
        ("ASYNC_DIV4", 4),
        ("ASYNC_DIV8", 8),
        ("ASYNC_DIV16", 16),
        ("ASYNC_DIV32", 32),
        ("ASYNC_DIV64", 64),
        ("ASYNC_DIV128", 128),
        ("ASYNC_DIV256", 256),
    ],
);

/// Node-side LoRa bandwidth codes.
///
/// Unlike the other tables, the value here is the code the node firmware
/// expects on the wire, not the entry position.
pub static BANDWIDTHS: OptionTable<u8> =
    OptionTable::new("lora_bw", &[("BW7_8", 0), ("BW15_6", 1), ("BW20_8", 3)]);

/// Node-side spreading factor codes.
pub static SPREADING_FACTORS: OptionTable<u8> = OptionTable::new(
    "lora_sf",
    &[
        ("SF7", 0),
        ("SF8", 1),
        ("SF9", 2),
        ("SF10", 3),
        ("SF11", 4),
        ("SF12", 5),
    ],
);

/// Node-side coding rate codes.
pub static CODING_RATES: OptionTable<u8> = OptionTable::new("lora_cr", &[("CR4_5", 0)]);

/// Effective FFT sampling parameters of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FftParams {
    /// Sample rate in Hz.
    pub fs: f64,
    /// Number of samples per FFT.
    pub n: u16,
}

/// Derive the sampling rate and FFT size from option table indices.
///
/// `fs = HSI / divider / (ADC_CONV_CONST + sampling_time)`
pub fn fft_params(
    divider_index: u8,
    sampling_time_index: u8,
    samples_index: u8,
) -> Result<FftParams, OptionError> {
    let divider = ADC_DIVIDERS.require_value_at(divider_index)?;
    let sampling_time = ADC_SAMPLING_TIMES.require_value_at(sampling_time_index)?;
    let n = FFT_SAMPLES.require_value_at(samples_index)?;
    let fs = HSI_FREQUENCY_HZ / f64::from(divider) / (ADC_CONV_CONST + sampling_time);
    Ok(FftParams { fs, n })
}

/// Option table lookup errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    /// Key is not present in the table.
    UnknownKey { table: &'static str, key: String },
    /// Index does not address an entry.
    IndexOutOfRange { table: &'static str, index: u8 },
}

impl fmt::Display for OptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey { table, key } => write!(f, "unknown {} option: {}", table, key),
            Self::IndexOutOfRange { table, index } => {
                write!(f, "{} index {} out of range", table, index)
            }
        }
    }
}

impl std::error::Error for OptionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_for_div4_7cycle5() {
        let params = fft_params(2, 2, 3).unwrap();
        assert_eq!(params.fs, 200_000.0);
        assert_eq!(params.n, 1024);
    }

    #[test]
    fn test_index_lookup_follows_table_order() {
        assert_eq!(ADC_DIVIDERS.index_of("ASYNC_DIV1"), Some(0));
        assert_eq!(ADC_DIVIDERS.index_of("ASYNC_DIV256"), Some(8));
        assert_eq!(FFT_SAMPLES.index_of("N_2048"), Some(4));
        assert_eq!(ADC_SAMPLING_TIMES.key_at(7), Some("160CYCLE5"));
    }

    #[test]
    fn test_bandwidth_codes_are_not_positions() {
        assert_eq!(BANDWIDTHS.value_of("BW20_8"), Some(3));
        assert_eq!(BANDWIDTHS.index_of("BW20_8"), Some(2));
    }

    #[test]
    fn test_out_of_range_index() {
        assert_eq!(
            fft_params(9, 0, 0),
            Err(OptionError::IndexOutOfRange {
                table: "fft_adc_divider",
                index: 9
            })
        );
        assert!(!FFT_SAMPLES.contains_index(5));
        assert!(FFT_SAMPLES.contains_index(4));
    }

    #[test]
    fn test_unknown_key() {
        let err = ADC_DIVIDERS.require_index("ASYNC_DIV3").unwrap_err();
        assert_eq!(err.to_string(), "unknown fft_adc_divider option: ASYNC_DIV3");
    }
}
