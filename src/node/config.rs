//! Node operating configuration.
//!
//! The backend delivers configuration as a flat list of settings whose
//! dotted `code` ends in a field name (`"fft.fft_adc_divider"`). Every known
//! field is mapped explicitly; unknown ones are logged and skipped. A
//! [`NodeConfig`] only exists once every required field has been supplied.

use crate::protocol::control::Setting;
use crate::protocol::options::{
    FftParams, OptionError, ADC_DIVIDERS, ADC_SAMPLING_TIMES, BANDWIDTHS, CODING_RATES,
    FFT_SAMPLES, SPREADING_FACTORS,
};
use crate::protocol::radio::{ConfigBody, EncodeError};
use log::warn;
use serde_json::Value;
use std::fmt;

/// Supply voltage of the node ADC.
pub const ADC_REFERENCE_VOLTAGE: f64 = 3.3;

/// Raw battery reading of a full battery.
pub const BATTERY_FULL: f64 = 254.0;

pub const DEFAULT_BANDWIDTH: &str = "BW7_8";
pub const DEFAULT_SPREADING_FACTOR: &str = "SF12";
pub const DEFAULT_CODING_RATE: &str = "CR4_5";
pub const DEFAULT_JOIN_INTERVAL: u16 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A required setting was not in the list.
    Missing(&'static str),
    /// A setting value could not be converted to its field type.
    InvalidValue { key: String, value: String },
    /// A pointer setting names an entry missing from its option table.
    Table(OptionError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "missing setting {}", key),
            Self::InvalidValue { key, value } => {
                write!(f, "invalid value for setting {}: {}", key, value)
            }
            Self::Table(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<OptionError> for ConfigError {
    fn from(e: OptionError) -> Self {
        Self::Table(e)
    }
}

/// LoRa parameters announced to a node in its JoinReply.
///
/// Values are node-side codes, not option table positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioSettings {
    pub bandwidth: u8,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    pub join_interval: u16,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            bandwidth: BANDWIDTHS.value_of(DEFAULT_BANDWIDTH).unwrap_or(0),
            spreading_factor: SPREADING_FACTORS
                .value_of(DEFAULT_SPREADING_FACTOR)
                .unwrap_or(5),
            coding_rate: CODING_RATES.value_of(DEFAULT_CODING_RATE).unwrap_or(0),
            join_interval: DEFAULT_JOIN_INTERVAL,
        }
    }
}

/// Fully loaded node configuration.
///
/// Option fields hold option table indices, already checked against their
/// table.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub radio: RadioSettings,
    pub frequency_mhz: Option<f64>,

    pub statusinfo_interval: u16,
    pub statusinfo_listen_interval: u16,

    pub temperature_averaging: u8,
    pub temperature_calibration: f64,

    pub fft_samples: u8,
    pub fft_peaks: u8,
    pub fft_peaks_delta: u8,
    pub fft_adc_sampling_time: u8,
    pub fft_adc_divider: u8,
    /// Full-scale ADC count.
    pub adc_resolution: f64,

    pub dsp_rms_averaging: u8,
    pub dsp_rms_ac: bool,
    pub dsp_kurtosis_trimmed_samples: u8,
    pub dsp_threshold_voltage: f64,
}

#[derive(Default)]
struct Partial {
    radio: RadioSettings,
    frequency_mhz: Option<f64>,
    statusinfo_interval: Option<u16>,
    statusinfo_listen_interval: Option<u16>,
    temperature_averaging: Option<u8>,
    temperature_calibration: Option<f64>,
    fft_samples: Option<u8>,
    fft_peaks: Option<u8>,
    fft_peaks_delta: Option<u8>,
    fft_adc_sampling_time: Option<u8>,
    fft_adc_divider: Option<u8>,
    adc_resolution: Option<f64>,
    dsp_rms_averaging: Option<u8>,
    dsp_rms_ac: Option<bool>,
    dsp_kurtosis_trimmed_samples: Option<u8>,
    dsp_threshold_voltage: Option<f64>,
}

fn invalid(setting: &Setting) -> ConfigError {
    ConfigError::InvalidValue {
        key: setting.key().to_string(),
        value: setting.value.to_string(),
    }
}

fn int_of(setting: &Setting) -> Result<i64, ConfigError> {
    let parsed = match &setting.value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(setting))
}

fn u8_of(setting: &Setting) -> Result<u8, ConfigError> {
    u8::try_from(int_of(setting)?).map_err(|_| invalid(setting))
}

fn u16_of(setting: &Setting) -> Result<u16, ConfigError> {
    u16::try_from(int_of(setting)?).map_err(|_| invalid(setting))
}

fn float_of(setting: &Setting) -> Result<f64, ConfigError> {
    let parsed: Option<f64> = match &setting.value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .ok_or_else(|| invalid(setting))
}

fn bool_of(setting: &Setting) -> Result<bool, ConfigError> {
    let parsed = match &setting.value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" | "True" => Some(true),
            "0" | "false" | "False" | "" => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed.ok_or_else(|| invalid(setting))
}

fn text_of(setting: &Setting) -> Result<&str, ConfigError> {
    setting.value.as_str().ok_or_else(|| invalid(setting))
}

fn table_code(
    table: &crate::protocol::options::OptionTable<u8>,
    setting: &Setting,
) -> Result<u8, ConfigError> {
    let key = text_of(setting)?;
    table.value_of(key).ok_or_else(|| {
        ConfigError::Table(OptionError::UnknownKey {
            table: table.name(),
            key: key.to_string(),
        })
    })
}

impl NodeConfig {
    /// Build a configuration from the backend settings list.
    pub fn from_settings(settings: &[Setting]) -> Result<Self, ConfigError> {
        let mut p = Partial::default();

        for setting in settings {
            match setting.key() {
                "lora_bw" => p.radio.bandwidth = table_code(&BANDWIDTHS, setting)?,
                "lora_sf" => p.radio.spreading_factor = table_code(&SPREADING_FACTORS, setting)?,
                "lora_cr" => p.radio.coding_rate = table_code(&CODING_RATES, setting)?,
                "lora_freq" => p.frequency_mhz = Some(float_of(setting)?),
                "join_interval" => p.radio.join_interval = u16_of(setting)?,
                "statusinfo_interval" => p.statusinfo_interval = Some(u16_of(setting)?),
                "statusinfo_listen_interval" => {
                    p.statusinfo_listen_interval = Some(u16_of(setting)?)
                }
                "temperature_averaging_num" => p.temperature_averaging = Some(u8_of(setting)?),
                "temperature_calibration_const" => {
                    p.temperature_calibration = Some(float_of(setting)?)
                }
                "fft_samples_num" => {
                    p.fft_samples = Some(FFT_SAMPLES.require_index(text_of(setting)?)?)
                }
                "fft_peaks_num" => p.fft_peaks = Some(u8_of(setting)?),
                "fft_peaks_delta" => p.fft_peaks_delta = Some(u8_of(setting)?),
                "fft_adc_sampling_time" => {
                    p.fft_adc_sampling_time =
                        Some(ADC_SAMPLING_TIMES.require_index(text_of(setting)?)?)
                }
                "fft_adc_divider" => {
                    p.fft_adc_divider = Some(ADC_DIVIDERS.require_index(text_of(setting)?)?)
                }
                "adc_resolution" => p.adc_resolution = Some(float_of(setting)?),
                "dsp_rms_averaging_num" => p.dsp_rms_averaging = Some(u8_of(setting)?),
                "dsp_rms_ac" => p.dsp_rms_ac = Some(bool_of(setting)?),
                "dsp_kurtosis_trimmed_samples" => {
                    p.dsp_kurtosis_trimmed_samples = Some(u8_of(setting)?)
                }
                "dsp_threshold_voltage" => p.dsp_threshold_voltage = Some(float_of(setting)?),
                other => warn!(
                    "Setting {} with value {} is not a node config parameter",
                    other, setting.value
                ),
            }
        }

        Ok(Self {
            radio: p.radio,
            frequency_mhz: p.frequency_mhz,
            statusinfo_interval: p
                .statusinfo_interval
                .ok_or(ConfigError::Missing("statusinfo_interval"))?,
            statusinfo_listen_interval: p
                .statusinfo_listen_interval
                .ok_or(ConfigError::Missing("statusinfo_listen_interval"))?,
            temperature_averaging: p
                .temperature_averaging
                .ok_or(ConfigError::Missing("temperature_averaging_num"))?,
            temperature_calibration: p
                .temperature_calibration
                .ok_or(ConfigError::Missing("temperature_calibration_const"))?,
            fft_samples: p
                .fft_samples
                .ok_or(ConfigError::Missing("fft_samples_num"))?,
            fft_peaks: p.fft_peaks.ok_or(ConfigError::Missing("fft_peaks_num"))?,
            fft_peaks_delta: p
                .fft_peaks_delta
                .ok_or(ConfigError::Missing("fft_peaks_delta"))?,
            fft_adc_sampling_time: p
                .fft_adc_sampling_time
                .ok_or(ConfigError::Missing("fft_adc_sampling_time"))?,
            fft_adc_divider: p
                .fft_adc_divider
                .ok_or(ConfigError::Missing("fft_adc_divider"))?,
            adc_resolution: p
                .adc_resolution
                .ok_or(ConfigError::Missing("adc_resolution"))?,
            dsp_rms_averaging: p
                .dsp_rms_averaging
                .ok_or(ConfigError::Missing("dsp_rms_averaging_num"))?,
            dsp_rms_ac: p.dsp_rms_ac.ok_or(ConfigError::Missing("dsp_rms_ac"))?,
            dsp_kurtosis_trimmed_samples: p
                .dsp_kurtosis_trimmed_samples
                .ok_or(ConfigError::Missing("dsp_kurtosis_trimmed_samples"))?,
            dsp_threshold_voltage: p
                .dsp_threshold_voltage
                .ok_or(ConfigError::Missing("dsp_threshold_voltage"))?,
        })
    }

    /// Sample rate and FFT size derived from the option indices.
    pub fn fft_params(&self) -> Result<FftParams, OptionError> {
        crate::protocol::options::fft_params(
            self.fft_adc_divider,
            self.fft_adc_sampling_time,
            self.fft_samples,
        )
    }

    /// DSP threshold in ADC counts: `floor(volts * resolution / 3.3)`.
    pub fn dsp_threshold_counts(&self) -> Result<u16, EncodeError> {
        let counts = (self.dsp_threshold_voltage * self.adc_resolution / ADC_REFERENCE_VOLTAGE)
            .floor();
        if !(0.0..=f64::from(u16::MAX)).contains(&counts) {
            return Err(EncodeError::ConfigurationInvalid {
                field: "dsp_threshold",
                value: counts.max(0.0).min(u32::MAX as f64) as u32,
            });
        }
        Ok(counts as u16)
    }

    /// Radio body for ConfigReply (and embedded-config JoinReply).
    pub fn to_config_body(&self) -> Result<ConfigBody, EncodeError> {
        let body = ConfigBody {
            statusinfo_interval: self.statusinfo_interval,
            statusinfo_listen_interval: self.statusinfo_listen_interval,
            temperature_averaging: self.temperature_averaging,
            adc_sampling_time: self.fft_adc_sampling_time,
            adc_divider: self.fft_adc_divider,
            fft_samples: self.fft_samples,
            fft_peaks: self.fft_peaks,
            fft_peaks_delta: self.fft_peaks_delta,
            dsp_threshold: self.dsp_threshold_counts()?,
            kurtosis_trimmed_samples: self.dsp_kurtosis_trimmed_samples,
            rms_ac: self.dsp_rms_ac,
            rms_averaging: self.dsp_rms_averaging,
        };
        body.validate()?;
        Ok(body)
    }

    /// Raw ADC count to volts.
    pub fn counts_to_volts(&self, counts: u16) -> f64 {
        if self.adc_resolution <= 0.0 {
            return 0.0;
        }
        f64::from(counts) / self.adc_resolution * ADC_REFERENCE_VOLTAGE
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn backend_settings() -> Vec<Setting> {
        vec![
            Setting::new("node.statusinfo_interval", "int", "60"),
            Setting::new("node.statusinfo_listen_interval", "int", 5),
            Setting::new("temp.temperature_averaging_num", "int", "4"),
            Setting::new("temp.temperature_calibration_const", "float", "0.01"),
            Setting::new("fft.fft_samples_num", "pointer", "N_1024"),
            Setting::new("fft.fft_peaks_num", "int", "5"),
            Setting::new("fft.fft_peaks_delta", "int", "2"),
            Setting::new("fft.fft_adc_sampling_time", "pointer", "7CYCLE5"),
            Setting::new("fft.fft_adc_divider", "pointer", "ASYNC_DIV4"),
            Setting::new("adc.adc_resolution", "float", "4096"),
            Setting::new("dsp.dsp_rms_averaging_num", "int", "3"),
            Setting::new("dsp.dsp_rms_ac", "bool", "1"),
            Setting::new("dsp.dsp_kurtosis_trimmed_samples", "int", "10"),
            Setting::new("dsp.dsp_threshold_voltage", "float", "1.0"),
        ]
    }

    #[test]
    fn test_from_settings() {
        let config = NodeConfig::from_settings(&backend_settings()).unwrap();
        assert_eq!(config.statusinfo_interval, 60);
        assert_eq!(config.statusinfo_listen_interval, 5);
        assert_eq!(config.fft_adc_divider, 2);
        assert_eq!(config.fft_samples, 3);
        assert!(config.dsp_rms_ac);
        assert_eq!(config.radio, RadioSettings::default());

        let params = config.fft_params().unwrap();
        assert_eq!(params.fs, 200_000.0);
        assert_eq!(params.n, 1024);
    }

    #[test]
    fn test_unknown_key_is_ignored() {
        let mut settings = backend_settings();
        settings.push(Setting::new("misc.colour", "text", "red"));
        assert!(NodeConfig::from_settings(&settings).is_ok());
    }

    #[test]
    fn test_missing_required_setting() {
        let settings: Vec<Setting> = backend_settings()
            .into_iter()
            .filter(|s| s.key() != "fft_adc_divider")
            .collect();
        assert_eq!(
            NodeConfig::from_settings(&settings),
            Err(ConfigError::Missing("fft_adc_divider"))
        );
    }

    #[test]
    fn test_unknown_option_pointer() {
        let mut settings = backend_settings();
        settings.push(Setting::new("fft.fft_samples_num", "pointer", "N_4096"));
        assert!(matches!(
            NodeConfig::from_settings(&settings),
            Err(ConfigError::Table(OptionError::UnknownKey { .. }))
        ));
    }

    #[test]
    fn test_lora_settings_override_defaults() {
        let mut settings = backend_settings();
        settings.push(Setting::new("lora.lora_bw", "pointer", "BW20_8"));
        settings.push(Setting::new("lora.lora_sf", "pointer", "SF9"));
        settings.push(Setting::new("lora.join_interval", "int", 500));
        let config = NodeConfig::from_settings(&settings).unwrap();
        assert_eq!(config.radio.bandwidth, 3);
        assert_eq!(config.radio.spreading_factor, 2);
        assert_eq!(config.radio.join_interval, 500);
    }

    #[test]
    fn test_config_body_threshold() {
        let config = NodeConfig::from_settings(&backend_settings()).unwrap();
        let body = config.to_config_body().unwrap();
        // floor(1.0 * 4096 / 3.3)
        assert_eq!(body.dsp_threshold, 1241);
        assert_eq!(body.adc_divider, 2);
        assert_eq!(body.rms_averaging, 3);
    }

    #[test]
    fn test_config_body_rejects_out_of_range() {
        let mut config = NodeConfig::from_settings(&backend_settings()).unwrap();
        config.dsp_rms_averaging = 11;
        assert_eq!(
            config.to_config_body(),
            Err(EncodeError::ConfigurationInvalid {
                field: "rms_averaging",
                value: 11
            })
        );

        let mut config = NodeConfig::from_settings(&backend_settings()).unwrap();
        config.dsp_threshold_voltage = 100.0;
        assert!(matches!(
            config.to_config_body(),
            Err(EncodeError::ConfigurationInvalid {
                field: "dsp_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_int_value() {
        let mut settings = backend_settings();
        settings[0] = Setting::new("node.statusinfo_interval", "int", "soon");
        assert!(matches!(
            NodeConfig::from_settings(&settings),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
