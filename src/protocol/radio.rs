//! Binary radio protocol between the gateway and measuring nodes.
//!
//! Every packet starts with a two byte header:
//!
//! ```text
//! [command: 1 byte][session id: 1 byte][payload: N bytes]
//! ```
//!
//! The command byte selects the packet variant. Sensor data packets carry a
//! second sub-type byte at offset 2 which selects the concrete sensor layout.
//! All multi-byte integers are little-endian, floats are IEEE-754 single
//! precision. One LoRa payload carries exactly one packet, so the whole
//! buffer must be consumed by decoding.
//!
//! # Example
//!
//! ```
//! use lora_gateway::protocol::radio::{decode, JoinRequest, RadioPacket};
//!
//! let packet = RadioPacket::JoinRequest(JoinRequest {
//!     session_id: 0,
//!     address: 0x0D47_3533,
//!     start_time: 1000,
//!     firmware_version: 3,
//! });
//! let bytes = packet.encode().unwrap();
//! assert_eq!(bytes.len(), 11);
//! assert_eq!(decode(&bytes).unwrap(), packet);
//! ```

use super::options::{
    fft_params, FftParams, OptionError, ADC_DIVIDERS, ADC_SAMPLING_TIMES, FFT_SAMPLES,
};
use std::fmt;

/// Largest packet a single LoRa payload can carry.
pub const MAX_PACKET_LEN: usize = 255;

/// Command byte + session id byte.
pub const HEADER_LEN: usize = 2;

/// Session id used by nodes that have not joined yet.
pub const UNJOINED_SESSION: u8 = 0x00;

/// Value of a 16-bit timing field the node could not measure.
pub const NOT_MEASURED: u16 = 0xFFFF;

/// Float bins carried by one FFT chunk.
pub const FFT_CHUNK_BINS: usize = 32;

/// JoinReply result code for an accepted join.
pub const JOIN_ACCEPTED: u8 = 1;

/// Upper bound for averaging counts and peak settings.
pub const MAX_AVERAGING: u8 = 10;

/// Exclusive upper bound for kurtosis trimmed samples.
pub const KURTOSIS_TRIMMED_LIMIT: u8 = 50;

/// Command bytes.
pub mod command {
    pub const JOIN_REPLY: u8 = 0x01;
    pub const CONFIG_REPLY: u8 = 0x02;
    pub const SENSOR_DATA_REQUEST: u8 = 0x04;
    pub const FFT_CHUNK_REQUEST: u8 = 0x05;
    pub const JOIN_REQUEST: u8 = 0x10;
    pub const CONFIG_REQUEST: u8 = 0x20;
    pub const STATUS_INFO: u8 = 0x30;
    pub const SENSOR_DATA: u8 = 0x40;
    pub const FFT_CHUNK_DATA: u8 = 0x50;
    pub const RESTART: u8 = 0x60;
}

/// Sensor data sub-types (byte 2 of sensor data packets).
pub mod data_type {
    pub const GENERIC: u8 = 0x00;
    pub const TEMPERATURE: u8 = 0x01;
    pub const FFT: u8 = 0x01;
}

const APP_MODE_STATUS: u8 = 0;
const APP_MODE_EMBEDDED_CONFIG: u8 = 1;

/// Errors produced while decoding a received buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer is shorter than the resolved variant requires.
    Truncated { needed: usize, available: usize },
    /// Command byte (or sensor sub-type) is not known.
    UnknownVariant { command: u8, sub_type: Option<u8> },
    /// A field holds a value outside its legal range.
    FieldOutOfRange { field: &'static str, value: u32 },
    /// Buffer continues past the end of the resolved variant.
    TrailingBytes { expected: usize, actual: usize },
    /// Buffer is larger than any LoRa payload.
    Oversized { len: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "truncated packet: need {} bytes, have {}", needed, available)
            }
            Self::UnknownVariant {
                command,
                sub_type: Some(sub),
            } => write!(f, "unknown packet 0x{:02X}/0x{:02X}", command, sub),
            Self::UnknownVariant {
                command,
                sub_type: None,
            } => write!(f, "unknown packet command 0x{:02X}", command),
            Self::FieldOutOfRange { field, value } => {
                write!(f, "field {} out of range: {}", field, value)
            }
            Self::TrailingBytes { expected, actual } => {
                write!(f, "packet length {} does not match layout length {}", actual, expected)
            }
            Self::Oversized { len } => {
                write!(f, "packet too large: {} bytes (max {})", len, MAX_PACKET_LEN)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors produced while encoding a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A field value is not representable or outside its legal range.
    ConfigurationInvalid { field: &'static str, value: u32 },
    /// Encoded packet does not fit a LoRa payload.
    PacketTooLarge { size: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigurationInvalid { field, value } => {
                write!(f, "invalid configuration: {} = {}", field, value)
            }
            Self::PacketTooLarge { size } => {
                write!(f, "packet too large: {} bytes (max {})", size, MAX_PACKET_LEN)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Bounds-checked little-endian cursor over a received buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::FieldOutOfRange {
                field,
                value: other.into(),
            }),
        }
    }

    /// The layout is complete; anything left over is an error.
    fn finish(self) -> Result<(), DecodeError> {
        if self.pos != self.buf.len() {
            return Err(DecodeError::TrailingBytes {
                expected: self.pos,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }
}

fn require(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn header(command: u8, session_id: u8, capacity: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(capacity);
    out.push(command);
    out.push(session_id);
    out
}

/// Node request to join the network. Sent with session id 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_id: u8,
    /// Unique hardware address of the node.
    pub address: u32,
    /// Seconds since node boot.
    pub start_time: u32,
    pub firmware_version: u8,
}

impl JoinRequest {
    pub const LEN: usize = 11;
}

/// Configuration body shared by ConfigReply and embedded-config JoinReply.
///
/// Sampling fields are option table indices, not values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBody {
    pub statusinfo_interval: u16,
    pub statusinfo_listen_interval: u16,
    pub temperature_averaging: u8,
    pub adc_sampling_time: u8,
    pub adc_divider: u8,
    pub fft_samples: u8,
    pub fft_peaks: u8,
    pub fft_peaks_delta: u8,
    pub dsp_threshold: u16,
    pub kurtosis_trimmed_samples: u8,
    pub rms_ac: bool,
    pub rms_averaging: u8,
}

impl ConfigBody {
    pub const LEN: usize = 15;

    /// Effective FFT sampling parameters described by this body.
    pub fn fft_params(&self) -> Result<FftParams, OptionError> {
        fft_params(self.adc_divider, self.adc_sampling_time, self.fft_samples)
    }

    /// First field outside its legal range, if any.
    fn out_of_range(&self) -> Option<(&'static str, u32)> {
        let checks: [(&'static str, u8, bool); 8] = [
            (
                "temperature_averaging",
                self.temperature_averaging,
                self.temperature_averaging <= MAX_AVERAGING,
            ),
            (
                "adc_sampling_time",
                self.adc_sampling_time,
                ADC_SAMPLING_TIMES.contains_index(self.adc_sampling_time),
            ),
            (
                "adc_divider",
                self.adc_divider,
                ADC_DIVIDERS.contains_index(self.adc_divider),
            ),
            (
                "fft_samples",
                self.fft_samples,
                FFT_SAMPLES.contains_index(self.fft_samples),
            ),
            ("fft_peaks", self.fft_peaks, self.fft_peaks <= MAX_AVERAGING),
            (
                "fft_peaks_delta",
                self.fft_peaks_delta,
                self.fft_peaks_delta <= MAX_AVERAGING,
            ),
            (
                "kurtosis_trimmed_samples",
                self.kurtosis_trimmed_samples,
                self.kurtosis_trimmed_samples < KURTOSIS_TRIMMED_LIMIT,
            ),
            (
                "rms_averaging",
                self.rms_averaging,
                self.rms_averaging <= MAX_AVERAGING,
            ),
        ];
        checks
            .iter()
            .find(|(_, _, ok)| !ok)
            .map(|(field, value, _)| (*field, u32::from(*value)))
    }

    /// Check every field against its legal range.
    pub fn validate(&self) -> Result<(), EncodeError> {
        match self.out_of_range() {
            Some((field, value)) => Err(EncodeError::ConfigurationInvalid { field, value }),
            None => Ok(()),
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        self.validate()?;
        out.extend_from_slice(&self.statusinfo_interval.to_le_bytes());
        out.extend_from_slice(&self.statusinfo_listen_interval.to_le_bytes());
        out.push(self.temperature_averaging);
        out.push(self.adc_sampling_time);
        out.push(self.adc_divider);
        out.push(self.fft_samples);
        out.push(self.fft_peaks);
        out.push(self.fft_peaks_delta);
        out.extend_from_slice(&self.dsp_threshold.to_le_bytes());
        out.push(self.kurtosis_trimmed_samples);
        out.push(u8::from(self.rms_ac));
        out.push(self.rms_averaging);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let body = Self {
            statusinfo_interval: r.u16()?,
            statusinfo_listen_interval: r.u16()?,
            temperature_averaging: r.u8()?,
            adc_sampling_time: r.u8()?,
            adc_divider: r.u8()?,
            fft_samples: r.u8()?,
            fft_peaks: r.u8()?,
            fft_peaks_delta: r.u8()?,
            dsp_threshold: r.u16()?,
            kurtosis_trimmed_samples: r.u8()?,
            rms_ac: r.flag("rms_ac")?,
            rms_averaging: r.u8()?,
        };
        if let Some((field, value)) = body.out_of_range() {
            return Err(DecodeError::FieldOutOfRange { field, value });
        }
        Ok(body)
    }
}

/// What follows the common JoinReply header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMode {
    /// Header only; the node asks for its configuration separately.
    Status,
    /// The configuration body is packed right after the header.
    EmbeddedConfig(ConfigBody),
}

/// Gateway answer to a JoinRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReply {
    pub session_id: u8,
    pub result: u8,
    pub bandwidth: u8,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    /// Join retry interval.
    pub join_interval: u16,
    pub mode: AppMode,
}

impl JoinReply {
    /// Length of the common header (status mode).
    pub const LEN: usize = 9;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    pub session_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigReply {
    pub session_id: u8,
    pub body: ConfigBody,
}

/// One spectral peak reported by a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FftPeak {
    /// FFT bin index.
    pub index: u16,
    pub value: f32,
}

/// Periodic node telemetry.
///
/// Peaks go on the air in ascending bin index order and come back sorted
/// the same way, whatever order they were given in.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusInfo {
    pub session_id: u8,
    pub battery: u8,
    pub temperature: u16,
    pub rms: u16,
    pub vpp: u16,
    pub kurtosis_ratio: f32,
    pub ringdown_counts: u8,
    /// Rise time in samples, `None` when not measured.
    pub rise_time: Option<u16>,
    /// Threshold duration in samples, `None` when not measured.
    pub threshold_duration: Option<u16>,
    pub peaks: Vec<FftPeak>,
}

impl StatusInfo {
    /// Length without peaks.
    pub const MIN_LEN: usize = 19;

    /// Peaks as `(index, value)` pairs, ascending by index.
    pub fn fft_peaks(&self) -> Vec<(u16, f32)> {
        let mut peaks: Vec<(u16, f32)> = self.peaks.iter().map(|p| (p.index, p.value)).collect();
        peaks.sort_by_key(|(index, _)| *index);
        peaks
    }

    /// Rise time in seconds at sample rate `fs`, 0 when not measured.
    pub fn rise_time_secs(&self, fs: f64) -> f64 {
        samples_to_secs(self.rise_time, fs)
    }

    /// Threshold duration in seconds at sample rate `fs`, 0 when not measured.
    pub fn threshold_duration_secs(&self, fs: f64) -> f64 {
        samples_to_secs(self.threshold_duration, fs)
    }
}

fn samples_to_secs(samples: Option<u16>, fs: f64) -> f64 {
    match samples {
        Some(t) if fs > 0.0 => f64::from(t) / fs,
        _ => 0.0,
    }
}

fn timing_to_wire(field: &'static str, value: Option<u16>) -> Result<u16, EncodeError> {
    match value {
        None => Ok(NOT_MEASURED),
        Some(NOT_MEASURED) => Err(EncodeError::ConfigurationInvalid {
            field,
            value: NOT_MEASURED.into(),
        }),
        Some(t) => Ok(t),
    }
}

fn timing_from_wire(raw: u16) -> Option<u16> {
    (raw != NOT_MEASURED).then_some(raw)
}

/// Gateway command to restart a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restart {
    pub session_id: u8,
    /// Drop the stored configuration as well.
    pub reset_config: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDataRequest {
    pub session_id: u8,
    pub data_type: u8,
    pub samples: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureSample {
    pub time: u32,
    pub temperature: u16,
}

/// Temperature readings (sensor data family, sub-type 0x01).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemperatureData {
    pub session_id: u8,
    pub sequence: u8,
    pub samples: Vec<TemperatureSample>,
}

impl TemperatureData {
    const MIN_LEN: usize = 5;
    const SAMPLE_LEN: usize = 6;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FftChunkRequest {
    pub session_id: u8,
}

/// One slice of an FFT spectrum transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct FftChunkData {
    pub session_id: u8,
    pub sequence: u8,
    /// Total number of chunks in the transfer.
    pub chunk_count: u8,
    pub time: u32,
    pub bins: [f32; FFT_CHUNK_BINS],
}

impl FftChunkData {
    pub const LEN: usize = 9 + FFT_CHUNK_BINS * 4;
}

/// A decoded radio packet.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioPacket {
    JoinRequest(JoinRequest),
    JoinReply(JoinReply),
    ConfigRequest(ConfigRequest),
    ConfigReply(ConfigReply),
    StatusInfo(StatusInfo),
    Restart(Restart),
    SensorDataRequest(SensorDataRequest),
    TemperatureData(TemperatureData),
    FftChunkRequest(FftChunkRequest),
    FftChunkData(FftChunkData),
}

impl RadioPacket {
    /// Session id carried in the header.
    pub fn session_id(&self) -> u8 {
        match self {
            Self::JoinRequest(p) => p.session_id,
            Self::JoinReply(p) => p.session_id,
            Self::ConfigRequest(p) => p.session_id,
            Self::ConfigReply(p) => p.session_id,
            Self::StatusInfo(p) => p.session_id,
            Self::Restart(p) => p.session_id,
            Self::SensorDataRequest(p) => p.session_id,
            Self::TemperatureData(p) => p.session_id,
            Self::FftChunkRequest(p) => p.session_id,
            Self::FftChunkData(p) => p.session_id,
        }
    }

    /// Command byte of this variant.
    pub fn command(&self) -> u8 {
        match self {
            Self::JoinRequest(_) => command::JOIN_REQUEST,
            Self::JoinReply(_) => command::JOIN_REPLY,
            Self::ConfigRequest(_) => command::CONFIG_REQUEST,
            Self::ConfigReply(_) => command::CONFIG_REPLY,
            Self::StatusInfo(_) => command::STATUS_INFO,
            Self::Restart(_) => command::RESTART,
            Self::SensorDataRequest(_) => command::SENSOR_DATA_REQUEST,
            Self::TemperatureData(_) => command::SENSOR_DATA,
            Self::FftChunkRequest(_) => command::FFT_CHUNK_REQUEST,
            Self::FftChunkData(_) => command::FFT_CHUNK_DATA,
        }
    }

    /// Variant name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRequest(_) => "JoinRequest",
            Self::JoinReply(_) => "JoinReply",
            Self::ConfigRequest(_) => "ConfigRequest",
            Self::ConfigReply(_) => "ConfigReply",
            Self::StatusInfo(_) => "StatusInfo",
            Self::Restart(_) => "Restart",
            Self::SensorDataRequest(_) => "SensorDataRequest",
            Self::TemperatureData(_) => "TemperatureData",
            Self::FftChunkRequest(_) => "FftChunkRequest",
            Self::FftChunkData(_) => "FftChunkData",
        }
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let out = match self {
            Self::JoinRequest(p) => {
                let mut out = header(command::JOIN_REQUEST, p.session_id, JoinRequest::LEN);
                out.extend_from_slice(&p.address.to_le_bytes());
                out.extend_from_slice(&p.start_time.to_le_bytes());
                out.push(p.firmware_version);
                out
            }
            Self::JoinReply(p) => {
                let mut out = header(
                    command::JOIN_REPLY,
                    p.session_id,
                    JoinReply::LEN + ConfigBody::LEN,
                );
                out.push(p.result);
                out.push(p.bandwidth);
                out.push(p.spreading_factor);
                out.push(p.coding_rate);
                out.extend_from_slice(&p.join_interval.to_le_bytes());
                match &p.mode {
                    AppMode::Status => out.push(APP_MODE_STATUS),
                    AppMode::EmbeddedConfig(body) => {
                        out.push(APP_MODE_EMBEDDED_CONFIG);
                        body.write(&mut out)?;
                    }
                }
                out
            }
            Self::ConfigRequest(p) => header(command::CONFIG_REQUEST, p.session_id, HEADER_LEN),
            Self::ConfigReply(p) => {
                let mut out = header(
                    command::CONFIG_REPLY,
                    p.session_id,
                    HEADER_LEN + ConfigBody::LEN,
                );
                p.body.write(&mut out)?;
                out
            }
            Self::StatusInfo(p) => encode_status_info(p)?,
            Self::Restart(p) => {
                let mut out = header(command::RESTART, p.session_id, 3);
                out.push(u8::from(p.reset_config));
                out
            }
            Self::SensorDataRequest(p) => {
                let mut out = header(command::SENSOR_DATA_REQUEST, p.session_id, 4);
                out.push(p.data_type);
                out.push(p.samples);
                out
            }
            Self::TemperatureData(p) => {
                let count = u8::try_from(p.samples.len()).map_err(|_| {
                    EncodeError::ConfigurationInvalid {
                        field: "samples",
                        value: p.samples.len() as u32,
                    }
                })?;
                let mut out = header(
                    command::SENSOR_DATA,
                    p.session_id,
                    TemperatureData::MIN_LEN + p.samples.len() * TemperatureData::SAMPLE_LEN,
                );
                out.push(data_type::TEMPERATURE);
                out.push(p.sequence);
                out.push(count);
                for sample in &p.samples {
                    out.extend_from_slice(&sample.time.to_le_bytes());
                    out.extend_from_slice(&sample.temperature.to_le_bytes());
                }
                out
            }
            Self::FftChunkRequest(p) => {
                let mut out = header(command::FFT_CHUNK_REQUEST, p.session_id, 3);
                out.push(data_type::FFT);
                out
            }
            Self::FftChunkData(p) => {
                let mut out = header(command::FFT_CHUNK_DATA, p.session_id, FftChunkData::LEN);
                out.push(data_type::FFT);
                out.push(p.sequence);
                out.push(p.chunk_count);
                out.extend_from_slice(&p.time.to_le_bytes());
                for bin in &p.bins {
                    out.extend_from_slice(&bin.to_le_bytes());
                }
                out
            }
        };

        if out.len() > MAX_PACKET_LEN {
            return Err(EncodeError::PacketTooLarge { size: out.len() });
        }
        Ok(out)
    }
}

fn encode_status_info(p: &StatusInfo) -> Result<Vec<u8>, EncodeError> {
    let count = u8::try_from(p.peaks.len()).map_err(|_| EncodeError::ConfigurationInvalid {
        field: "peaks",
        value: p.peaks.len() as u32,
    })?;
    let mut out = header(
        command::STATUS_INFO,
        p.session_id,
        StatusInfo::MIN_LEN + p.peaks.len() * 6,
    );
    out.push(p.battery);
    out.extend_from_slice(&p.temperature.to_le_bytes());
    out.extend_from_slice(&p.rms.to_le_bytes());
    out.extend_from_slice(&p.vpp.to_le_bytes());
    out.extend_from_slice(&p.kurtosis_ratio.to_le_bytes());
    out.push(p.ringdown_counts);
    out.extend_from_slice(&timing_to_wire("rise_time", p.rise_time)?.to_le_bytes());
    out.extend_from_slice(
        &timing_to_wire("threshold_duration", p.threshold_duration)?.to_le_bytes(),
    );
    out.push(count);
    let mut peaks: Vec<&FftPeak> = p.peaks.iter().collect();
    peaks.sort_by_key(|peak| peak.index);
    // Index block first, then value block.
    for peak in &peaks {
        out.extend_from_slice(&peak.index.to_le_bytes());
    }
    for peak in &peaks {
        out.extend_from_slice(&peak.value.to_le_bytes());
    }
    Ok(out)
}

/// Decode a received LoRa payload.
pub fn decode(bytes: &[u8]) -> Result<RadioPacket, DecodeError> {
    if bytes.len() > MAX_PACKET_LEN {
        return Err(DecodeError::Oversized { len: bytes.len() });
    }
    require(bytes, HEADER_LEN)?;

    let command = bytes[0];
    let session_id = bytes[1];
    let mut r = Reader::new(bytes, HEADER_LEN);

    let packet = match command {
        command::JOIN_REQUEST => {
            require(bytes, JoinRequest::LEN)?;
            RadioPacket::JoinRequest(JoinRequest {
                session_id,
                address: r.u32()?,
                start_time: r.u32()?,
                firmware_version: r.u8()?,
            })
        }
        command::JOIN_REPLY => {
            require(bytes, JoinReply::LEN)?;
            let result = r.u8()?;
            let bandwidth = r.u8()?;
            let spreading_factor = r.u8()?;
            let coding_rate = r.u8()?;
            let join_interval = r.u16()?;
            let mode = match r.u8()? {
                APP_MODE_STATUS => AppMode::Status,
                APP_MODE_EMBEDDED_CONFIG => {
                    require(bytes, JoinReply::LEN + ConfigBody::LEN)?;
                    AppMode::EmbeddedConfig(ConfigBody::read(&mut r)?)
                }
                other => {
                    return Err(DecodeError::FieldOutOfRange {
                        field: "app_mode",
                        value: other.into(),
                    })
                }
            };
            RadioPacket::JoinReply(JoinReply {
                session_id,
                result,
                bandwidth,
                spreading_factor,
                coding_rate,
                join_interval,
                mode,
            })
        }
        command::CONFIG_REQUEST => RadioPacket::ConfigRequest(ConfigRequest { session_id }),
        command::CONFIG_REPLY => {
            require(bytes, HEADER_LEN + ConfigBody::LEN)?;
            RadioPacket::ConfigReply(ConfigReply {
                session_id,
                body: ConfigBody::read(&mut r)?,
            })
        }
        command::STATUS_INFO => RadioPacket::StatusInfo(decode_status_info(bytes, session_id, &mut r)?),
        command::RESTART => {
            require(bytes, 3)?;
            RadioPacket::Restart(Restart {
                session_id,
                reset_config: r.flag("reset_config")?,
            })
        }
        command::SENSOR_DATA_REQUEST => {
            require(bytes, 4)?;
            RadioPacket::SensorDataRequest(SensorDataRequest {
                session_id,
                data_type: r.u8()?,
                samples: r.u8()?,
            })
        }
        command::SENSOR_DATA => {
            require(bytes, HEADER_LEN + 1)?;
            match r.u8()? {
                data_type::TEMPERATURE => {
                    RadioPacket::TemperatureData(decode_temperature(bytes, session_id, &mut r)?)
                }
                other => {
                    return Err(DecodeError::UnknownVariant {
                        command,
                        sub_type: Some(other),
                    })
                }
            }
        }
        command::FFT_CHUNK_REQUEST => {
            require(bytes, 3)?;
            expect_fft_type(command, r.u8()?)?;
            RadioPacket::FftChunkRequest(FftChunkRequest { session_id })
        }
        command::FFT_CHUNK_DATA => {
            require(bytes, FftChunkData::LEN)?;
            expect_fft_type(command, r.u8()?)?;
            let sequence = r.u8()?;
            let chunk_count = r.u8()?;
            let time = r.u32()?;
            let mut bins = [0.0f32; FFT_CHUNK_BINS];
            for bin in bins.iter_mut() {
                *bin = r.f32()?;
            }
            RadioPacket::FftChunkData(FftChunkData {
                session_id,
                sequence,
                chunk_count,
                time,
                bins,
            })
        }
        other => {
            return Err(DecodeError::UnknownVariant {
                command: other,
                sub_type: None,
            })
        }
    };

    r.finish()?;
    Ok(packet)
}

fn expect_fft_type(command: u8, found: u8) -> Result<(), DecodeError> {
    if found != data_type::FFT {
        return Err(DecodeError::UnknownVariant {
            command,
            sub_type: Some(found),
        });
    }
    Ok(())
}

fn decode_status_info(
    bytes: &[u8],
    session_id: u8,
    r: &mut Reader<'_>,
) -> Result<StatusInfo, DecodeError> {
    require(bytes, StatusInfo::MIN_LEN)?;
    let battery = r.u8()?;
    let temperature = r.u16()?;
    let rms = r.u16()?;
    let vpp = r.u16()?;
    let kurtosis_ratio = r.f32()?;
    let ringdown_counts = r.u8()?;
    let rise_time = timing_from_wire(r.u16()?);
    let threshold_duration = timing_from_wire(r.u16()?);
    let count = r.u8()? as usize;

    // The peak count describes the tail; check it before touching the tail.
    require(bytes, StatusInfo::MIN_LEN + count * 6)?;
    let mut indices = Vec::with_capacity(count);
    for _ in 0..count {
        indices.push(r.u16()?);
    }
    let mut peaks = Vec::with_capacity(count);
    for index in indices {
        peaks.push(FftPeak {
            index,
            value: r.f32()?,
        });
    }
    peaks.sort_by_key(|p| p.index);

    Ok(StatusInfo {
        session_id,
        battery,
        temperature,
        rms,
        vpp,
        kurtosis_ratio,
        ringdown_counts,
        rise_time,
        threshold_duration,
        peaks,
    })
}

fn decode_temperature(
    bytes: &[u8],
    session_id: u8,
    r: &mut Reader<'_>,
) -> Result<TemperatureData, DecodeError> {
    require(bytes, TemperatureData::MIN_LEN)?;
    let sequence = r.u8()?;
    let count = r.u8()? as usize;
    require(
        bytes,
        TemperatureData::MIN_LEN + count * TemperatureData::SAMPLE_LEN,
    )?;
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(TemperatureSample {
            time: r.u32()?,
            temperature: r.u16()?,
        });
    }
    Ok(TemperatureData {
        session_id,
        sequence,
        samples,
    })
}
