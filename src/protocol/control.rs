//! JSON control plane between the gateway and the backend.
//!
//! Every datagram is a single JSON object:
//!
//! ```text
//! {"cmd": <u8>, "topic": "<getInfo|getConfig|postData>", "data": {...} | [...]}
//! ```
//!
//! `topic` is only set on gateway to backend requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Control command bytes.
pub mod cmd {
    pub const NODE_INFO_REPLY: u8 = 0x01;
    pub const CONFIG_REPLY: u8 = 0x02;
    pub const STATUSINFO_ACK: u8 = 0x03;
    pub const RESET_HARD: u8 = 0x04;
    pub const RESET_CONFIG: u8 = 0x05;
    pub const NODE_INFO_REQUEST: u8 = 0x10;
    pub const CONFIG_REQUEST: u8 = 0x20;
    pub const STATUSINFO_POST: u8 = 0x30;
}

pub const TOPIC_GET_INFO: &str = "getInfo";
pub const TOPIC_GET_CONFIG: &str = "getConfig";
pub const TOPIC_POST_DATA: &str = "postData";

/// Default backend port assigned to a node.
pub const DEFAULT_NODE_PORT: u16 = 8888;

#[derive(Debug)]
pub enum ControlError {
    /// Datagram is not valid JSON or does not match the expected shape.
    Json(serde_json::Error),
    /// `cmd` does not name a known message.
    UnknownCommand(u8),
    /// `fftPeaks` is not a list of `[index, value]` pairs.
    MalformedPeaks(String),
    /// A reply carried no record: the backend does not know the key.
    NoRecord(u8),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed control message: {}", e),
            Self::UnknownCommand(c) => write!(f, "unknown control command 0x{:02X}", c),
            Self::MalformedPeaks(s) => write!(f, "malformed fftPeaks: {}", s),
            Self::NoRecord(c) => write!(f, "reply 0x{:02X} carries no record", c),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    cmd: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Formats addresses and session ids the way the backend stores them.
pub fn format_hex_u32(value: u32) -> String {
    format!("0x{:08X}", value)
}

/// Accepts `"0x1F"`, `"31"` or a bare JSON number.
fn parse_hex(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

mod hex_u32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_hex_u32(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let raw = Value::deserialize(d)?;
        super::parse_hex(&raw)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid address {}", raw)))
    }
}

mod hex_u8 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u8, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{:02X}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
        let raw = Value::deserialize(d)?;
        super::parse_hex(&raw)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid session id {}", raw)))
    }
}

fn is_empty_record(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn default_port() -> u16 {
    DEFAULT_NODE_PORT
}

/// Identity lookup by hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfoRequest {
    #[serde(with = "hex_u32")]
    pub address: u32,
}

/// Node identity as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfoReply {
    #[serde(rename = "idloranode")]
    pub node_id: u32,
    #[serde(with = "hex_u32")]
    pub address: u32,
    #[serde(rename = "sessionid", with = "hex_u8")]
    pub session_id: u8,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "fwver", default)]
    pub firmware_version: u8,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    #[serde(rename = "idloranode")]
    pub node_id: u32,
}

/// One backend setting. `code` is a dotted path; only its last segment matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub code: String,
    pub datatype: String,
    pub value: Value,
}

impl Setting {
    pub fn new(code: &str, datatype: &str, value: impl Into<Value>) -> Self {
        Self {
            code: code.to_string(),
            datatype: datatype.to_string(),
            value: value.into(),
        }
    }

    /// Trailing segment of the dotted code.
    pub fn key(&self) -> &str {
        self.code.rsplit('.').next().unwrap_or(&self.code)
    }
}

/// Telemetry upload built from a StatusInfo radio packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusinfoPost {
    #[serde(rename = "idloranode")]
    pub node_id: u32,
    #[serde(rename = "rsii")]
    pub rssi: i32,
    pub snr: f32,
    /// Local time, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    /// Battery level in percent.
    pub battery: f64,
    pub temperature: f64,
    /// Volts.
    pub rms: f64,
    /// Volts.
    pub vpp: f64,
    #[serde(rename = "krestfactor")]
    pub crest_factor: f64,
    #[serde(rename = "kurtosisratio")]
    pub kurtosis_ratio: f32,
    #[serde(rename = "ringdowncounts")]
    pub ringdown_counts: u8,
    /// Seconds.
    #[serde(rename = "risetime")]
    pub rise_time: f64,
    /// Seconds.
    #[serde(rename = "thresholdduration")]
    pub threshold_duration: f64,
    /// JSON encoded `[[index, value], ...]`, ascending by index.
    #[serde(rename = "fftPeaks")]
    pub fft_peaks: String,
    pub fs: f64,
    #[serde(rename = "N")]
    pub n: u16,
    #[serde(rename = "thresholdvoltage")]
    pub threshold_voltage: f64,
}

impl StatusinfoPost {
    /// Encode peak pairs into the `fftPeaks` string form.
    pub fn encode_peaks(peaks: &[(u16, f32)]) -> String {
        let mut sorted = peaks.to_vec();
        sorted.sort_by_key(|(index, _)| *index);
        // A list of integer/float pairs always serializes.
        serde_json::to_string(&sorted).unwrap_or_else(|_| "[]".to_string())
    }

    /// Decode the `fftPeaks` string back into pairs.
    pub fn peaks(&self) -> Result<Vec<(u16, f32)>, ControlError> {
        serde_json::from_str(&self.fft_peaks)
            .map_err(|_| ControlError::MalformedPeaks(self.fft_peaks.clone()))
    }
}

/// A control plane message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    NodeInfoRequest(NodeInfoRequest),
    NodeInfoReply(NodeInfoReply),
    ConfigRequest(ConfigRequest),
    ConfigReply(Vec<Setting>),
    StatusinfoPost(Box<StatusinfoPost>),
    StatusinfoAck,
    ResetHard,
    ResetConfig,
}

impl ControlMessage {
    pub fn cmd(&self) -> u8 {
        match self {
            Self::NodeInfoRequest(_) => cmd::NODE_INFO_REQUEST,
            Self::NodeInfoReply(_) => cmd::NODE_INFO_REPLY,
            Self::ConfigRequest(_) => cmd::CONFIG_REQUEST,
            Self::ConfigReply(_) => cmd::CONFIG_REPLY,
            Self::StatusinfoPost(_) => cmd::STATUSINFO_POST,
            Self::StatusinfoAck => cmd::STATUSINFO_ACK,
            Self::ResetHard => cmd::RESET_HARD,
            Self::ResetConfig => cmd::RESET_CONFIG,
        }
    }

    /// Backend topic for gateway originated requests.
    pub fn topic(&self) -> Option<&'static str> {
        match self {
            Self::NodeInfoRequest(_) => Some(TOPIC_GET_INFO),
            Self::ConfigRequest(_) => Some(TOPIC_GET_CONFIG),
            Self::StatusinfoPost(_) => Some(TOPIC_POST_DATA),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeInfoRequest(_) => "NodeInfoRequest",
            Self::NodeInfoReply(_) => "NodeInfoReply",
            Self::ConfigRequest(_) => "ConfigRequest",
            Self::ConfigReply(_) => "ConfigReply",
            Self::StatusinfoPost(_) => "StatusinfoPost",
            Self::StatusinfoAck => "StatusinfoAck",
            Self::ResetHard => "ResetHard",
            Self::ResetConfig => "ResetConfig",
        }
    }

    pub fn to_value(&self) -> Result<Value, ControlError> {
        let data = match self {
            Self::NodeInfoRequest(m) => serde_json::to_value(m)?,
            Self::NodeInfoReply(m) => serde_json::to_value(m)?,
            Self::ConfigRequest(m) => serde_json::to_value(m)?,
            Self::ConfigReply(settings) => serde_json::to_value(settings)?,
            Self::StatusinfoPost(m) => serde_json::to_value(m)?,
            Self::StatusinfoAck | Self::ResetHard | Self::ResetConfig => {
                Value::Object(Default::default())
            }
        };
        let envelope = Envelope {
            cmd: self.cmd(),
            topic: self.topic().map(str::to_string),
            data,
        };
        Ok(serde_json::to_value(envelope)?)
    }

    pub fn to_json(&self) -> Result<String, ControlError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ControlError> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        let data = envelope.data;
        if matches!(envelope.cmd, cmd::NODE_INFO_REPLY | cmd::CONFIG_REPLY) && is_empty_record(&data) {
            return Err(ControlError::NoRecord(envelope.cmd));
        }
        let message = match envelope.cmd {
            cmd::NODE_INFO_REQUEST => Self::NodeInfoRequest(serde_json::from_value(data)?),
            cmd::NODE_INFO_REPLY => Self::NodeInfoReply(serde_json::from_value(data)?),
            cmd::CONFIG_REQUEST => Self::ConfigRequest(serde_json::from_value(data)?),
            cmd::CONFIG_REPLY => Self::ConfigReply(serde_json::from_value(data)?),
            cmd::STATUSINFO_POST => Self::StatusinfoPost(Box::new(serde_json::from_value(data)?)),
            cmd::STATUSINFO_ACK => Self::StatusinfoAck,
            cmd::RESET_HARD => Self::ResetHard,
            cmd::RESET_CONFIG => Self::ResetConfig,
            other => return Err(ControlError::UnknownCommand(other)),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_info_request_envelope() {
        let msg = ControlMessage::NodeInfoRequest(NodeInfoRequest {
            address: 0x0D47_3533,
        });
        let value = msg.to_value().unwrap();
        assert_eq!(
            value,
            json!({"cmd": 16, "topic": "getInfo", "data": {"address": "0x0D473533"}})
        );
    }

    #[test]
    fn test_node_info_reply_parses_backend_row() {
        let raw = br#"{"cmd": 1, "data": {"idloranode": 7, "address": "0x0D473533",
            "sessionid": "0x01", "code": "N7", "name": "pump", "fwver": 3}}"#;
        let msg = ControlMessage::from_json(raw).unwrap();
        assert_eq!(
            msg,
            ControlMessage::NodeInfoReply(NodeInfoReply {
                node_id: 7,
                address: 0x0D47_3533,
                session_id: 1,
                code: "N7".into(),
                name: "pump".into(),
                firmware_version: 3,
                port: DEFAULT_NODE_PORT,
            })
        );
    }

    #[test]
    fn test_session_id_accepts_number() {
        let raw = br#"{"cmd": 1, "data": {"idloranode": 7, "address": 222770483, "sessionid": 2}}"#;
        match ControlMessage::from_json(raw).unwrap() {
            ControlMessage::NodeInfoReply(reply) => {
                assert_eq!(reply.session_id, 2);
                assert_eq!(reply.address, 0x0D47_3533);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_session_id_out_of_range() {
        let raw = br#"{"cmd": 1, "data": {"idloranode": 7, "address": "0x1", "sessionid": "0x1FF"}}"#;
        assert!(matches!(
            ControlMessage::from_json(raw),
            Err(ControlError::Json(_))
        ));
    }

    #[test]
    fn test_config_reply_settings_list() {
        let raw = br#"{"cmd": 2, "data": [
            {"code": "lora.node.statusinfo_interval", "datatype": "int", "value": "60"},
            {"code": "fft.fft_adc_divider", "datatype": "pointer", "value": "ASYNC_DIV4"}
        ]}"#;
        match ControlMessage::from_json(raw).unwrap() {
            ControlMessage::ConfigReply(settings) => {
                assert_eq!(settings.len(), 2);
                assert_eq!(settings[0].key(), "statusinfo_interval");
                assert_eq!(settings[1].value, json!("ASYNC_DIV4"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reset_and_ack_without_data() {
        assert_eq!(
            ControlMessage::from_json(br#"{"cmd": 4}"#).unwrap(),
            ControlMessage::ResetHard
        );
        assert_eq!(
            ControlMessage::from_json(br#"{"cmd": 5, "data": {}}"#).unwrap(),
            ControlMessage::ResetConfig
        );
        assert_eq!(
            ControlMessage::from_json(br#"{"cmd": 3, "data": {"ok": true}}"#).unwrap(),
            ControlMessage::StatusinfoAck
        );
    }

    #[test]
    fn test_empty_reply_is_no_record() {
        assert!(matches!(
            ControlMessage::from_json(br#"{"cmd": 1, "data": {}}"#),
            Err(ControlError::NoRecord(cmd::NODE_INFO_REPLY))
        ));
        assert!(matches!(
            ControlMessage::from_json(br#"{"cmd": 2, "data": []}"#),
            Err(ControlError::NoRecord(cmd::CONFIG_REPLY))
        ));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            ControlMessage::from_json(br#"{"cmd": 153, "data": {}}"#),
            Err(ControlError::UnknownCommand(153))
        ));
    }

    #[test]
    fn test_statusinfo_post_keys_and_peaks() {
        let post = StatusinfoPost {
            node_id: 7,
            rssi: -80,
            snr: 7.5,
            timestamp: "2024-01-01 12:00:00".into(),
            battery: 50.0,
            temperature: 23.5,
            rms: 0.5,
            vpp: 1.5,
            crest_factor: 3.0,
            kurtosis_ratio: 1.25,
            ringdown_counts: 4,
            rise_time: 0.0,
            threshold_duration: 0.001,
            fft_peaks: StatusinfoPost::encode_peaks(&[(5, 9.0), (1, 1.0)]),
            fs: 200_000.0,
            n: 1024,
            threshold_voltage: 1.0,
        };
        assert_eq!(post.fft_peaks, "[[1,1.0],[5,9.0]]");

        let msg = ControlMessage::StatusinfoPost(Box::new(post.clone()));
        let value = msg.to_value().unwrap();
        assert_eq!(value["topic"], "postData");
        assert_eq!(value["data"]["rsii"], -80);
        assert_eq!(value["data"]["N"], 1024);
        assert_eq!(value["data"]["krestfactor"], 3.0);

        let back = ControlMessage::from_json(msg.to_json().unwrap().as_bytes()).unwrap();
        match back {
            ControlMessage::StatusinfoPost(p) => {
                assert_eq!(p.peaks().unwrap(), vec![(1, 1.0), (5, 9.0)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
