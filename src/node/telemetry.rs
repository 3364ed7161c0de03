//! StatusInfo radio packet to backend StatusinfoPost translation.

use super::config::{NodeConfig, BATTERY_FULL};
use super::params::NodeParams;
use crate::gateway::radio::LinkQuality;
use crate::protocol::control::StatusinfoPost;
use crate::protocol::options::OptionError;
use crate::protocol::radio::StatusInfo;
use chrono::{Local, NaiveDateTime};

/// Backend timestamp format.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local time in backend format.
pub fn timestamp_now() -> String {
    format_timestamp(Local::now().naive_local())
}

/// Build the telemetry upload for one StatusInfo packet.
///
/// Fails only when the configuration holds option indices that no longer
/// resolve, which `NodeConfig::from_settings` prevents.
pub fn statusinfo_post(
    info: &StatusInfo,
    link: LinkQuality,
    params: &NodeParams,
    config: &NodeConfig,
    timestamp: String,
) -> Result<StatusinfoPost, OptionError> {
    let fft = config.fft_params()?;
    let rms = config.counts_to_volts(info.rms);
    let vpp = config.counts_to_volts(info.vpp);
    let crest_factor = if rms > 0.0 { vpp / rms } else { 0.0 };

    Ok(StatusinfoPost {
        node_id: params.node_id,
        rssi: i32::from(link.rssi),
        snr: link.snr,
        timestamp,
        battery: f64::from(info.battery) * 100.0 / BATTERY_FULL,
        temperature: f64::from(info.temperature) * config.temperature_calibration,
        rms,
        vpp,
        crest_factor,
        kurtosis_ratio: info.kurtosis_ratio,
        ringdown_counts: info.ringdown_counts,
        rise_time: info.rise_time_secs(fft.fs),
        threshold_duration: info.threshold_duration_secs(fft.fs),
        fft_peaks: StatusinfoPost::encode_peaks(&info.fft_peaks()),
        fs: fft.fs,
        n: fft.n,
        threshold_voltage: config.dsp_threshold_voltage,
    })
}
