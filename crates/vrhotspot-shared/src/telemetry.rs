//! Telemetry wire types: per-station samples and rolling summaries.

use serde::{Deserialize, Serialize};

/// One connected station's link stats for a single sample window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSample {
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub signal_dbm: Option<i32>,
    pub tx_bitrate_mbps: Option<f64>,
    pub rx_bitrate_mbps: Option<f64>,
    pub retry_pct: Option<f64>,
    pub loss_pct: Option<f64>,
    pub tx_mbps: Option<f64>,
    pub rx_mbps: Option<f64>,
    /// 0-100 composite of signal strength, retry ratio and loss ratio.
    pub quality_score: Option<f64>,
    pub connected_time_s: Option<u64>,
}

/// Rolling summary across all connected stations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub client_count: usize,
    pub rssi_avg_dbm: Option<f64>,
    pub rssi_min_dbm: Option<i32>,
    pub quality_score_avg: Option<f64>,
    pub loss_pct_avg: Option<f64>,
    pub tx_mbps_total: Option<f64>,
    pub rx_mbps_total: Option<f64>,
}

/// Snapshot published into `Status.telemetry`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub enabled: bool,
    pub ts: i64,
    pub ap_interface: Option<String>,
    #[serde(default)]
    pub clients: Vec<ClientSample>,
    pub summary: TelemetrySummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Composite link quality on a 0-100 scale.
///
/// 100 corresponds to rssi >= -55 dBm with negligible retries and loss.
/// Weights: signal 40, loss 30, retries 20, bitrate 10.
pub fn quality_score(
    signal_dbm: Option<i32>,
    loss_pct: Option<f64>,
    retry_pct: Option<f64>,
    tx_bitrate_mbps: Option<f64>,
) -> Option<f64> {
    let rssi = signal_dbm?;
    // Full signal credit at -55 dBm and above, none at -90 and below.
    let rssi_score = ((rssi as f64 + 90.0) * (40.0 / 35.0)).clamp(0.0, 40.0);
    let loss_score = (30.0 - loss_pct.unwrap_or(0.0) * 6.0).clamp(0.0, 30.0);
    let retry_score = (20.0 - retry_pct.unwrap_or(0.0)).clamp(0.0, 20.0);
    let bitrate_score = tx_bitrate_mbps
        .map(|r| (r / 10.0).clamp(0.0, 10.0))
        .unwrap_or(0.0);
    Some(rssi_score + loss_score + retry_score + bitrate_score)
}
