//! Per-client link telemetry.
//!
//! A cooperative periodic task samples station stats from the AP daemon,
//! computes per-window deltas and a rolling summary, and publishes the
//! result into the status snapshot. It never touches the lifecycle lock.

use crate::platform::{ip_bin, iw, run_cmd, PROBE_TIMEOUT};
use std::collections::HashMap;
use std::time::Instant;
use vrhotspot_shared::telemetry::{quality_score, ClientSample, TelemetrySnapshot, TelemetrySummary};

/// Samples a warning condition must persist for before it is raised.
const WARNING_STREAK: u32 = 3;

/// RSSI floor for the low-signal warning.
const LOW_SIGNAL_DBM: f64 = -75.0;

/// Loss ceiling (percent) for the high-loss warning.
const HIGH_LOSS_PCT: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    tx_packets: Option<u64>,
    tx_retries: Option<u64>,
    tx_failed: Option<u64>,
    rx_packets: Option<u64>,
    tx_bytes: Option<u64>,
    rx_bytes: Option<u64>,
}

fn delta(prev: Option<u64>, cur: Option<u64>) -> Option<u64> {
    match (prev, cur) {
        (Some(p), Some(c)) if c >= p => Some(c - p),
        _ => None,
    }
}

fn ratio_pct(num: Option<u64>, denom: Option<u64>) -> Option<f64> {
    match (num, denom) {
        (Some(n), Some(d)) if d > 0 => Some(n as f64 / d as f64 * 100.0),
        _ => None,
    }
}

/// Stateful sampler: keeps the previous counters per station so each sample
/// yields window deltas rather than lifetime totals.
#[derive(Debug, Default)]
pub struct TelemetrySampler {
    prev: HashMap<String, Counters>,
    last_sample: Option<Instant>,
    low_signal_streak: u32,
    high_loss_streak: u32,
    failure_streak: u32,
}

impl TelemetrySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; called when the hotspot stops.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// IPv4 neighbors on the AP interface, for MAC-to-IP attribution.
    async fn neighbor_map(ap_ifname: &str) -> HashMap<String, String> {
        let out = run_cmd(
            &ip_bin(),
            &["-4", "neigh", "show", "dev", ap_ifname],
            PROBE_TIMEOUT,
        )
        .await;
        let mut map = HashMap::new();
        for line in out.stdout.lines() {
            // "192.168.68.17 lladdr aa:bb:cc:dd:ee:ff REACHABLE"
            let parts: Vec<&str> = line.split_whitespace().collect();
            if let Some(idx) = parts.iter().position(|p| *p == "lladdr") {
                if let (Some(ip), Some(mac)) = (parts.first(), parts.get(idx + 1)) {
                    map.insert(mac.to_ascii_lowercase(), ip.to_string());
                }
            }
        }
        map
    }

    /// Take one sample from the AP interface.
    pub async fn sample(&mut self, ap_ifname: &str) -> TelemetrySnapshot {
        let now = Instant::now();
        let dt = self.last_sample.map(|t| now.duration_since(t).as_secs_f64());
        self.last_sample = Some(now);

        let dump = iw::station_dump(ap_ifname).await;
        if !dump.ok() {
            self.failure_streak += 1;
            let mut snap = TelemetrySnapshot {
                enabled: true,
                ts: vrhotspot_shared::now_epoch(),
                ap_interface: Some(ap_ifname.to_string()),
                ..Default::default()
            };
            if self.failure_streak >= WARNING_STREAK {
                snap.warnings.push("sampling_degraded".to_string());
            }
            return snap;
        }
        self.failure_streak = 0;

        let stations = iw::parse_station_dump(&dump.combined());
        let neighbors = Self::neighbor_map(ap_ifname).await;

        let mut clients = Vec::with_capacity(stations.len());
        let mut rssis: Vec<f64> = Vec::new();
        let mut rssi_min: Option<i32> = None;
        let mut losses: Vec<f64> = Vec::new();
        let mut qualities: Vec<f64> = Vec::new();
        let mut tx_total = 0.0_f64;
        let mut rx_total = 0.0_f64;
        let mut any_rate = false;

        for st in &stations {
            let prev = self.prev.get(&st.mac).copied().unwrap_or_default();

            let d_tx = delta(prev.tx_packets, st.tx_packets);
            let d_retries = delta(prev.tx_retries, st.tx_retries);
            let d_failed = delta(prev.tx_failed, st.tx_failed);
            let d_tx_bytes = delta(prev.tx_bytes, st.tx_bytes);
            let d_rx_bytes = delta(prev.rx_bytes, st.rx_bytes);

            let attempted = match (d_tx, d_failed) {
                (Some(t), Some(f)) => Some(t + f),
                (Some(t), None) => Some(t),
                _ => None,
            };
            let loss_pct = ratio_pct(d_failed, attempted);
            let retry_pct = ratio_pct(d_retries, d_tx);

            let tx_mbps = match (dt, d_tx_bytes) {
                (Some(dt), Some(b)) if dt > 0.0 => Some(b as f64 * 8.0 / dt / 1_000_000.0),
                _ => None,
            };
            let rx_mbps = match (dt, d_rx_bytes) {
                (Some(dt), Some(b)) if dt > 0.0 => Some(b as f64 * 8.0 / dt / 1_000_000.0),
                _ => None,
            };

            let quality = quality_score(st.signal_dbm, loss_pct, retry_pct, st.tx_bitrate_mbps);

            if let Some(rssi) = st.signal_dbm {
                rssis.push(rssi as f64);
                rssi_min = Some(rssi_min.map_or(rssi, |m| m.min(rssi)));
            }
            if let Some(loss) = loss_pct {
                losses.push(loss);
            }
            if let Some(q) = quality {
                qualities.push(q);
            }
            if let Some(tx) = tx_mbps {
                tx_total += tx;
                any_rate = true;
            }
            if let Some(rx) = rx_mbps {
                rx_total += rx;
                any_rate = true;
            }

            clients.push(ClientSample {
                mac: Some(st.mac.clone()),
                ip: neighbors.get(&st.mac).cloned(),
                signal_dbm: st.signal_dbm,
                tx_bitrate_mbps: st.tx_bitrate_mbps,
                rx_bitrate_mbps: st.rx_bitrate_mbps,
                retry_pct,
                loss_pct,
                tx_mbps,
                rx_mbps,
                quality_score: quality,
                connected_time_s: st.connected_time_s,
            });

            self.prev.insert(
                st.mac.clone(),
                Counters {
                    tx_packets: st.tx_packets,
                    tx_retries: st.tx_retries,
                    tx_failed: st.tx_failed,
                    rx_packets: st.rx_packets,
                    tx_bytes: st.tx_bytes,
                    rx_bytes: st.rx_bytes,
                },
            );
        }

        // Drop stations that disconnected.
        let live: Vec<String> = stations.iter().map(|s| s.mac.clone()).collect();
        self.prev.retain(|mac, _| live.contains(mac));

        let avg = |values: &[f64]| -> Option<f64> {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };
        let summary = TelemetrySummary {
            client_count: clients.len(),
            rssi_avg_dbm: avg(&rssis),
            rssi_min_dbm: rssi_min,
            quality_score_avg: avg(&qualities),
            loss_pct_avg: avg(&losses),
            tx_mbps_total: any_rate.then_some(tx_total),
            rx_mbps_total: any_rate.then_some(rx_total),
        };

        let mut warnings = Vec::new();
        match summary.rssi_avg_dbm {
            Some(rssi) if rssi < LOW_SIGNAL_DBM => self.low_signal_streak += 1,
            _ => self.low_signal_streak = 0,
        }
        match summary.loss_pct_avg {
            Some(loss) if loss > HIGH_LOSS_PCT => self.high_loss_streak += 1,
            _ => self.high_loss_streak = 0,
        }
        if self.low_signal_streak > WARNING_STREAK {
            warnings.push("low_signal".to_string());
        }
        if self.high_loss_streak > WARNING_STREAK {
            warnings.push("high_loss".to_string());
        }

        TelemetrySnapshot {
            enabled: true,
            ts: vrhotspot_shared::now_epoch(),
            ap_interface: Some(ap_ifname.to_string()),
            clients,
            summary,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_rejects_counter_reset() {
        assert_eq!(delta(Some(100), Some(150)), Some(50));
        assert_eq!(delta(Some(100), Some(50)), None);
        assert_eq!(delta(None, Some(50)), None);
    }

    #[test]
    fn test_ratio_pct() {
        assert_eq!(ratio_pct(Some(5), Some(100)), Some(5.0));
        assert_eq!(ratio_pct(Some(5), Some(0)), None);
        assert_eq!(ratio_pct(None, Some(100)), None);
    }

    #[tokio::test]
    async fn test_sampler_flags_degraded_after_streak() {
        let mut sampler = TelemetrySampler::new();
        // Station dump against a missing interface fails; three consecutive
        // failures raise the warning.
        let s1 = sampler.sample("vrhs-missing0").await;
        assert!(s1.warnings.is_empty());
        let _ = sampler.sample("vrhs-missing0").await;
        let s3 = sampler.sample("vrhs-missing0").await;
        assert!(s3.warnings.contains(&"sampling_degraded".to_string()));
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let mut sampler = TelemetrySampler::new();
        let _ = sampler.sample("vrhs-missing0").await;
        sampler.reset();
        assert_eq!(sampler.failure_streak, 0);
        assert!(sampler.prev.is_empty());
    }
}
