//! Channel auto-selection: score channels by how many networks already
//! occupy them and pick the least crowded one.

use crate::platform::iw;
use tracing::debug;

/// One scanned channel with an interference score (higher = cleaner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelScore {
    pub channel: u16,
    pub bss_count: u32,
    pub score: i32,
}

fn freq_to_channel(freq_mhz: u32) -> Option<u16> {
    match freq_mhz {
        2412..=2472 => Some(((freq_mhz - 2407) / 5) as u16),
        2484 => Some(14),
        4910..=5890 => Some(((freq_mhz - 5000) / 5) as u16),
        5955..=7115 => Some(((freq_mhz - 5950) / 5) as u16),
        _ => None,
    }
}

fn band_contains(band: &str, freq_mhz: u32) -> bool {
    match band {
        "2.4ghz" => (2400..=2500).contains(&freq_mhz),
        "5ghz" => (4900..=5900).contains(&freq_mhz),
        "6ghz" => (5925..=7125).contains(&freq_mhz),
        _ => false,
    }
}

/// Count BSS entries per channel in `iw scan` output for one band.
pub fn parse_scan(text: &str, band: &str) -> Vec<ChannelScore> {
    let mut counts: std::collections::BTreeMap<u16, u32> = std::collections::BTreeMap::new();
    for raw in text.lines() {
        let line = raw.trim();
        let Some(rest) = line.strip_prefix("freq:") else {
            continue;
        };
        let Ok(freq) = rest
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .parse::<f64>()
        else {
            continue;
        };
        let freq = freq as u32;
        if !band_contains(band, freq) {
            continue;
        }
        if let Some(channel) = freq_to_channel(freq) {
            *counts.entry(channel).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .map(|(channel, bss_count)| ChannelScore {
            channel,
            bss_count,
            score: 100 - (bss_count as i32 * 10).min(100),
        })
        .collect()
}

/// Pick the cleanest channel among the scored ones. The current channel is
/// kept when it is already among the top three.
pub fn pick_best(mut scored: Vec<ChannelScore>, current: Option<u16>) -> Option<u16> {
    if scored.is_empty() {
        return current;
    }
    scored.sort_by(|a, b| b.score.cmp(&a.score).then(a.channel.cmp(&b.channel)));
    if let Some(cur) = current {
        if scored.iter().take(3).any(|c| c.channel == cur) {
            return Some(cur);
        }
    }
    scored.first().map(|c| c.channel)
}

/// Scan and select. Returns `current` unchanged when the scan fails.
pub async fn select_best_channel(ifname: &str, band: &str, current: Option<u16>) -> Option<u16> {
    let out = iw::scan(ifname).await;
    if !out.ok() {
        debug!("channel scan failed on {}: {}", ifname, out.code);
        return current;
    }
    pick_best(parse_scan(&out.combined(), band), current)
}
