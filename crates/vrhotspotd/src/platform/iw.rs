//! `iw` invocation and output parsing.
//!
//! All parsers are pure text functions so they stay testable against
//! captured output; the async wrappers at the bottom run the tool with the
//! bounded runner.

use super::{iw_bin, run_cmd, CmdOutput, PROBE_TIMEOUT};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

static PHY_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^phy#(\d+)").expect("phy header regex"));
static FREQ_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\*\s+(\d+(?:\.\d+)?)\s+MHz\s+\[(\d+)\](.*)$").expect("freq line regex")
});
static CHANNEL_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^channel\s+(\d+)\s+\((\d+(?:\.\d+)?)\s+MHz\)").expect("channel line regex")
});
static WIDTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)width:\s*(\d+)\s*MHz").expect("width regex"));
static VHT_WIDTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Supported Channel Width:\s*(.+)$").expect("vht width regex")
});
static HE80_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)HE40/HE80(?:/5GHz)?").expect("he80 regex"));
static HE_IFTYPES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*HE Iftypes:\s*(.+)$").expect("he iftypes regex"));
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)\s*MBit/s").expect("bitrate regex"));
static SIGNAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-?\d+)(?:\s*\[[^\]]*\])?\s*dBm").expect("signal regex"));

/// One interface row from `iw dev`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevInterface {
    pub ifname: String,
    pub phy: Option<String>,
    pub addr: Option<String>,
    pub iftype: Option<String>,
    pub ssid: Option<String>,
    pub channel: Option<u16>,
    pub freq_mhz: Option<u32>,
    pub width_mhz: Option<u32>,
}

impl DevInterface {
    pub fn is_ap(&self) -> bool {
        self.iftype.as_deref() == Some("AP")
    }
}

/// Parse the full `iw dev` dump.
pub fn parse_dev(text: &str) -> Vec<DevInterface> {
    let mut out: Vec<DevInterface> = Vec::new();
    let mut current_phy: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if let Some(caps) = PHY_HEADER_RE.captures(line) {
            current_phy = Some(format!("phy{}", &caps[1]));
            continue;
        }
        if let Some(rest) = line.strip_prefix("Interface ") {
            out.push(DevInterface {
                ifname: rest.trim().to_string(),
                phy: current_phy.clone(),
                ..Default::default()
            });
            continue;
        }
        let Some(iface) = out.last_mut() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix("addr ") {
            iface.addr = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("ssid ") {
            iface.ssid = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("type ") {
            iface.iftype = Some(rest.trim().to_string());
        } else if let Some(caps) = CHANNEL_LINE_RE.captures(line) {
            iface.channel = caps[1].parse().ok();
            iface.freq_mhz = caps[2].parse::<f64>().ok().map(|f| f as u32);
            if let Some(w) = WIDTH_RE.captures(line) {
                iface.width_mhz = w[1].parse().ok();
            }
        }
    }
    out
}

/// Capability summary of one phy from `iw phy <phy> info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhyCaps {
    pub supports_ap: bool,
    pub supports_2_4ghz: bool,
    pub supports_5ghz: bool,
    pub supports_6ghz: bool,
    pub supports_80mhz: bool,
    pub supports_80211ax: bool,
}

fn he_iftypes_has_ap(text: &str) -> Option<bool> {
    let mut seen = false;
    for line in text.lines() {
        let Some(caps) = HE_IFTYPES_RE.captures(line) else {
            continue;
        };
        seen = true;
        for token in caps[1].split(',') {
            let t = token.trim().to_ascii_uppercase();
            if t == "AP" || t == "AP/VLAN" || t == "AP-VLAN" {
                return Some(true);
            }
        }
    }
    if seen {
        Some(false)
    } else {
        None
    }
}

/// Parse one phy's `iw phy info` output into capability flags.
pub fn parse_phy_info(text: &str) -> PhyCaps {
    let mut caps = PhyCaps::default();

    // AP support from the interface-modes list.
    let mut in_modes = false;
    for raw in text.lines() {
        let line = raw.trim();
        if line.starts_with("Supported interface modes") {
            in_modes = true;
            continue;
        }
        if in_modes {
            if let Some(mode) = line.strip_prefix('*') {
                let mode = mode.trim().to_ascii_uppercase();
                if mode == "AP" || mode.starts_with("AP/") || mode.starts_with("AP-") {
                    caps.supports_ap = true;
                }
            } else if !line.is_empty() {
                in_modes = false;
            }
        }
    }

    // Band support from enabled frequency rows.
    let mut in_freqs = false;
    for raw in text.lines() {
        let line = raw.trim();
        if line.starts_with("Frequencies:") {
            in_freqs = true;
            continue;
        }
        if in_freqs && !line.is_empty() && !line.starts_with('*') {
            in_freqs = false;
        }
        if !in_freqs {
            continue;
        }
        let Some(m) = FREQ_LINE_RE.captures(raw) else {
            continue;
        };
        let Ok(mhz) = m[1].parse::<f64>() else {
            continue;
        };
        let mhz = mhz as u32;
        let flags = m[3].to_ascii_lowercase();
        if flags.contains("disabled") || flags.contains("no ir") || flags.contains("no-ir") {
            continue;
        }
        match mhz {
            2400..=2500 => caps.supports_2_4ghz = true,
            4900..=5900 => caps.supports_5ghz = true,
            5925..=7125 => caps.supports_6ghz = true,
            _ => {}
        }
    }

    // 80 MHz: HE80 marker, else the VHT width line.
    if HE80_RE.is_match(text) {
        caps.supports_80mhz = true;
    } else if text.contains("VHT Capabilities") {
        let mut vht_80 = true;
        for line in text.lines() {
            if let Some(m) = VHT_WIDTH_RE.captures(line) {
                let val = m[1].trim().to_ascii_lowercase();
                if val.contains("20/40") && !val.contains("80") && !val.contains("160") {
                    vht_80 = false;
                }
                break;
            }
        }
        caps.supports_80mhz = vht_80;
    }

    caps.supports_80211ax = match he_iftypes_has_ap(text) {
        Some(v) => v,
        None => {
            let low = text.to_ascii_lowercase();
            low.contains("802.11ax") || low.contains("he capabilities")
        }
    };

    caps
}

/// Regulatory state per phy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhyReg {
    pub country: Option<String>,
    /// "self-managed" | "kernel-managed"
    pub source: String,
}

/// Parsed `iw reg get`.
#[derive(Debug, Clone, Default)]
pub struct RegReport {
    pub global_country: Option<String>,
    pub phys: HashMap<String, PhyReg>,
}

impl RegReport {
    /// Effective country for a phy: its own override, else the global domain.
    pub fn country_for(&self, phy: Option<&str>) -> String {
        phy.and_then(|p| self.phys.get(p))
            .and_then(|r| r.country.clone())
            .or_else(|| self.global_country.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn source_for(&self, phy: Option<&str>) -> String {
        phy.and_then(|p| self.phys.get(p))
            .map(|r| r.source.clone())
            .unwrap_or_else(|| "global".to_string())
    }
}

/// Parse `iw reg get`: a global section then optional per-phy sections.
pub fn parse_reg_get(text: &str) -> RegReport {
    let mut report = RegReport::default();
    let mut current_phy: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.starts_with("phy#") {
            let num = line
                .split_whitespace()
                .next()
                .and_then(|tok| tok.split('#').nth(1))
                .unwrap_or("");
            let phy = format!("phy{num}");
            let source = if line.contains("self-managed") {
                "self-managed"
            } else {
                "kernel-managed"
            };
            report.phys.insert(
                phy.clone(),
                PhyReg {
                    country: None,
                    source: source.to_string(),
                },
            );
            current_phy = Some(phy);
            continue;
        }
        if let Some(rest) = line.strip_prefix("country ") {
            let cc = rest
                .split_whitespace()
                .next()
                .map(|c| c.trim_end_matches(':').to_string());
            match &current_phy {
                None => report.global_country = cc,
                Some(phy) => {
                    if let Some(entry) = report.phys.get_mut(phy) {
                        entry.country = cc;
                    }
                }
            }
        }
    }
    report
}

/// Link info of one interface from `iw dev <if> info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkInfo {
    pub channel: Option<u16>,
    pub freq_mhz: Option<u32>,
    pub width_mhz: Option<u32>,
    pub iftype: Option<String>,
    pub ssid: Option<String>,
}

pub fn parse_dev_info(text: &str) -> LinkInfo {
    let mut info = LinkInfo::default();
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(caps) = CHANNEL_LINE_RE.captures(line) {
            info.channel = caps[1].parse().ok();
            info.freq_mhz = caps[2].parse::<f64>().ok().map(|f| f as u32);
            if let Some(w) = WIDTH_RE.captures(line) {
                info.width_mhz = w[1].parse().ok();
            }
        } else if let Some(rest) = line.strip_prefix("type ") {
            info.iftype = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("ssid ") {
            info.ssid = Some(rest.trim().to_string());
        }
    }
    info
}

/// One station row from `iw dev <if> station dump`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Station {
    pub mac: String,
    pub signal_dbm: Option<i32>,
    pub signal_avg_dbm: Option<i32>,
    pub tx_bitrate_mbps: Option<f64>,
    pub rx_bitrate_mbps: Option<f64>,
    pub tx_packets: Option<u64>,
    pub rx_packets: Option<u64>,
    pub tx_retries: Option<u64>,
    pub tx_failed: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub rx_bytes: Option<u64>,
    pub inactive_ms: Option<u64>,
    pub connected_time_s: Option<u64>,
}

fn first_u64(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

pub fn parse_station_dump(text: &str) -> Vec<Station> {
    let mut out: Vec<Station> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("Station ") {
            let mac = rest
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_ascii_lowercase();
            out.push(Station {
                mac,
                ..Default::default()
            });
            continue;
        }
        let Some(st) = out.last_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "signal" => {
                if let Some(m) = SIGNAL_RE.captures(value) {
                    st.signal_dbm = m[1].parse().ok();
                }
            }
            "signal avg" => {
                if let Some(m) = SIGNAL_RE.captures(value) {
                    st.signal_avg_dbm = m[1].parse().ok();
                }
            }
            "tx bitrate" => {
                if let Some(m) = BITRATE_RE.captures(value) {
                    st.tx_bitrate_mbps = m[1].parse().ok();
                }
            }
            "rx bitrate" => {
                if let Some(m) = BITRATE_RE.captures(value) {
                    st.rx_bitrate_mbps = m[1].parse().ok();
                }
            }
            "tx packets" => st.tx_packets = first_u64(value),
            "rx packets" => st.rx_packets = first_u64(value),
            "tx retries" => st.tx_retries = first_u64(value),
            "tx failed" => st.tx_failed = first_u64(value),
            "tx bytes" => st.tx_bytes = first_u64(value),
            "rx bytes" => st.rx_bytes = first_u64(value),
            "inactive time" => st.inactive_ms = first_u64(value),
            "connected time" => st.connected_time_s = first_u64(value),
            _ => {}
        }
    }
    out
}

/// Map a frequency to its band label.
pub fn band_from_freq_mhz(freq_mhz: u32) -> Option<&'static str> {
    match freq_mhz {
        2400..=2500 => Some("2.4ghz"),
        4900..=5900 => Some("5ghz"),
        5925..=7125 => Some("6ghz"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Async wrappers
// ---------------------------------------------------------------------------

pub async fn dev_dump() -> CmdOutput {
    run_cmd(&iw_bin(), &["dev"], PROBE_TIMEOUT).await
}

pub async fn phy_info(phy: &str) -> CmdOutput {
    run_cmd(&iw_bin(), &["phy", phy, "info"], Duration::from_secs(3)).await
}

pub async fn reg_get() -> CmdOutput {
    run_cmd(&iw_bin(), &["reg", "get"], PROBE_TIMEOUT).await
}

pub async fn reg_set(country: &str) -> CmdOutput {
    run_cmd(&iw_bin(), &["reg", "set", country], PROBE_TIMEOUT).await
}

pub async fn dev_info(ifname: &str) -> CmdOutput {
    run_cmd(&iw_bin(), &["dev", ifname, "info"], PROBE_TIMEOUT).await
}

pub async fn station_dump(ifname: &str) -> CmdOutput {
    run_cmd(&iw_bin(), &["dev", ifname, "station", "dump"], PROBE_TIMEOUT).await
}

pub async fn dev_del(ifname: &str) -> CmdOutput {
    run_cmd(&iw_bin(), &["dev", ifname, "del"], PROBE_TIMEOUT).await
}

pub async fn scan(ifname: &str) -> CmdOutput {
    run_cmd(&iw_bin(), &["dev", ifname, "scan"], Duration::from_secs(10)).await
}

pub async fn get_power_save(ifname: &str) -> CmdOutput {
    run_cmd(
        &iw_bin(),
        &["dev", ifname, "get", "power_save"],
        PROBE_TIMEOUT,
    )
    .await
}

pub async fn set_power_save(ifname: &str, on: bool) -> CmdOutput {
    let state = if on { "on" } else { "off" };
    run_cmd(
        &iw_bin(),
        &["dev", ifname, "set", "power_save", state],
        PROBE_TIMEOUT,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_DUMP: &str = "\
phy#0
\tInterface wlan0
\t\tifindex 3
\t\taddr dc:a6:32:01:02:03
\t\ttype managed
phy#1
\tInterface wlan1
\t\tifindex 5
\t\taddr 00:c0:ca:aa:bb:cc
\t\tssid VR-NET
\t\ttype AP
\t\tchannel 36 (5180 MHz), width: 80 MHz, center1: 5210 MHz
";

    #[test]
    fn test_parse_dev_two_phys() {
        let devs = parse_dev(DEV_DUMP);
        assert_eq!(devs.len(), 2);
        assert_eq!(devs[0].ifname, "wlan0");
        assert_eq!(devs[0].phy.as_deref(), Some("phy0"));
        assert!(!devs[0].is_ap());

        let ap = &devs[1];
        assert!(ap.is_ap());
        assert_eq!(ap.ssid.as_deref(), Some("VR-NET"));
        assert_eq!(ap.channel, Some(36));
        assert_eq!(ap.freq_mhz, Some(5180));
        assert_eq!(ap.width_mhz, Some(80));
    }

    const PHY_INFO: &str = "\
Wiphy phy1
\tSupported interface modes:
\t\t * managed
\t\t * AP
\t\t * AP/VLAN
\tBand 1:
\t\tVHT Capabilities (0x339071f2):
\t\t\tSupported Channel Width: neither 160 nor 80+80
\t\tHE Iftypes: managed, AP
\t\tFrequencies:
\t\t\t* 2412 MHz [1] (20.0 dBm)
\tBand 2:
\t\tFrequencies:
\t\t\t* 5180 MHz [36] (23.0 dBm)
\t\t\t* 5260 MHz [52] (23.0 dBm) (radar detection)
\t\t\t* 5500 MHz [100] (disabled)
";

    #[test]
    fn test_parse_phy_info_caps() {
        let caps = parse_phy_info(PHY_INFO);
        assert!(caps.supports_ap);
        assert!(caps.supports_2_4ghz);
        assert!(caps.supports_5ghz);
        assert!(!caps.supports_6ghz);
        assert!(caps.supports_80mhz);
        assert!(caps.supports_80211ax);
    }

    #[test]
    fn test_parse_phy_info_vht_2040_only() {
        let text = "\
Wiphy phy0
\tSupported interface modes:
\t\t * AP
\tVHT Capabilities (0x0):
\t\tSupported Channel Width: 20/40 MHz only
";
        let caps = parse_phy_info(text);
        assert!(!caps.supports_80mhz);
    }

    const REG_GET: &str = "\
global
country 00: DFS-UNSET
\t(2402 - 2472 @ 40), (6, 20), (N/A)

phy#1 (self-managed)
country US: DFS-FCC
\t(2400 - 2472 @ 40), (N/A, 30), (N/A)
";

    #[test]
    fn test_parse_reg_get() {
        let reg = parse_reg_get(REG_GET);
        assert_eq!(reg.global_country.as_deref(), Some("00"));
        assert_eq!(reg.country_for(Some("phy1")), "US");
        assert_eq!(reg.source_for(Some("phy1")), "self-managed");
        assert_eq!(reg.country_for(Some("phy9")), "00");
        assert_eq!(reg.source_for(None), "global");
    }

    const STATION_DUMP: &str = "\
Station aa:bb:cc:dd:ee:ff (on wlan1)
\tinactive time:\t50 ms
\trx bytes:\t1000000
\trx packets:\t800
\ttx bytes:\t2000000
\ttx packets:\t1500
\ttx retries:\t30
\ttx failed:\t2
\tsignal:  \t-44 [-44, -50] dBm
\tsignal avg:\t-45 dBm
\ttx bitrate:\t600.0 MBit/s VHT-MCS 9 80MHz short GI VHT-NSS 2
\trx bitrate:\t433.3 MBit/s
\tconnected time:\t120 seconds
";

    #[test]
    fn test_parse_station_dump() {
        let stations = parse_station_dump(STATION_DUMP);
        assert_eq!(stations.len(), 1);
        let st = &stations[0];
        assert_eq!(st.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(st.signal_dbm, Some(-44));
        assert_eq!(st.signal_avg_dbm, Some(-45));
        assert_eq!(st.tx_bitrate_mbps, Some(600.0));
        assert_eq!(st.rx_bitrate_mbps, Some(433.3));
        assert_eq!(st.tx_packets, Some(1500));
        assert_eq!(st.tx_failed, Some(2));
        assert_eq!(st.inactive_ms, Some(50));
        assert_eq!(st.connected_time_s, Some(120));
    }

    #[test]
    fn test_band_from_freq() {
        assert_eq!(band_from_freq_mhz(2412), Some("2.4ghz"));
        assert_eq!(band_from_freq_mhz(5180), Some("5ghz"));
        assert_eq!(band_from_freq_mhz(5955), Some("6ghz"));
        assert_eq!(band_from_freq_mhz(900), None);
    }

    #[test]
    fn test_parse_dev_info() {
        let text = "\
Interface wlan1
\tifindex 5
\ttype AP
\tssid VR-NET
\tchannel 36 (5180 MHz), width: 80 MHz, center1: 5210 MHz
";
        let info = parse_dev_info(text);
        assert_eq!(info.iftype.as_deref(), Some("AP"));
        assert_eq!(info.channel, Some(36));
        assert_eq!(info.width_mhz, Some(80));
        assert_eq!(info.ssid.as_deref(), Some("VR-NET"));
    }
}
