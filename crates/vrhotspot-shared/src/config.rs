//! Configuration record, defaults, patch-merge and validation.
//!
//! The record never carries the passphrase; that lives in the side-store
//! (`store::PassphraseStore`). Serialized views expose only
//! `wpa2_passphrase_set` and `wpa2_passphrase_len`.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Requested radio band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BandPreference {
    /// Resolve to the best supported band of the chosen adapter at start time.
    Recommended,
    #[serde(rename = "2.4ghz", alias = "2ghz")]
    Band2g,
    #[default]
    #[serde(rename = "5ghz")]
    Band5g,
    #[serde(rename = "6ghz")]
    Band6g,
}

impl BandPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            BandPreference::Recommended => "recommended",
            BandPreference::Band2g => "2.4ghz",
            BandPreference::Band5g => "5ghz",
            BandPreference::Band6g => "6ghz",
        }
    }
}

/// AP authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApSecurity {
    #[default]
    Wpa2,
    Wpa3Sae,
}

impl ApSecurity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApSecurity::Wpa2 => "wpa2",
            ApSecurity::Wpa3Sae => "wpa3_sae",
        }
    }
}

/// Requested channel width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChannelWidth {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "20")]
    Mhz20,
    #[serde(rename = "40")]
    Mhz40,
    #[serde(rename = "80")]
    Mhz80,
}

impl ChannelWidth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelWidth::Auto => "auto",
            ChannelWidth::Mhz20 => "20",
            ChannelWidth::Mhz40 => "40",
            ChannelWidth::Mhz80 => "80",
        }
    }

    pub fn mhz(&self) -> Option<u32> {
        match self {
            ChannelWidth::Auto => None,
            ChannelWidth::Mhz20 => Some(20),
            ChannelWidth::Mhz40 => Some(40),
            ChannelWidth::Mhz80 => Some(80),
        }
    }
}

/// QoS preset applied to the AP interface while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QosPreset {
    #[default]
    Off,
    Vr,
    Balanced,
    UltraLowLatency,
    HighThroughput,
}

impl QosPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            QosPreset::Off => "off",
            QosPreset::Vr => "vr",
            QosPreset::Balanced => "balanced",
            QosPreset::UltraLowLatency => "ultra_low_latency",
            QosPreset::HighThroughput => "high_throughput",
        }
    }
}

/// DNS servers offered over DHCP: the gateway itself or a literal list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DhcpDns {
    Keyword(String),
    Servers(Vec<Ipv4Addr>),
}

impl Default for DhcpDns {
    fn default() -> Self {
        DhcpDns::Keyword("gateway".to_string())
    }
}

impl DhcpDns {
    /// The value handed to the DHCP server, resolved against the gateway.
    pub fn offer(&self, gateway: Ipv4Addr) -> Option<String> {
        match self {
            DhcpDns::Keyword(k) if k == "gateway" => Some(gateway.to_string()),
            DhcpDns::Keyword(k) if k == "no" => None,
            DhcpDns::Keyword(k) => Some(k.clone()),
            DhcpDns::Servers(list) => {
                if list.is_empty() {
                    None
                } else {
                    Some(
                        list.iter()
                            .map(|ip| ip.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    )
                }
            }
        }
    }
}

fn default_ssid() -> String {
    "VR-Hotspot".to_string()
}

fn default_country() -> String {
    "US".to_string()
}

fn default_channel_2g() -> u8 {
    6
}

fn default_gateway() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 68, 1)
}

fn default_dhcp_start() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 68, 10)
}

fn default_dhcp_end() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 68, 250)
}

fn default_true() -> bool {
    true
}

fn default_zone() -> String {
    "trusted".to_string()
}

fn default_ap_ready_timeout() -> f64 {
    6.0
}

fn default_telemetry_interval() -> f64 {
    2.0
}

fn default_watchdog_interval() -> f64 {
    2.0
}

fn default_beacon_interval() -> u32 {
    50
}

fn default_dtim() -> u8 {
    1
}

/// The persisted configuration record.
///
/// Keys absent from a saved file take defaults on load; unknown keys are
/// preserved by the store but ignored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,

    // Wi-Fi identity
    pub ssid: String,

    // Radio
    pub band_preference: BandPreference,
    pub ap_security: ApSecurity,
    pub country: String,
    pub channel_2g_fallback: u8,
    pub channel_5g: Option<u16>,
    pub channel_6g: Option<u16>,
    pub channel_width: ChannelWidth,
    pub beacon_interval_ms: u32,
    pub dtim_period: u8,
    pub short_guard_interval: bool,
    pub tx_power_dbm: Option<i32>,
    pub channel_auto_select: bool,
    /// Tells the backend not to clone a virtual AP interface.
    pub optimized_no_virt: bool,

    // Adapter
    pub ap_adapter_ifname: Option<String>,

    // Network plane
    pub lan_gateway_ip: Ipv4Addr,
    pub dhcp_start_ip: Ipv4Addr,
    pub dhcp_end_ip: Ipv4Addr,
    pub dhcp_dns: DhcpDns,
    pub enable_internet: bool,
    pub bridge_mode: bool,
    pub bridge_name: Option<String>,
    pub bridge_uplink_ifname: Option<String>,

    // Tuning toggles
    pub wifi_power_save_disable: bool,
    pub usb_autosuspend_disable: bool,
    pub cpu_governor_performance: bool,
    pub sysctl_tuning: bool,
    pub interrupt_coalescing: bool,
    pub tcp_low_latency: bool,
    pub memory_tuning: bool,
    pub io_scheduler_optimize: bool,
    pub cpu_affinity_mask: Option<String>,
    pub irq_affinity_mask: Option<String>,

    // Firewall
    pub firewall_enabled: bool,
    pub firewall_enable_masquerade: bool,
    pub firewall_enable_forward: bool,
    pub firewall_cleanup_on_stop: bool,
    pub firewall_zone: String,

    // QoS
    pub qos_preset: QosPreset,
    pub nat_accel: bool,

    // Timing
    pub ap_ready_timeout_s: f64,
    pub telemetry_enable: bool,
    pub telemetry_interval_s: f64,
    pub watchdog_enable: bool,
    pub watchdog_interval_s: f64,
    pub autostart: bool,

    // Diagnostics
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            ssid: default_ssid(),
            band_preference: BandPreference::default(),
            ap_security: ApSecurity::default(),
            country: default_country(),
            channel_2g_fallback: default_channel_2g(),
            channel_5g: None,
            channel_6g: None,
            channel_width: ChannelWidth::default(),
            beacon_interval_ms: default_beacon_interval(),
            dtim_period: default_dtim(),
            short_guard_interval: true,
            tx_power_dbm: None,
            channel_auto_select: false,
            optimized_no_virt: false,
            ap_adapter_ifname: None,
            lan_gateway_ip: default_gateway(),
            dhcp_start_ip: default_dhcp_start(),
            dhcp_end_ip: default_dhcp_end(),
            dhcp_dns: DhcpDns::default(),
            enable_internet: true,
            bridge_mode: false,
            bridge_name: None,
            bridge_uplink_ifname: None,
            wifi_power_save_disable: true,
            usb_autosuspend_disable: true,
            cpu_governor_performance: false,
            sysctl_tuning: false,
            interrupt_coalescing: false,
            tcp_low_latency: false,
            memory_tuning: false,
            io_scheduler_optimize: false,
            cpu_affinity_mask: None,
            irq_affinity_mask: None,
            firewall_enabled: default_true(),
            firewall_enable_masquerade: default_true(),
            firewall_enable_forward: default_true(),
            firewall_cleanup_on_stop: default_true(),
            firewall_zone: default_zone(),
            qos_preset: QosPreset::default(),
            nat_accel: false,
            ap_ready_timeout_s: default_ap_ready_timeout(),
            telemetry_enable: true,
            telemetry_interval_s: default_telemetry_interval(),
            watchdog_enable: true,
            watchdog_interval_s: default_watchdog_interval(),
            autostart: false,
            debug: false,
        }
    }
}

/// A single validation failure, keyed by the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
}

impl FieldError {
    pub fn new(field: &str, code: &str) -> Self {
        Self {
            field: field.to_string(),
            code: code.to_string(),
        }
    }
}

fn same_slash24(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a.octets()[..3] == b.octets()[..3]
}

impl Config {
    /// Validate the whole record. Returns every violation, not just the first.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        let ssid_bytes = self.ssid.as_bytes();
        if ssid_bytes.is_empty() || ssid_bytes.len() > 32 {
            errors.push(FieldError::new("ssid", "ssid_length_1_32"));
        }
        if self.ssid.chars().any(|c| c.is_control()) {
            errors.push(FieldError::new("ssid", "ssid_control_chars"));
        }

        if !(1..=14).contains(&self.channel_2g_fallback) {
            errors.push(FieldError::new("channel_2g_fallback", "channel_2g_range_1_14"));
        }

        if self.band_preference == BandPreference::Band6g && self.ap_security != ApSecurity::Wpa3Sae
        {
            errors.push(FieldError::new("ap_security", "wpa3_sae_required_for_6ghz"));
        }

        if !self.country.is_empty() {
            let valid = self.country.len() == 2
                && self.country.chars().all(|c| c.is_ascii_uppercase())
                && self.country != "00";
            if !valid {
                errors.push(FieldError::new("country", "country_two_uppercase_letters"));
            }
        }

        if !same_slash24(self.dhcp_start_ip, self.lan_gateway_ip)
            || !same_slash24(self.dhcp_end_ip, self.lan_gateway_ip)
        {
            errors.push(FieldError::new("dhcp_start_ip", "dhcp_range_outside_gateway_slash24"));
        }
        if self.dhcp_start_ip == self.lan_gateway_ip || self.dhcp_end_ip == self.lan_gateway_ip {
            errors.push(FieldError::new("dhcp_start_ip", "dhcp_range_contains_gateway"));
        }
        if u32::from(self.dhcp_start_ip) > u32::from(self.dhcp_end_ip) {
            errors.push(FieldError::new("dhcp_start_ip", "dhcp_range_inverted"));
        }

        if self.telemetry_interval_s < 0.5 {
            errors.push(FieldError::new("telemetry_interval_s", "interval_min_0_5_s"));
        }
        if self.watchdog_interval_s < 0.5 {
            errors.push(FieldError::new("watchdog_interval_s", "interval_min_0_5_s"));
        }

        if self.bridge_mode && self.bridge_uplink_ifname.as_deref().unwrap_or("").is_empty() {
            errors.push(FieldError::new("bridge_uplink_ifname", "bridge_uplink_required"));
        }

        errors
    }

    /// Readiness timeout clamped to the allowed window.
    pub fn ap_ready_timeout_clamped(&self) -> f64 {
        self.ap_ready_timeout_s.clamp(1.0, 30.0)
    }

    /// Channel for the 2.4 GHz band, clamped into the valid range.
    pub fn channel_2g_clamped(&self) -> u8 {
        self.channel_2g_fallback.clamp(1, 14)
    }

    /// Country code if it is a usable two-letter code (not empty, not "00").
    pub fn country_code(&self) -> Option<&str> {
        let cc = self.country.as_str();
        if cc.len() == 2 && cc.chars().all(|c| c.is_ascii_uppercase()) && cc != "00" {
            Some(cc)
        } else {
            None
        }
    }
}

/// Redacted configuration view returned to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigView {
    #[serde(flatten)]
    pub config: Config,
    pub wpa2_passphrase_set: bool,
    pub wpa2_passphrase_len: usize,
}

impl ConfigView {
    pub fn new(config: Config, passphrase: Option<&str>) -> Self {
        Self {
            config,
            wpa2_passphrase_set: passphrase.is_some(),
            wpa2_passphrase_len: passphrase.map(|p| p.len()).unwrap_or(0),
        }
    }
}

/// Passphrase constraints shared by the store and validation.
pub fn validate_passphrase(passphrase: &str) -> Option<FieldError> {
    let len = passphrase.len();
    if !(8..=63).contains(&len) {
        return Some(FieldError::new("wpa2_passphrase", "passphrase_invalid_length"));
    }
    if !passphrase.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Some(FieldError::new("wpa2_passphrase", "passphrase_not_printable"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
    }

    #[test]
    fn test_ssid_bounds() {
        let mut cfg = Config::default();
        cfg.ssid = String::new();
        assert!(cfg.validate().iter().any(|e| e.code == "ssid_length_1_32"));

        cfg.ssid = "x".repeat(33);
        assert!(cfg.validate().iter().any(|e| e.code == "ssid_length_1_32"));

        cfg.ssid = "VR\u{7}Net".to_string();
        assert!(cfg.validate().iter().any(|e| e.code == "ssid_control_chars"));
    }

    #[test]
    fn test_6ghz_forces_sae() {
        let mut cfg = Config::default();
        cfg.band_preference = BandPreference::Band6g;
        cfg.ap_security = ApSecurity::Wpa2;
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.code == "wpa3_sae_required_for_6ghz"));

        cfg.ap_security = ApSecurity::Wpa3Sae;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_dhcp_range_must_match_gateway_subnet() {
        let mut cfg = Config::default();
        cfg.dhcp_start_ip = Ipv4Addr::new(10, 0, 0, 10);
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.code == "dhcp_range_outside_gateway_slash24"));
    }

    #[test]
    fn test_dhcp_range_excludes_gateway() {
        let mut cfg = Config::default();
        cfg.dhcp_start_ip = cfg.lan_gateway_ip;
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.code == "dhcp_range_contains_gateway"));
    }

    #[test]
    fn test_country_shape() {
        let mut cfg = Config::default();
        cfg.country = "usa".to_string();
        assert!(!cfg.validate().is_empty());
        cfg.country = "00".to_string();
        assert!(!cfg.validate().is_empty());
        cfg.country = "DE".to_string();
        assert!(cfg.validate().is_empty());
        cfg.country = String::new();
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_timeout_clamp() {
        let mut cfg = Config::default();
        cfg.ap_ready_timeout_s = 0.1;
        assert_eq!(cfg.ap_ready_timeout_clamped(), 1.0);
        cfg.ap_ready_timeout_s = 99.0;
        assert_eq!(cfg.ap_ready_timeout_clamped(), 30.0);
    }

    #[test]
    fn test_band_serde_wire_form() {
        let json = serde_json::to_string(&BandPreference::Band2g).unwrap();
        assert_eq!(json, "\"2.4ghz\"");
        let back: BandPreference = serde_json::from_str("\"5ghz\"").unwrap();
        assert_eq!(back, BandPreference::Band5g);
    }

    #[test]
    fn test_passphrase_rules() {
        assert!(validate_passphrase("short").is_some());
        assert!(validate_passphrase(&"x".repeat(64)).is_some());
        assert!(validate_passphrase("correcthorse").is_none());
        assert!(validate_passphrase("tab\there").is_some());
    }

    #[test]
    fn test_dhcp_dns_offer() {
        let gw = Ipv4Addr::new(192, 168, 68, 1);
        assert_eq!(
            DhcpDns::default().offer(gw).as_deref(),
            Some("192.168.68.1")
        );
        let servers = DhcpDns::Servers(vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]);
        assert_eq!(servers.offer(gw).as_deref(), Some("1.1.1.1,8.8.8.8"));
        assert_eq!(DhcpDns::Keyword("no".into()).offer(gw), None);
    }

    #[test]
    fn test_partial_record_takes_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"ssid":"VR-NET"}"#).unwrap();
        assert_eq!(cfg.ssid, "VR-NET");
        assert_eq!(cfg.band_preference, BandPreference::Band5g);
        assert_eq!(cfg.firewall_zone, "trusted");
    }
}
