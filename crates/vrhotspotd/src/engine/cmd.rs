//! Effective plan and per-backend engine command builders.
//!
//! A plan is the post-resolution parameter set for exactly one attempt. The
//! builders turn it into an [`EngineSpec`]: the argv to supervise, the env,
//! the expected AP interface, and (for the direct backends) the generated
//! configuration files.

use super::vendor;
use super::BackendKind;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use vrhotspot_shared::config::{ApSecurity, ChannelWidth};
use vrhotspot_shared::error::{ErrorKind, LifecycleError};

/// Concrete band of one attempt (`recommended` is resolved before this).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    G24,
    G5,
    G6,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::G24 => "2.4ghz",
            Band::G5 => "5ghz",
            Band::G6 => "6ghz",
        }
    }

    pub fn hw_mode(&self) -> &'static str {
        match self {
            Band::G24 => "g",
            Band::G5 | Band::G6 => "a",
        }
    }
}

/// Virtual AP child naming: `x0<parent>`, capped at the kernel's 15-char
/// interface name limit.
pub struct VirtualApName;

impl VirtualApName {
    pub fn derive(parent: &str) -> String {
        let cand = format!("x0{parent}");
        cand.chars().take(15).collect()
    }
}

/// The post-resolution parameter set handed to a backend for one attempt.
#[derive(Debug, Clone)]
pub struct EffectivePlan {
    pub backend: BackendKind,
    pub band: Band,
    pub ssid: String,
    pub passphrase: String,
    pub security: ApSecurity,
    pub country: Option<String>,
    pub channel: Option<u16>,
    pub width: ChannelWidth,
    pub beacon_interval_ms: u32,
    pub dtim_period: u8,
    pub short_guard_interval: bool,
    pub tx_power_dbm: Option<i32>,
    pub wifi6: bool,

    pub adapter_ifname: String,
    pub no_virt: bool,

    pub gateway_ip: Ipv4Addr,
    pub dhcp_start_ip: Ipv4Addr,
    pub dhcp_end_ip: Ipv4Addr,
    /// Resolved DNS offer ("192.168.68.1" or "1.1.1.1,8.8.8.8"), None = omit.
    pub dns_offer: Option<String>,
    pub enable_internet: bool,

    pub bridge_name: Option<String>,
    pub bridge_uplink: Option<String>,

    /// hostapd control-socket directory for the direct backends.
    pub ctrl_dir: PathBuf,
}

impl EffectivePlan {
    /// The interface the AP is expected to appear on, when predictable.
    pub fn expected_ap_ifname(&self) -> Option<String> {
        if self.no_virt {
            return Some(self.adapter_ifname.clone());
        }
        match self.backend {
            // The orchestrator auto-picks names; only long parents force a
            // deterministic virtual name through it.
            BackendKind::Orchestrator => (self.adapter_ifname.len() > 13)
                .then(|| VirtualApName::derive(&self.adapter_ifname)),
            BackendKind::Direct | BackendKind::Bridge => {
                Some(VirtualApName::derive(&self.adapter_ifname))
            }
        }
    }
}

/// One spawnable engine invocation.
#[derive(Debug, Clone)]
pub struct EngineSpec {
    pub backend: BackendKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Second supervised process (DHCP/DNS) for the direct backend.
    pub secondary: Option<(PathBuf, Vec<String>)>,
    pub env: HashMap<String, String>,
    pub expected_ap_ifname: Option<String>,
    /// Pre-generated runtime config dir, when this backend writes one.
    pub config_dir: Option<PathBuf>,
    /// Argv positions whose values are secrets.
    pub redact_positions: Vec<usize>,
}

impl EngineSpec {
    /// The argv copy held in `Status`: secrets replaced by a placeholder.
    pub fn redacted_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.to_string_lossy().to_string());
        for (i, arg) in self.args.iter().enumerate() {
            if self.redact_positions.contains(&i) {
                argv.push("********".to_string());
            } else {
                argv.push(arg.clone());
            }
        }
        argv
    }
}

fn resolve_required(name: &str) -> Result<PathBuf, LifecycleError> {
    vendor::resolve(name)
        .map(|(path, _)| path)
        .ok_or_else(|| LifecycleError::new(ErrorKind::MissingBinary).with_detail(name))
}

/// Orchestrator backend: one external program that spawns the AP daemon and
/// the DHCP/DNS server itself.
pub fn build_orchestrator(plan: &EffectivePlan) -> Result<EngineSpec, LifecycleError> {
    let program = resolve_required("lnxrouter")?;
    let env = vendor::build_engine_env(&["hostapd", "dnsmasq"]);
    if !env.missing.is_empty() {
        return Err(LifecycleError::new(ErrorKind::DependencyMissing)
            .with_detail(env.missing.join(",")));
    }

    let mut args: Vec<String> = vec![
        "--ap".into(),
        plan.adapter_ifname.clone(),
        plan.ssid.clone(),
        "-p".into(),
    ];
    let passphrase_pos = args.len();
    args.push(plan.passphrase.clone());

    match plan.band {
        Band::G5 => args.extend(["--freq-band".into(), "5".into()]),
        Band::G24 => args.extend(["--freq-band".into(), "2.4".into()]),
        Band::G6 => {
            return Err(LifecycleError::internal(
                "orchestrator backend cannot serve 6ghz",
            ))
        }
    }

    if plan.wifi6 {
        args.push("--wifi6".into());
    }

    if plan.band == Band::G5 {
        if let Some(width) = plan.width.mhz() {
            if width >= 40 {
                args.push("--wifi4".into());
            }
            if width >= 80 {
                args.push("--wifi5".into());
                args.extend(["--vht-ch-width".into(), "1".into()]);
                if let Some(center) = plan.channel.and_then(center_channel_80) {
                    args.extend(["--vht-seg0-ch".into(), center.to_string()]);
                }
            }
        }
    }

    if let Some(channel) = plan.channel {
        args.extend(["-c".into(), channel.to_string()]);
    }
    if plan.no_virt {
        args.push("--no-virt".into());
    }
    if let Some(country) = &plan.country {
        args.extend(["--country".into(), country.clone()]);
    }
    args.extend(["-g".into(), plan.gateway_ip.to_string()]);
    if let Some(dns) = &plan.dns_offer {
        args.extend(["--dhcp-dns".into(), dns.clone()]);
    }
    if !plan.enable_internet {
        args.push("-n".into());
    }

    Ok(EngineSpec {
        backend: BackendKind::Orchestrator,
        program,
        args,
        secondary: None,
        env: env.vars,
        expected_ap_ifname: plan.expected_ap_ifname(),
        config_dir: None,
        redact_positions: vec![passphrase_pos],
    })
}

/// 80 MHz block centers for 5 GHz primaries.
pub fn center_channel_80(primary: u16) -> Option<u16> {
    const BLOCKS: [(u16, u16, u16); 6] = [
        (36, 48, 42),
        (52, 64, 58),
        (100, 112, 106),
        (116, 128, 122),
        (132, 144, 138),
        (149, 161, 155),
    ];
    BLOCKS
        .iter()
        .find(|(start, end, _)| (*start..=*end).contains(&primary))
        .map(|(_, _, center)| *center)
}

/// hostapd configuration text for the direct backends.
pub fn hostapd_conf(plan: &EffectivePlan, ap_ifname: &str) -> String {
    let mut lines: Vec<String> = vec![
        format!("interface={ap_ifname}"),
        "driver=nl80211".into(),
        format!("ctrl_interface={}", plan.ctrl_dir.display()),
        "ctrl_interface_group=0".into(),
        format!("ssid={}", plan.ssid),
        format!("hw_mode={}", plan.band.hw_mode()),
    ];

    if let Some(bridge) = plan.bridge_name.as_deref().filter(|_| {
        plan.backend == BackendKind::Bridge
    }) {
        lines.push(format!("bridge={bridge}"));
    }

    let channel = plan.channel.unwrap_or(match plan.band {
        Band::G24 => 6,
        Band::G5 => 36,
        Band::G6 => 1,
    });
    lines.push(format!("channel={channel}"));

    lines.push(format!("beacon_int={}", plan.beacon_interval_ms));
    lines.push(format!("dtim_period={}", plan.dtim_period));
    lines.push("wmm_enabled=1".into());

    match plan.band {
        Band::G6 => {
            lines.push("op_class=131".into());
            lines.push("ieee80211ax=1".into());
            lines.push("he_oper_chwidth=0".into());
            lines.push(format!("he_oper_centr_freq_seg0_idx={channel}"));
        }
        Band::G5 => {
            lines.push("ieee80211n=1".into());
            if plan.short_guard_interval {
                lines.push("ht_capab=[SHORT-GI-20][SHORT-GI-40]".into());
            }
            if plan.width.mhz().unwrap_or(80) >= 80 {
                lines.push("ieee80211ac=1".into());
                lines.push("vht_oper_chwidth=1".into());
                if let Some(center) = center_channel_80(channel) {
                    lines.push(format!("vht_oper_centr_freq_seg0_idx={center}"));
                }
                if plan.wifi6 {
                    lines.push("ieee80211ax=1".into());
                    lines.push("he_oper_chwidth=1".into());
                    if let Some(center) = center_channel_80(channel) {
                        lines.push(format!("he_oper_centr_freq_seg0_idx={center}"));
                    }
                }
            } else if plan.wifi6 {
                lines.push("ieee80211ax=1".into());
            }
        }
        Band::G24 => {
            lines.push("ieee80211n=1".into());
            if plan.short_guard_interval {
                lines.push("ht_capab=[SHORT-GI-20]".into());
            }
        }
    }

    match plan.security {
        ApSecurity::Wpa3Sae => {
            lines.push("wpa=2".into());
            lines.push("wpa_key_mgmt=SAE".into());
            lines.push("rsn_pairwise=CCMP".into());
            lines.push("ieee80211w=2".into());
            lines.push("sae_pwe=2".into());
            lines.push(format!("sae_password={}", plan.passphrase));
        }
        ApSecurity::Wpa2 => {
            lines.push("wpa=2".into());
            lines.push("wpa_key_mgmt=WPA-PSK".into());
            lines.push("rsn_pairwise=CCMP".into());
            lines.push(format!("wpa_passphrase={}", plan.passphrase));
        }
    }

    if let Some(cc) = plan.country.as_deref().filter(|c| c.len() == 2 && *c != "00") {
        lines.push(format!("country_code={cc}"));
        lines.push("ieee80211d=1".into());
    }

    lines.join("\n") + "\n"
}

/// dnsmasq configuration text for the direct backend.
pub fn dnsmasq_conf(plan: &EffectivePlan, ap_ifname: &str) -> String {
    let mut lines: Vec<String> = vec![
        "bind-interfaces".into(),
        format!("interface={ap_ifname}"),
        "except-interface=lo".into(),
        "dhcp-authoritative".into(),
        format!(
            "dhcp-range={},{},255.255.255.0,12h",
            plan.dhcp_start_ip, plan.dhcp_end_ip
        ),
        format!("dhcp-option=option:router,{}", plan.gateway_ip),
        "domain-needed".into(),
        "bogus-priv".into(),
        "log-dhcp".into(),
        "log-facility=-".into(),
    ];
    if let Some(dns) = &plan.dns_offer {
        lines.push(format!("dhcp-option=option:dns-server,{dns}"));
    }
    lines.join("\n") + "\n"
}

fn write_conf(dir: &Path, name: &str, content: &str) -> Result<PathBuf, LifecycleError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(dir)
        .map_err(|e| LifecycleError::internal(format!("conf_dir_create_failed: {e}")))?;
    let path = dir.join(name);
    std::fs::write(&path, content)
        .map_err(|e| LifecycleError::internal(format!("conf_write_failed: {e}")))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| LifecycleError::internal(format!("conf_chmod_failed: {e}")))?;
    Ok(path)
}

/// Direct backend: hostapd on a pre-generated config, dnsmasq alongside.
/// NAT is the firewall reconciler's job, not the engine's.
pub fn build_direct(plan: &EffectivePlan, conf_dir: &Path) -> Result<EngineSpec, LifecycleError> {
    let hostapd = resolve_required("hostapd")?;
    let dnsmasq = resolve_required("dnsmasq")?;
    let env = vendor::build_engine_env(&[]);

    let ap_ifname = plan
        .expected_ap_ifname()
        .unwrap_or_else(|| plan.adapter_ifname.clone());

    let hostapd_path = write_conf(conf_dir, "hostapd.conf", &hostapd_conf(plan, &ap_ifname))?;
    let dnsmasq_path = write_conf(conf_dir, "dnsmasq.conf", &dnsmasq_conf(plan, &ap_ifname))?;

    Ok(EngineSpec {
        backend: BackendKind::Direct,
        program: hostapd,
        args: vec![hostapd_path.to_string_lossy().to_string()],
        secondary: Some((
            dnsmasq,
            vec![
                "--no-daemon".to_string(),
                format!("--conf-file={}", dnsmasq_path.to_string_lossy()),
            ],
        )),
        env: env.vars,
        expected_ap_ifname: Some(ap_ifname),
        config_dir: Some(conf_dir.to_path_buf()),
        redact_positions: Vec::new(),
    })
}

/// Bridge backend: hostapd with a `bridge=` stanza, no DHCP/DNS and no NAT.
pub fn build_bridge(plan: &EffectivePlan, conf_dir: &Path) -> Result<EngineSpec, LifecycleError> {
    let hostapd = resolve_required("hostapd")?;
    let env = vendor::build_engine_env(&[]);

    let ap_ifname = plan
        .expected_ap_ifname()
        .unwrap_or_else(|| plan.adapter_ifname.clone());
    let hostapd_path = write_conf(conf_dir, "hostapd.conf", &hostapd_conf(plan, &ap_ifname))?;

    Ok(EngineSpec {
        backend: BackendKind::Bridge,
        program: hostapd,
        args: vec![hostapd_path.to_string_lossy().to_string()],
        secondary: None,
        env: env.vars,
        expected_ap_ifname: Some(ap_ifname),
        config_dir: Some(conf_dir.to_path_buf()),
        redact_positions: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> EffectivePlan {
        EffectivePlan {
            backend: BackendKind::Orchestrator,
            band: Band::G5,
            ssid: "VR-NET".into(),
            passphrase: "correcthorse".into(),
            security: ApSecurity::Wpa2,
            country: Some("US".into()),
            channel: Some(36),
            width: ChannelWidth::Mhz80,
            beacon_interval_ms: 50,
            dtim_period: 1,
            short_guard_interval: true,
            tx_power_dbm: None,
            wifi6: true,
            adapter_ifname: "wlan1".into(),
            no_virt: false,
            gateway_ip: Ipv4Addr::new(192, 168, 68, 1),
            dhcp_start_ip: Ipv4Addr::new(192, 168, 68, 10),
            dhcp_end_ip: Ipv4Addr::new(192, 168, 68, 250),
            dns_offer: Some("192.168.68.1".into()),
            enable_internet: true,
            bridge_name: None,
            bridge_uplink: None,
            ctrl_dir: PathBuf::from("/run/hostapd"),
        }
    }

    #[test]
    fn test_virtual_name_cap() {
        assert_eq!(VirtualApName::derive("wlan1"), "x0wlan1");
        let long = VirtualApName::derive("wlx0123456789abc");
        assert_eq!(long.len(), 15);
        assert!(long.starts_with("x0"));
    }

    #[test]
    fn test_center_channel_blocks() {
        assert_eq!(center_channel_80(36), Some(42));
        assert_eq!(center_channel_80(44), Some(42));
        assert_eq!(center_channel_80(149), Some(155));
        assert_eq!(center_channel_80(13), None);
    }

    #[test]
    fn test_expected_ifname_no_virt() {
        let mut p = plan();
        p.no_virt = true;
        assert_eq!(p.expected_ap_ifname().as_deref(), Some("wlan1"));
    }

    #[test]
    fn test_expected_ifname_direct_virtual() {
        let mut p = plan();
        p.backend = BackendKind::Direct;
        assert_eq!(p.expected_ap_ifname().as_deref(), Some("x0wlan1"));
    }

    #[test]
    fn test_hostapd_conf_wpa2_5ghz_80mhz() {
        let conf = hostapd_conf(&plan(), "x0wlan1");
        assert!(conf.contains("interface=x0wlan1"));
        assert!(conf.contains("hw_mode=a"));
        assert!(conf.contains("channel=36"));
        assert!(conf.contains("ieee80211ac=1"));
        assert!(conf.contains("vht_oper_centr_freq_seg0_idx=42"));
        assert!(conf.contains("wpa_key_mgmt=WPA-PSK"));
        assert!(conf.contains("wpa_passphrase=correcthorse"));
        assert!(conf.contains("country_code=US"));
        assert!(conf.contains("ieee80211d=1"));
    }

    #[test]
    fn test_hostapd_conf_6ghz_sae() {
        let mut p = plan();
        p.band = Band::G6;
        p.security = ApSecurity::Wpa3Sae;
        p.channel = Some(37);
        let conf = hostapd_conf(&p, "x0wlan1");
        assert!(conf.contains("op_class=131"));
        assert!(conf.contains("wpa_key_mgmt=SAE"));
        assert!(conf.contains("ieee80211w=2"));
        assert!(conf.contains("sae_password=correcthorse"));
        assert!(!conf.contains("wpa_passphrase="));
    }

    #[test]
    fn test_hostapd_conf_omits_invalid_country() {
        let mut p = plan();
        p.country = None;
        let conf = hostapd_conf(&p, "wlan1");
        assert!(!conf.contains("country_code="));
        assert!(!conf.contains("ieee80211d=1"));
    }

    #[test]
    fn test_dnsmasq_conf_shape() {
        let conf = dnsmasq_conf(&plan(), "x0wlan1");
        assert!(conf.contains("interface=x0wlan1"));
        assert!(conf.contains("dhcp-range=192.168.68.10,192.168.68.250,255.255.255.0,12h"));
        assert!(conf.contains("dhcp-option=option:router,192.168.68.1"));
        assert!(conf.contains("dhcp-option=option:dns-server,192.168.68.1"));
    }

    #[test]
    fn test_bridge_conf_has_bridge_line() {
        let mut p = plan();
        p.backend = BackendKind::Bridge;
        p.bridge_name = Some("br-vr".into());
        let conf = hostapd_conf(&p, "x0wlan1");
        assert!(conf.contains("bridge=br-vr"));
    }

    #[test]
    fn test_redacted_argv_hides_passphrase() {
        let spec = EngineSpec {
            backend: BackendKind::Orchestrator,
            program: PathBuf::from("/vendor/bin/lnxrouter"),
            args: vec![
                "--ap".into(),
                "wlan1".into(),
                "VR-NET".into(),
                "-p".into(),
                "correcthorse".into(),
            ],
            secondary: None,
            env: HashMap::new(),
            expected_ap_ifname: None,
            config_dir: None,
            redact_positions: vec![4],
        };
        let argv = spec.redacted_argv();
        assert!(argv.contains(&"********".to_string()));
        assert!(!argv.iter().any(|a| a == "correcthorse"));
    }
}
