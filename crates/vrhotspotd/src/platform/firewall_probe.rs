//! Detection of the host's packet-filter ownership.
//!
//! The reconciler picks its backend from this probe at the moment of Start;
//! nothing here mutates firewall state.

use super::{run_cmd, which};
use std::time::Duration;

/// Which tool owns (or can own) the packet filter right now.
#[derive(Debug, Clone, Default)]
pub struct FirewallProbe {
    pub firewalld_available: bool,
    pub firewalld_active: bool,
    pub ufw_available: bool,
    pub ufw_active: bool,
    pub nft_available: bool,
    pub iptables_available: bool,
    pub iptables_variant: Option<String>,
    /// "firewalld" | "ufw" | "nftables" | "iptables" | "unknown"
    pub selected_backend: String,
    pub rationale: String,
}

impl FirewallProbe {
    /// True when a zone-based manager owns packet-filter state.
    pub fn zone_manager_active(&self) -> bool {
        self.firewalld_active
    }
}

pub async fn firewalld_active() -> bool {
    let Some(cmd) = which("firewall-cmd") else {
        return false;
    };
    let out = run_cmd(&cmd, &["--state"], Duration::from_secs(1)).await;
    out.ok() && out.stdout.trim() == "running"
}

async fn ufw_active() -> bool {
    let Some(cmd) = which("ufw") else {
        return false;
    };
    let out = run_cmd(&cmd, &["status"], Duration::from_millis(1500)).await;
    if !out.ok() {
        return false;
    }
    out.stdout
        .lines()
        .any(|l| l.contains("Status:") && l.to_ascii_lowercase().contains("active"))
}

async fn iptables_variant() -> Option<String> {
    let ipt = which("iptables")?;
    let out = run_cmd(&ipt, &["--version"], Duration::from_secs(1)).await;
    if !out.ok() {
        return Some("iptables-unknown".to_string());
    }
    let low = out.stdout.to_ascii_lowercase();
    if low.contains("nf_tables") || low.contains("nft") {
        Some("iptables-nft".to_string())
    } else if low.contains("legacy") {
        Some("iptables-legacy".to_string())
    } else {
        Some("iptables-unknown".to_string())
    }
}

/// Probe every known backend and pick the one that owns the host.
pub async fn detect() -> FirewallProbe {
    let firewalld_act = firewalld_active().await;
    let ufw_act = ufw_active().await;
    let nft_present = which("nft").is_some();
    let ipt_variant = iptables_variant().await;

    let (selected, rationale) = if firewalld_act {
        ("firewalld", "firewalld_running")
    } else if ufw_act {
        ("ufw", "ufw_active")
    } else if nft_present {
        ("nftables", "nft_present")
    } else if ipt_variant.is_some() {
        ("iptables", "iptables_present")
    } else {
        ("unknown", "no_firewall_detected")
    };

    FirewallProbe {
        firewalld_available: which("firewall-cmd").is_some(),
        firewalld_active: firewalld_act,
        ufw_available: which("ufw").is_some(),
        ufw_active: ufw_act,
        nft_available: nft_present,
        iptables_available: ipt_variant.is_some(),
        iptables_variant: ipt_variant,
        selected_backend: selected.to_string(),
        rationale: rationale.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_manager_follows_firewalld() {
        let mut probe = FirewallProbe::default();
        assert!(!probe.zone_manager_active());
        probe.firewalld_active = true;
        assert!(probe.zone_manager_active());
    }
}
