//! `PlatformFacts`: one probe pass per lifecycle call.
//!
//! Decisions downstream (firewall backend, engine backend, vendor profile,
//! timeout adjustments) consume this value instead of re-probing.

use super::firewall_probe::{self, FirewallProbe};
use super::os_release::{self, OsFlavor};
use super::{run_cmd, which, PROBE_TIMEOUT};
use vrhotspot_shared::config::Config;
use vrhotspot_shared::status::PlatformStatus;

#[derive(Debug, Clone, Default)]
pub struct PlatformFacts {
    pub flavor: OsFlavor,
    pub firewall: FirewallProbe,
    pub network_manager_running: bool,
}

impl PlatformFacts {
    /// Gather everything once. Bounded: each sub-probe has its own deadline.
    pub async fn gather() -> Self {
        let info = os_release::read();
        let flavor = os_release::detect_flavor(&info);
        let firewall = firewall_probe::detect().await;
        let network_manager_running = nm_running().await;
        Self {
            flavor,
            firewall,
            network_manager_running,
        }
    }

    /// Per-flavor effective-config adjustments. Returns the warnings each
    /// override emits so the caller can surface them.
    pub fn apply_overrides(&self, cfg: &mut Config) -> Vec<String> {
        let mut warnings = Vec::new();

        // Some adapters report AP-ready slowly on first start here; a default
        // timeout produces false negatives.
        if self.flavor == OsFlavor::CachyOs && cfg.ap_ready_timeout_s <= 6.0 {
            cfg.ap_ready_timeout_s = 12.0;
            warnings.push("platform_cachyos_increased_ap_ready_timeout".to_string());
        }

        if self.flavor == OsFlavor::Bazzite && cfg.optimized_no_virt {
            warnings.push("platform_bazzite_no_virt_may_fail".to_string());
        }

        warnings
    }

    /// Bazzite runs the direct NAT backend even below 6 GHz.
    pub fn prefer_direct_backend(&self) -> bool {
        self.flavor == OsFlavor::Bazzite
    }

    pub fn to_status(&self) -> PlatformStatus {
        PlatformStatus {
            flavor: self.flavor.as_str().to_string(),
            family: self.flavor.family().map(str::to_string),
            zone_firewall_active: self.firewall.zone_manager_active(),
            firewall_backend: self.firewall.selected_backend.clone(),
            network_manager_running: self.network_manager_running,
        }
    }
}

async fn nm_running() -> bool {
    let Some(nmcli) = which("nmcli") else {
        return false;
    };
    let out = run_cmd(&nmcli, &["-t", "-f", "RUNNING", "g"], PROBE_TIMEOUT).await;
    out.ok() && out.stdout.trim() == "running"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cachyos_raises_default_timeout() {
        let facts = PlatformFacts {
            flavor: OsFlavor::CachyOs,
            ..Default::default()
        };
        let mut cfg = Config::default();
        let warnings = facts.apply_overrides(&mut cfg);
        assert_eq!(cfg.ap_ready_timeout_s, 12.0);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_cachyos_keeps_raised_timeout() {
        let facts = PlatformFacts {
            flavor: OsFlavor::CachyOs,
            ..Default::default()
        };
        let mut cfg = Config::default();
        cfg.ap_ready_timeout_s = 20.0;
        let warnings = facts.apply_overrides(&mut cfg);
        assert_eq!(cfg.ap_ready_timeout_s, 20.0);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bazzite_prefers_direct_backend() {
        let facts = PlatformFacts {
            flavor: OsFlavor::Bazzite,
            ..Default::default()
        };
        assert!(facts.prefer_direct_backend());
        let facts = PlatformFacts::default();
        assert!(!facts.prefer_direct_backend());
    }
}
