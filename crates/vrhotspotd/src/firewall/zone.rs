//! Zone-based firewall backend.
//!
//! When a zone manager owns the packet filter, the reconciler must speak to
//! it rather than edit rules underneath it: move the AP interface into the
//! configured zone and enable masquerade + forward there, remembering the
//! prior zone for revert.

use super::{FirewallBackend, Profile, RevertToken};
use crate::platform::{run_cmd, which};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use vrhotspot_shared::error::{ErrorKind, LifecycleError};

const FIREWALL_CMD_TIMEOUT: Duration = Duration::from_secs(3);

fn firewall_cmd() -> Option<PathBuf> {
    which("firewall-cmd")
}

async fn fw(args: &[&str]) -> (bool, String) {
    let Some(cmd) = firewall_cmd() else {
        return (false, "firewall-cmd not found".to_string());
    };
    let out = run_cmd(&cmd, args, FIREWALL_CMD_TIMEOUT).await;
    // The manager answers ALREADY_ENABLED / NOT_ENABLED with rc != 0 in some
    // versions; both mean the requested state already holds.
    let benign = out.combined().contains("ALREADY_ENABLED");
    (out.ok() || benign, out.combined())
}

/// State needed to undo one zone-backend apply.
#[derive(Debug, Clone, Default)]
pub struct ZoneRevert {
    pub zone: String,
    pub ap_ifname: String,
    pub added_interface: bool,
    pub added_masquerade: bool,
    pub added_forward: bool,
    pub prior_zone: Option<String>,
}

impl ZoneRevert {
    pub async fn revert(self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.added_interface {
            let (ok, out) = fw(&["--zone", &self.zone, "--remove-interface", &self.ap_ifname]).await;
            if !ok {
                warnings.push(format!("firewall_zone_remove_interface_failed:{}", trunc(&out)));
            }
            if let Some(prior) = &self.prior_zone {
                let (ok, out) = fw(&["--zone", prior, "--add-interface", &self.ap_ifname]).await;
                if !ok {
                    warnings.push(format!("firewall_zone_restore_failed:{}", trunc(&out)));
                }
            }
        }
        if self.added_masquerade {
            let (ok, out) = fw(&["--zone", &self.zone, "--remove-masquerade"]).await;
            if !ok {
                warnings.push(format!("firewall_zone_remove_masquerade_failed:{}", trunc(&out)));
            }
        }
        if self.added_forward {
            let (ok, out) = fw(&["--zone", &self.zone, "--remove-forward"]).await;
            if !ok {
                warnings.push(format!("firewall_zone_remove_forward_failed:{}", trunc(&out)));
            }
        }
        warnings
    }
}

fn trunc(s: &str) -> String {
    s.chars().take(120).collect()
}

/// The zone-manager reconciler backend.
pub struct ZoneBackend;

impl ZoneBackend {
    async fn zone_of_interface(&self, ifname: &str) -> Option<String> {
        let (ok, out) = fw(&["--get-zone-of-interface", ifname]).await;
        let zone = out.trim().to_string();
        (ok && !zone.is_empty() && !zone.contains("no zone")).then_some(zone)
    }
}

impl FirewallBackend for ZoneBackend {
    fn name(&self) -> &'static str {
        "zone"
    }

    async fn apply(&self, profile: &Profile) -> Result<RevertToken, LifecycleError> {
        let zone = profile.zone.clone().unwrap_or_else(|| "trusted".to_string());
        let mut state = ZoneRevert {
            zone: zone.clone(),
            ap_ifname: profile.ap_ifname.clone(),
            ..Default::default()
        };

        state.prior_zone = self.zone_of_interface(&profile.ap_ifname).await;
        if state.prior_zone.as_deref() == Some(zone.as_str()) {
            // Re-applying an equivalent profile is a no-op for membership.
            info!(
                "interface {} already in zone {}",
                profile.ap_ifname, zone
            );
            state.prior_zone = None;
        } else {
            let (ok, out) = fw(&["--zone", &zone, "--add-interface", &profile.ap_ifname]).await;
            if !ok {
                return Err(LifecycleError::new(ErrorKind::FirewallApplyFailed)
                    .with_detail(format!("zone_add_interface:{}", trunc(&out))));
            }
            state.added_interface = true;
        }

        if profile.masquerade {
            let (ok, out) = fw(&["--zone", &zone, "--query-masquerade"]).await;
            if !(ok && out.trim() == "yes") {
                let (ok, out) = fw(&["--zone", &zone, "--add-masquerade"]).await;
                if ok {
                    state.added_masquerade = true;
                } else {
                    warn!("zone masquerade failed: {}", trunc(&out));
                }
            }
        }

        if profile.forward {
            // Not every manager version exposes zone forward; best-effort.
            let (ok, out) = fw(&["--zone", &zone, "--add-forward"]).await;
            if ok {
                state.added_forward = true;
            } else {
                warn!("zone forward unsupported or failed: {}", trunc(&out));
            }
        }

        Ok(RevertToken::Zone(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_state_defaults_to_nothing_added() {
        let state = ZoneRevert::default();
        assert!(!state.added_interface);
        assert!(!state.added_masquerade);
        assert!(!state.added_forward);
        assert!(state.prior_zone.is_none());
    }

    #[tokio::test]
    async fn test_revert_without_additions_emits_no_warnings() {
        // Nothing was added, so nothing is attempted and nothing can fail,
        // even on a host without the zone manager installed.
        let warnings = ZoneRevert::default().revert().await;
        assert!(warnings.is_empty());
    }
}
