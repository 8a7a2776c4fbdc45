//! NAT acceleration: an nftables flowtable that offloads established
//! forwards between the AP and the uplink.
//!
//! Skipped in bridge mode, when internet sharing is off, and whenever a
//! zone-based manager owns the packet filter.

use crate::platform::{run_cmd, which};
use std::time::Duration;
use tracing::debug;

const TABLE_NAME: &str = "vrhotspot";
const NFT_TIMEOUT: Duration = Duration::from_secs(3);

/// Installed flowtable state; knows how to undo itself.
#[derive(Debug, Clone)]
pub struct NatState {
    pub table: String,
}

impl NatState {
    pub async fn revert(self) -> Vec<String> {
        let mut warnings = Vec::new();
        let Some(nft) = which("nft") else {
            return warnings;
        };
        let out = run_cmd(
            &nft,
            &["delete", "table", "inet", &self.table],
            NFT_TIMEOUT,
        )
        .await;
        if !out.ok() && !out.combined().contains("No such file or directory") {
            warnings.push(format!(
                "nat_accel_delete_failed:{}",
                out.combined().chars().take(120).collect::<String>()
            ));
        }
        warnings
    }
}

/// Install the flowtable. Returns the state to revert, or None with the
/// reason in warnings.
pub async fn apply(
    enabled: bool,
    bridge_mode: bool,
    enable_internet: bool,
    zone_manager_active: bool,
    ap_ifname: &str,
    uplink_ifname: Option<&str>,
) -> (Option<NatState>, Vec<String>) {
    let mut warnings = Vec::new();
    if !enabled {
        return (None, warnings);
    }
    if bridge_mode {
        warnings.push("nat_accel_skipped_bridge_mode".to_string());
        return (None, warnings);
    }
    if !enable_internet {
        warnings.push("nat_accel_skipped_no_internet".to_string());
        return (None, warnings);
    }
    if zone_manager_active {
        warnings.push("nat_accel_skipped_zone_manager_active".to_string());
        return (None, warnings);
    }
    let Some(uplink) = uplink_ifname.filter(|u| !u.is_empty()) else {
        warnings.push("nat_accel_missing_interface".to_string());
        return (None, warnings);
    };
    if ap_ifname.is_empty() {
        warnings.push("nat_accel_missing_interface".to_string());
        return (None, warnings);
    }
    let Some(nft) = which("nft") else {
        warnings.push("nft_not_found".to_string());
        return (None, warnings);
    };

    // Stale table from a crashed run would shadow the new one.
    let _ = run_cmd(&nft, &["delete", "table", "inet", TABLE_NAME], NFT_TIMEOUT).await;

    let flowtable = format!(
        "{{ hook ingress priority 0 ; devices = {{ {ap_ifname}, {uplink} }} ; }}"
    );
    let chain = "{ type filter hook forward priority 10 ; policy accept ; }";
    let steps: Vec<Vec<String>> = vec![
        vec!["add".into(), "table".into(), "inet".into(), TABLE_NAME.into()],
        vec![
            "add".into(),
            "flowtable".into(),
            "inet".into(),
            TABLE_NAME.into(),
            "ft".into(),
            flowtable,
        ],
        vec![
            "add".into(),
            "chain".into(),
            "inet".into(),
            TABLE_NAME.into(),
            "forward".into(),
            chain.into(),
        ],
        vec![
            "add".into(),
            "rule".into(),
            "inet".into(),
            TABLE_NAME.into(),
            "forward".into(),
            "ct".into(),
            "state".into(),
            "established,related".into(),
            "flow".into(),
            "add".into(),
            "@ft".into(),
        ],
    ];

    for step in steps {
        let refs: Vec<&str> = step.iter().map(String::as_str).collect();
        let out = run_cmd(&nft, &refs, NFT_TIMEOUT).await;
        if !out.ok() {
            warnings.push(format!(
                "nft_cmd_failed:{}",
                out.combined().chars().take(120).collect::<String>()
            ));
            let _ = run_cmd(&nft, &["delete", "table", "inet", TABLE_NAME], NFT_TIMEOUT).await;
            debug!("nat accel rollback after failed step");
            return (None, warnings);
        }
    }

    (
        Some(NatState {
            table: TABLE_NAME.to_string(),
        }),
        warnings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_is_silent_noop() {
        let (state, warnings) = apply(false, false, true, false, "x0wlan1", Some("eth0")).await;
        assert!(state.is_none());
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_bridge_mode_skips() {
        let (state, warnings) = apply(true, true, true, false, "x0wlan1", Some("eth0")).await;
        assert!(state.is_none());
        assert_eq!(warnings, vec!["nat_accel_skipped_bridge_mode".to_string()]);
    }

    #[tokio::test]
    async fn test_zone_manager_skips() {
        let (state, warnings) = apply(true, false, true, true, "x0wlan1", Some("eth0")).await;
        assert!(state.is_none());
        assert_eq!(
            warnings,
            vec!["nat_accel_skipped_zone_manager_active".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_uplink_skips() {
        let (state, warnings) = apply(true, false, true, false, "x0wlan1", None).await;
        assert!(state.is_none());
        assert_eq!(warnings, vec!["nat_accel_missing_interface".to_string()]);
    }
}
