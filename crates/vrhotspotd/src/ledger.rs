//! The revert ledger: a LIFO stack of reversible host-state mutations
//! captured while a start attempt progresses.
//!
//! Stop, repair, and the gap between fallback attempts drain the ledger in
//! strict reverse order. Every step is best-effort; failures become
//! warnings, never aborts.

use crate::firewall::RevertToken;
use crate::nat_accel::NatState;
use crate::platform::{iw, net};
use crate::qos::QosState;
use std::path::PathBuf;
use tracing::debug;

/// One reversible mutation.
#[derive(Debug)]
pub enum RevertAction {
    /// Restore a sysfs/procfs file to its prior content.
    SysWrite { path: PathBuf, previous: String },
    /// Restore Wi-Fi power save on a radio.
    PowerSave { ifname: String, previous_on: bool },
    /// Restore an IRQ's CPU affinity mask.
    IrqAffinity { irq: u32, previous_mask: String },
    /// Undo firewall state via its token.
    Firewall(RevertToken),
    /// Tear down the QoS qdisc and DSCP rule.
    Qos(QosState),
    /// Delete the NAT acceleration flowtable.
    NatAccel(NatState),
    /// Delete a virtual interface this attempt created.
    RemoveIface(String),
    /// Detach an interface from a bridge.
    BridgeDetach { ifname: String },
    /// Remove a bridge this attempt created.
    RemoveBridge(String),
    /// Flush addresses this attempt assigned.
    FlushAddr(String),
    /// Restore a fixed transmit power (dBm).
    TxPower { ifname: String, previous_dbm: Option<i32> },
}

/// Stack of reversible actions owned by the lifecycle worker.
#[derive(Debug, Default)]
pub struct RevertLedger {
    stack: Vec<RevertAction>,
}

impl RevertLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: RevertAction) {
        self.stack.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Pop and execute every action in reverse order. Returns the warnings
    /// accumulated along the way.
    pub async fn drain(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        while let Some(action) = self.stack.pop() {
            debug!("revert: {:?}", action);
            match action {
                RevertAction::SysWrite { path, previous } => {
                    if path.exists() {
                        if let Err(e) = std::fs::write(&path, format!("{previous}\n")) {
                            warnings.push(format!(
                                "revert_sys_write_failed:{}:{}",
                                path.display(),
                                e
                            ));
                        }
                    }
                }
                RevertAction::PowerSave { ifname, previous_on } => {
                    let out = iw::set_power_save(&ifname, previous_on).await;
                    if !out.ok() {
                        warnings.push(format!("revert_power_save_failed:{ifname}"));
                    }
                }
                RevertAction::IrqAffinity { irq, previous_mask } => {
                    let path = PathBuf::from(format!("/proc/irq/{irq}/smp_affinity"));
                    if path.exists() {
                        if let Err(e) = std::fs::write(&path, &previous_mask) {
                            warnings.push(format!("revert_irq_affinity_failed:{irq}:{e}"));
                        }
                    }
                }
                RevertAction::Firewall(token) => {
                    warnings.extend(token.revert().await);
                }
                RevertAction::Qos(state) => {
                    warnings.extend(state.revert().await);
                }
                RevertAction::NatAccel(state) => {
                    warnings.extend(state.revert().await);
                }
                RevertAction::RemoveIface(ifname) => {
                    let out = iw::dev_del(&ifname).await;
                    if !out.ok() && net::iface_exists(&ifname) {
                        warnings.push(format!("revert_remove_iface_failed:{ifname}"));
                    }
                }
                RevertAction::BridgeDetach { ifname } => {
                    let out = net::bridge_detach(&ifname).await;
                    if !out.ok() && net::iface_exists(&ifname) {
                        warnings.push(format!("revert_bridge_detach_failed:{ifname}"));
                    }
                }
                RevertAction::RemoveBridge(name) => {
                    let out = net::delete_link(&name).await;
                    if !out.ok() && net::iface_exists(&name) {
                        warnings.push(format!("revert_remove_bridge_failed:{name}"));
                    }
                }
                RevertAction::FlushAddr(ifname) => {
                    if net::iface_exists(&ifname) {
                        let out = net::flush_ipv4(&ifname).await;
                        if !out.ok() {
                            warnings.push(format!("revert_flush_addr_failed:{ifname}"));
                        }
                    }
                }
                RevertAction::TxPower { ifname, previous_dbm } => {
                    let out = match previous_dbm {
                        Some(dbm) => net::set_txpower(&ifname, dbm).await,
                        None => {
                            crate::platform::run_cmd(
                                &crate::platform::iw_bin(),
                                &["dev", &ifname, "set", "txpower", "auto"],
                                crate::platform::PROBE_TIMEOUT,
                            )
                            .await
                        }
                    };
                    if !out.ok() && net::iface_exists(&ifname) {
                        warnings.push(format!("revert_txpower_failed:{ifname}"));
                    }
                }
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_drain_restores_sys_writes_lifo() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("knob");
        std::fs::write(&path, "original\n").unwrap();

        let mut ledger = RevertLedger::new();
        // Two writes to the same knob: LIFO drain must end on the first
        // recorded prior value.
        std::fs::write(&path, "tuned1\n").unwrap();
        ledger.push(RevertAction::SysWrite {
            path: path.clone(),
            previous: "original".into(),
        });
        std::fs::write(&path, "tuned2\n").unwrap();
        ledger.push(RevertAction::SysWrite {
            path: path.clone(),
            previous: "tuned1".into(),
        });

        let warnings = ledger.drain().await;
        assert!(warnings.is_empty());
        assert!(ledger.is_empty());
        let value = std::fs::read_to_string(&path).unwrap();
        assert_eq!(value.trim(), "original");
    }

    #[tokio::test]
    async fn test_drain_skips_missing_paths_silently() {
        let mut ledger = RevertLedger::new();
        ledger.push(RevertAction::SysWrite {
            path: PathBuf::from("/nonexistent/vr-test/knob"),
            previous: "x".into(),
        });
        let warnings = ledger.drain().await;
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empties_ledger_even_with_failures() {
        let mut ledger = RevertLedger::new();
        ledger.push(RevertAction::Firewall(RevertToken::None));
        ledger.push(RevertAction::RemoveIface("vrhs-gone0".into()));
        let _ = ledger.drain().await;
        assert!(ledger.is_empty());
    }
}
