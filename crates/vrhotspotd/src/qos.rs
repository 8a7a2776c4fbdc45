//! QoS invocation hooks.
//!
//! Presets map to a root qdisc on the AP interface plus a DSCP mangle rule
//! tagged with the daemon's identifier. Queueing policy internals are not
//! this core's business; only the hooks live here.

use crate::platform::{run_cmd, which};
use std::time::Duration;
use tracing::debug;
use vrhotspot_shared::config::QosPreset;

const QOS_RULE_TAG: &str = "vrhotspot-qos";
const TC_TIMEOUT: Duration = Duration::from_secs(3);

/// What one preset installs.
#[derive(Debug, Clone, Copy)]
struct PresetSpec {
    dscp: Option<&'static str>,
    qdisc: Option<&'static str>,
    strict_priority: bool,
}

fn preset_spec(preset: QosPreset) -> PresetSpec {
    match preset {
        QosPreset::Off => PresetSpec {
            dscp: None,
            qdisc: None,
            strict_priority: false,
        },
        QosPreset::Vr => PresetSpec {
            dscp: Some("CS5"),
            qdisc: Some("cake"),
            strict_priority: false,
        },
        QosPreset::Balanced => PresetSpec {
            dscp: Some("AF41"),
            qdisc: Some("fq_codel"),
            strict_priority: false,
        },
        QosPreset::UltraLowLatency => PresetSpec {
            dscp: Some("CS6"),
            qdisc: Some("prio"),
            strict_priority: true,
        },
        QosPreset::HighThroughput => PresetSpec {
            dscp: Some("AF42"),
            qdisc: Some("cake"),
            strict_priority: false,
        },
    }
}

/// Installed QoS state; knows how to undo itself.
#[derive(Debug, Clone, Default)]
pub struct QosState {
    pub qdisc_ifname: Option<String>,
    pub qdisc_kind: Option<String>,
    pub dscp_rule: Option<Vec<String>>,
}

impl QosState {
    pub async fn revert(self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(rule) = self.dscp_rule {
            if let Some(ipt) = which("iptables") {
                let mut args: Vec<String> = vec!["-t".into(), "mangle".into(), "-D".into()];
                args.extend(rule);
                let refs: Vec<&str> = args.iter().map(String::as_str).collect();
                let out = run_cmd(&ipt, &refs, TC_TIMEOUT).await;
                if !out.ok() {
                    debug!("qos dscp rule delete failed: {}", out.combined());
                }
            }
        }

        if let (Some(ifname), Some(kind)) = (self.qdisc_ifname, self.qdisc_kind) {
            if let Some(tc) = which("tc") {
                if kind == "prio" {
                    let _ = run_cmd(
                        &tc,
                        &["filter", "del", "dev", &ifname, "parent", "1:0"],
                        TC_TIMEOUT,
                    )
                    .await;
                }
                let out = run_cmd(&tc, &["qdisc", "del", "dev", &ifname, "root"], TC_TIMEOUT).await;
                if !out.ok() && !out.combined().contains("Cannot find device") {
                    warnings.push(format!(
                        "qos_qdisc_delete_failed:{}",
                        out.combined().chars().take(120).collect::<String>()
                    ));
                }
            }
        }
        warnings
    }
}

async fn install_qdisc(
    ap_ifname: &str,
    kind: &str,
    strict: bool,
    warnings: &mut Vec<String>,
) -> Option<String> {
    let tc = which("tc")?;

    if strict && kind == "prio" {
        let out = run_cmd(
            &tc,
            &[
                "qdisc", "replace", "dev", ap_ifname, "root", "handle", "1:", "prio", "bands", "3",
            ],
            TC_TIMEOUT,
        )
        .await;
        if out.ok() {
            for band in ["1:1", "1:2", "1:3"] {
                let handle = format!("1{}:", &band[2..]);
                let _ = run_cmd(
                    &tc,
                    &[
                        "qdisc", "add", "dev", ap_ifname, "parent", band, "handle", &handle,
                        "fq_codel",
                    ],
                    TC_TIMEOUT,
                )
                .await;
            }
            // UDP (the VR stream) goes to the top band.
            let _ = run_cmd(
                &tc,
                &[
                    "filter", "add", "dev", ap_ifname, "protocol", "ip", "parent", "1:0", "prio",
                    "1", "u32", "match", "ip", "protocol", "17", "0xff", "flowid", "1:1",
                ],
                TC_TIMEOUT,
            )
            .await;
            return Some("prio".to_string());
        }
        warnings.push(format!(
            "prio_qdisc_failed:{}",
            out.combined().chars().take(120).collect::<String>()
        ));
    }

    if kind == "cake" || (strict && kind == "prio") {
        let out = run_cmd(
            &tc,
            &["qdisc", "replace", "dev", ap_ifname, "root", "cake", "diffserv4"],
            TC_TIMEOUT,
        )
        .await;
        if out.ok() {
            return Some("cake".to_string());
        }
        if kind == "cake" {
            warnings.push(format!(
                "cake_qdisc_failed:{}",
                out.combined().chars().take(120).collect::<String>()
            ));
        }
    }

    let out = run_cmd(
        &tc,
        &["qdisc", "replace", "dev", ap_ifname, "root", "fq_codel"],
        TC_TIMEOUT,
    )
    .await;
    if out.ok() {
        Some("fq_codel".to_string())
    } else {
        warnings.push(format!(
            "fq_codel_failed:{}",
            out.combined().chars().take(120).collect::<String>()
        ));
        None
    }
}

/// The DSCP mangle rule spec (without table/action prefix).
fn dscp_rule(ap_ifname: &str, dscp: &str) -> Vec<String> {
    [
        "POSTROUTING",
        "-o",
        ap_ifname,
        "-m",
        "comment",
        "--comment",
        QOS_RULE_TAG,
        "-j",
        "DSCP",
        "--set-dscp-class",
        dscp,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Install the preset's hooks on the AP interface. DSCP marking defers to
/// an active zone manager.
pub async fn apply(
    preset: QosPreset,
    ap_ifname: &str,
    zone_manager_active: bool,
) -> (Option<QosState>, Vec<String>) {
    let mut warnings = Vec::new();
    let spec = preset_spec(preset);
    if spec.qdisc.is_none() && spec.dscp.is_none() {
        return (None, warnings);
    }
    if ap_ifname.is_empty() {
        warnings.push("qos_missing_ap_interface".to_string());
        return (None, warnings);
    }

    let mut state = QosState::default();

    if let Some(kind) = spec.qdisc {
        if let Some(installed) =
            install_qdisc(ap_ifname, kind, spec.strict_priority, &mut warnings).await
        {
            state.qdisc_ifname = Some(ap_ifname.to_string());
            state.qdisc_kind = Some(installed);
        }
    }

    if let Some(dscp) = spec.dscp {
        if zone_manager_active {
            warnings.push("qos_dscp_skipped_zone_manager_active".to_string());
        } else if let Some(ipt) = which("iptables") {
            let rule = dscp_rule(ap_ifname, dscp);
            let mut check: Vec<String> = vec!["-t".into(), "mangle".into(), "-C".into()];
            check.extend(rule.clone());
            let check_refs: Vec<&str> = check.iter().map(String::as_str).collect();
            let exists = run_cmd(&ipt, &check_refs, TC_TIMEOUT).await.ok();
            if !exists {
                let mut add: Vec<String> = vec!["-t".into(), "mangle".into(), "-A".into()];
                add.extend(rule.clone());
                let add_refs: Vec<&str> = add.iter().map(String::as_str).collect();
                let out = run_cmd(&ipt, &add_refs, TC_TIMEOUT).await;
                if !out.ok() {
                    warnings.push(format!(
                        "qos_dscp_failed:{}",
                        out.combined().chars().take(120).collect::<String>()
                    ));
                } else {
                    state.dscp_rule = Some(rule);
                }
            } else {
                state.dscp_rule = Some(rule);
            }
        } else {
            warnings.push("iptables_not_found".to_string());
        }
    }

    if state.qdisc_kind.is_none() && state.dscp_rule.is_none() {
        (None, warnings)
    } else {
        (Some(state), warnings)
    }
}
