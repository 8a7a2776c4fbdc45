//! Host tuning: a bounded set of knobs applied before the engine runs and
//! reverted after it stops.
//!
//! Every knob records its prior value into the revert ledger. Failures are
//! non-fatal; they surface as warnings in `Status.warnings`.

use crate::ledger::{RevertAction, RevertLedger};
use crate::platform::{iw, run_cmd, which, PROBE_TIMEOUT};
use std::path::{Path, PathBuf};
use tracing::debug;
use vrhotspot_shared::config::Config;

/// Throughput-oriented sysctl block.
const SYSCTL_TUNING_DEFAULTS: [(&str, &str); 9] = [
    ("net.core.rmem_max", "134217728"),
    ("net.core.wmem_max", "134217728"),
    ("net.core.rmem_default", "262144"),
    ("net.core.wmem_default", "262144"),
    ("net.core.netdev_max_backlog", "50000"),
    ("net.ipv4.tcp_rmem", "4096 87380 134217728"),
    ("net.ipv4.tcp_wmem", "4096 65536 134217728"),
    ("net.core.default_qdisc", "fq"),
    ("net.ipv4.tcp_congestion_control", "bbr"),
];

/// Latency-oriented variant: smaller buffers, no slow start after idle.
const SYSCTL_LOW_LATENCY: [(&str, &str); 9] = [
    ("net.core.rmem_max", "16777216"),
    ("net.core.wmem_max", "16777216"),
    ("net.core.rmem_default", "131072"),
    ("net.core.wmem_default", "131072"),
    ("net.ipv4.tcp_rmem", "4096 16384 16777216"),
    ("net.ipv4.tcp_wmem", "4096 16384 16777216"),
    ("net.ipv4.tcp_timestamps", "1"),
    ("net.ipv4.tcp_sack", "1"),
    ("net.ipv4.tcp_slow_start_after_idle", "0"),
];

const MEMORY_TUNING: [(&str, &str); 3] = [
    ("vm.swappiness", "1"),
    ("vm.dirty_ratio", "5"),
    ("vm.dirty_background_ratio", "2"),
];

fn sysctl_path(key: &str) -> PathBuf {
    Path::new("/proc/sys").join(key.replace('.', "/"))
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn write_knob(path: &Path, value: &str) -> bool {
    std::fs::write(path, format!("{value}\n")).is_ok()
}

fn available_congestion_controls() -> Vec<String> {
    read_trimmed(&sysctl_path("net.ipv4.tcp_available_congestion_control"))
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Apply one sysctl block, recording prior values.
fn apply_sysctl_block(
    block: &[(&str, &str)],
    label: &str,
    ledger: &mut RevertLedger,
    warnings: &mut Vec<String>,
) {
    let available_cc = available_congestion_controls();
    for (key, value) in block {
        if *key == "net.ipv4.tcp_congestion_control"
            && !available_cc.iter().any(|c| c == "bbr")
        {
            warnings.push("bbr_not_available".to_string());
            continue;
        }
        let path = sysctl_path(key);
        let Some(current) = read_trimmed(&path) else {
            warnings.push(format!("{label}_missing:{key}"));
            continue;
        };
        if current == *value {
            continue;
        }
        if write_knob(&path, value) {
            ledger.push(RevertAction::SysWrite {
                path,
                previous: current,
            });
        } else {
            warnings.push(format!("{label}_set_failed:{key}"));
        }
    }
}

fn cpu_governor_paths() -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/cpu") else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with("cpu") && name[3..].chars().all(|c| c.is_ascii_digit())
        })
        .map(|e| e.path().join("cpufreq/scaling_governor"))
        .filter(|p| p.exists())
        .collect();
    paths.sort();
    paths
}

/// Knobs that apply before engine start.
pub fn apply_pre(cfg: &Config, ledger: &mut RevertLedger) -> Vec<String> {
    let mut warnings = Vec::new();

    if cfg.cpu_governor_performance {
        let paths = cpu_governor_paths();
        if paths.is_empty() {
            warnings.push("cpu_governor_not_available".to_string());
        }
        for path in paths {
            let Some(current) = read_trimmed(&path) else {
                continue;
            };
            if current == "performance" {
                continue;
            }
            if write_knob(&path, "performance") {
                ledger.push(RevertAction::SysWrite {
                    path,
                    previous: current,
                });
            } else {
                warnings.push(format!(
                    "cpu_governor_set_failed:{}",
                    path.parent()
                        .and_then(|p| p.parent())
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default()
                ));
            }
        }
    }

    if cfg.memory_tuning {
        apply_sysctl_block(&MEMORY_TUNING, "memory_tuning", ledger, &mut warnings);
    }

    if cfg.sysctl_tuning {
        if cfg.tcp_low_latency {
            apply_sysctl_block(&SYSCTL_LOW_LATENCY, "sysctl", ledger, &mut warnings);
        } else {
            apply_sysctl_block(&SYSCTL_TUNING_DEFAULTS, "sysctl", ledger, &mut warnings);
        }
    }

    warnings
}

/// power/control files up the USB device chain of an interface.
fn usb_power_control_paths(ifname: &str) -> Vec<PathBuf> {
    let dev_link = Path::new("/sys/class/net").join(ifname).join("device");
    let Ok(mut current) = std::fs::canonicalize(&dev_link) else {
        return Vec::new();
    };
    if !current.to_string_lossy().contains("/usb") {
        return Vec::new();
    }
    let mut out = Vec::new();
    loop {
        let control = current.join("power/control");
        if control.exists() && !out.contains(&control) {
            out.push(control);
        }
        let Some(parent) = current.parent() else {
            break;
        };
        if parent == current || parent == Path::new("/") {
            break;
        }
        current = parent.to_path_buf();
    }
    out
}

/// Parse a CPU list mask like "0-3,5". Bounds-checks against the host.
pub fn parse_affinity_mask(mask: &str) -> Result<Vec<usize>, String> {
    let raw = mask.trim().to_ascii_lowercase();
    if raw.is_empty() || raw == "auto" {
        return Err("cpu_affinity_empty".to_string());
    }
    let mut cpus = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((a, b)) = part.split_once('-') {
            let start: usize = a.parse().map_err(|_| "cpu_affinity_invalid_format")?;
            let end: usize = b.parse().map_err(|_| "cpu_affinity_invalid_format")?;
            if end < start {
                return Err("cpu_affinity_invalid_range".to_string());
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.parse().map_err(|_| "cpu_affinity_invalid_format")?);
        }
    }
    if cpus.is_empty() {
        return Err("cpu_affinity_empty".to_string());
    }
    let max_cpu = std::thread::available_parallelism()
        .map(|n| n.get() - 1)
        .unwrap_or(0);
    cpus.sort_unstable();
    cpus.dedup();
    if cpus.iter().any(|&c| c > max_cpu) {
        return Err("cpu_affinity_out_of_range".to_string());
    }
    Ok(cpus)
}

/// IRQ numbers serving a network interface.
fn irqs_for_interface(ifname: &str) -> Vec<u32> {
    let mut irqs = Vec::new();
    if let Ok(text) = std::fs::read_to_string("/proc/interrupts") {
        for line in text.lines() {
            if !line.contains(ifname) {
                continue;
            }
            if let Some(first) = line.split_whitespace().next() {
                if let Ok(irq) = first.trim_end_matches(':').parse() {
                    irqs.push(irq);
                }
            }
        }
    }
    let msi_dir = Path::new("/sys/class/net")
        .join(ifname)
        .join("device/msi_irqs");
    if let Ok(entries) = std::fs::read_dir(msi_dir) {
        for entry in entries.flatten() {
            if let Ok(irq) = entry.file_name().to_string_lossy().parse() {
                irqs.push(irq);
            }
        }
    }
    irqs.sort_unstable();
    irqs.dedup();
    irqs
}

fn set_cpu_affinity(pids: &[u32], cpus: &[usize], warnings: &mut Vec<String>) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for &cpu in cpus {
        if set.set(cpu).is_err() {
            warnings.push(format!("cpu_affinity_cpu_invalid:{cpu}"));
            return;
        }
    }
    for &pid in pids {
        if let Err(e) = sched_setaffinity(Pid::from_raw(pid as i32), &set) {
            warnings.push(format!("cpu_affinity_failed:pid={pid}:{e}"));
        }
    }
}

/// Knobs that need the running AP interface and engine pids.
pub async fn apply_runtime(
    cfg: &Config,
    ap_ifname: &str,
    adapter_ifname: &str,
    engine_pids: &[u32],
    ledger: &mut RevertLedger,
) -> Vec<String> {
    let mut warnings = Vec::new();

    if cfg.wifi_power_save_disable {
        let mut seen = Vec::new();
        for ifname in [ap_ifname, adapter_ifname] {
            if ifname.is_empty() || seen.contains(&ifname) {
                continue;
            }
            seen.push(ifname);
            let current = iw::get_power_save(ifname).await;
            let previous_on = current.combined().to_ascii_lowercase().contains("power save: on");
            let out = iw::set_power_save(ifname, false).await;
            if out.ok() {
                if previous_on {
                    ledger.push(RevertAction::PowerSave {
                        ifname: ifname.to_string(),
                        previous_on: true,
                    });
                }
            } else {
                warnings.push(format!("wifi_power_save_disable_failed:{ifname}"));
            }
        }
    }

    if cfg.usb_autosuspend_disable {
        for path in usb_power_control_paths(adapter_ifname) {
            let Some(current) = read_trimmed(&path) else {
                continue;
            };
            if current == "on" {
                continue;
            }
            if write_knob(&path, "on") {
                ledger.push(RevertAction::SysWrite {
                    path,
                    previous: current,
                });
            } else {
                warnings.push("usb_autosuspend_disable_failed".to_string());
            }
        }
    }

    if let Some(mask) = cfg.cpu_affinity_mask.as_deref() {
        match parse_affinity_mask(mask) {
            Ok(cpus) => {
                if engine_pids.is_empty() {
                    warnings.push("cpu_affinity_no_pids".to_string());
                } else {
                    set_cpu_affinity(engine_pids, &cpus, &mut warnings);
                }
            }
            Err(e) => warnings.push(e),
        }
    }

    if let Some(mask) = cfg.irq_affinity_mask.as_deref() {
        match parse_affinity_mask(mask) {
            Ok(cpus) => {
                let cpu_mask: u64 = cpus.iter().fold(0u64, |acc, &c| acc | (1 << c));
                let mask_str = format!("{cpu_mask:x}");
                let mut any = false;
                for ifname in [ap_ifname, adapter_ifname] {
                    for irq in irqs_for_interface(ifname) {
                        let path = PathBuf::from(format!("/proc/irq/{irq}/smp_affinity"));
                        let Some(previous) = read_trimmed(&path) else {
                            continue;
                        };
                        if std::fs::write(&path, &mask_str).is_ok() {
                            ledger.push(RevertAction::IrqAffinity {
                                irq,
                                previous_mask: previous,
                            });
                            any = true;
                        } else {
                            warnings.push(format!("irq_affinity_failed:irq={irq}"));
                        }
                    }
                }
                if !any {
                    warnings.push("irq_affinity_no_irqs_found".to_string());
                }
            }
            Err(e) => warnings.push(format!("irq_affinity_parse_failed:{e}")),
        }
    }

    if cfg.io_scheduler_optimize {
        warnings.extend(apply_io_scheduler(adapter_ifname, ledger));
    }

    if cfg.interrupt_coalescing {
        warnings.extend(apply_interrupt_coalescing(&[ap_ifname, adapter_ifname]).await);
    }

    if let Some(dbm) = cfg.tx_power_dbm {
        let out = crate::platform::net::set_txpower(adapter_ifname, dbm).await;
        if out.ok() {
            ledger.push(RevertAction::TxPower {
                ifname: adapter_ifname.to_string(),
                previous_dbm: None,
            });
        } else {
            warnings.push(format!("tx_power_set_failed:{adapter_ifname}"));
        }
    }

    warnings
}

fn io_scheduler_state(device: &str) -> Option<(String, Vec<String>)> {
    let path = PathBuf::from(format!("/sys/block/{device}/queue/scheduler"));
    let raw = read_trimmed(&path)?;
    let mut current = None;
    let mut available = Vec::new();
    for token in raw.split_whitespace() {
        if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            current = Some(inner.to_string());
            available.push(inner.to_string());
        } else {
            available.push(token.to_string());
        }
    }
    current.map(|c| (c, available))
}

fn apply_io_scheduler(ifname: &str, ledger: &mut RevertLedger) -> Vec<String> {
    let mut warnings = Vec::new();
    let dev_link = Path::new("/sys/class/net").join(ifname).join("device");
    let Ok(dev_path) = std::fs::canonicalize(dev_link) else {
        return warnings;
    };
    let Ok(blocks) = std::fs::read_dir("/sys/block") else {
        return warnings;
    };
    for entry in blocks.flatten() {
        let Ok(resolved) = std::fs::canonicalize(entry.path()) else {
            continue;
        };
        if !resolved.to_string_lossy().contains(&*dev_path.to_string_lossy()) {
            continue;
        }
        let device = entry.file_name().to_string_lossy().to_string();
        let Some((current, available)) = io_scheduler_state(&device) else {
            continue;
        };
        let target = if available.iter().any(|s| s == "none") {
            "none"
        } else if available.iter().any(|s| s == "mq-deadline") {
            "mq-deadline"
        } else {
            continue;
        };
        if current == target {
            continue;
        }
        let path = PathBuf::from(format!("/sys/block/{device}/queue/scheduler"));
        if write_knob(&path, target) {
            ledger.push(RevertAction::SysWrite {
                path,
                previous: current,
            });
        } else {
            warnings.push(format!("io_scheduler_failed:{device}"));
        }
    }
    warnings
}

/// Disable RX/TX interrupt coalescing for minimal delivery delay. Not
/// recorded in the ledger: queried state is driver-dependent and restoring
/// it is unreliable, so this knob stays until reboot.
async fn apply_interrupt_coalescing(interfaces: &[&str]) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(ethtool) = which("ethtool") else {
        warnings.push("ethtool_not_found".to_string());
        return warnings;
    };
    for ifname in interfaces {
        if ifname.is_empty() {
            continue;
        }
        for setting in [
            ["rx-usecs", "0"],
            ["tx-usecs", "0"],
            ["adaptive-rx", "off"],
            ["adaptive-tx", "off"],
        ] {
            let out = run_cmd(
                &ethtool,
                &["-C", ifname, setting[0], setting[1]],
                PROBE_TIMEOUT,
            )
            .await;
            if !out.ok() {
                debug!("ethtool -C {} {} failed", ifname, setting[0]);
            }
        }
    }
    warnings
}
