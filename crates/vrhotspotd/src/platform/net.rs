//! Kernel network device helpers: sysfs reads, `ip` invocations, rfkill.

use super::{ip_bin, iw_bin, run_cmd, which, CmdOutput, PROBE_TIMEOUT};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use vrhotspot_shared::adapters::BusType;

fn sys_net(ifname: &str) -> PathBuf {
    Path::new("/sys/class/net").join(ifname)
}

pub fn iface_exists(ifname: &str) -> bool {
    !ifname.is_empty() && sys_net(ifname).exists()
}

/// IFF_UP from the kernel flags bitmask; cheap and race-free enough for
/// readiness polling.
pub fn iface_is_up(ifname: &str) -> bool {
    if ifname.is_empty() {
        return false;
    }
    let Ok(raw) = std::fs::read_to_string(sys_net(ifname).join("flags")) else {
        return false;
    };
    let raw = raw.trim();
    let flags = if let Some(hex) = raw.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        raw.parse().unwrap_or(0)
    };
    flags & 0x1 != 0
}

pub async fn bring_iface_up(ifname: &str) -> bool {
    if ifname.is_empty() {
        return false;
    }
    if iface_is_up(ifname) {
        return true;
    }
    let out = run_cmd(
        &ip_bin(),
        &["link", "set", "dev", ifname, "up"],
        PROBE_TIMEOUT,
    )
    .await;
    if !out.ok() {
        debug!("ip link set {} up failed: {}", ifname, out.combined());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    iface_is_up(ifname)
}

pub async fn bring_iface_down(ifname: &str) -> CmdOutput {
    run_cmd(
        &ip_bin(),
        &["link", "set", "dev", ifname, "down"],
        PROBE_TIMEOUT,
    )
    .await
}

/// MAC address from sysfs.
pub fn iface_mac(ifname: &str) -> Option<String> {
    let addr = std::fs::read_to_string(sys_net(ifname).join("address")).ok()?;
    let addr = addr.trim().to_string();
    (!addr.is_empty()).then_some(addr)
}

/// Kernel driver name behind an interface.
pub fn iface_driver(ifname: &str) -> Option<String> {
    let link = sys_net(ifname).join("device/driver");
    let resolved = std::fs::canonicalize(link).ok()?;
    let name = resolved.file_name()?.to_string_lossy().to_string();
    (!name.is_empty()).then_some(name)
}

/// Bus classification via the resolved sysfs device path.
pub fn iface_bus(ifname: &str) -> BusType {
    let link = sys_net(ifname).join("device");
    match std::fs::canonicalize(&link) {
        Ok(resolved) => {
            let s = resolved.to_string_lossy();
            if s.contains("/usb") {
                BusType::Usb
            } else if s.contains("/pci") {
                BusType::Pci
            } else {
                BusType::Embedded
            }
        }
        Err(_) => {
            if link.exists() {
                BusType::Embedded
            } else {
                BusType::Unknown
            }
        }
    }
}

/// Uplink from the default route, e.g. "default via 10.0.0.1 dev eth0 ...".
pub async fn default_uplink() -> Option<String> {
    let out = run_cmd(&ip_bin(), &["route", "show", "default"], PROBE_TIMEOUT).await;
    for line in out.stdout.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some(idx) = parts.iter().position(|p| *p == "dev") {
            if let Some(dev) = parts.get(idx + 1) {
                return Some(dev.to_string());
            }
        }
    }
    None
}

/// Best-effort rfkill unblock for the wifi class.
pub async fn rfkill_unblock_wifi() -> bool {
    let Some(rfkill) = which("rfkill") else {
        return false;
    };
    run_cmd(&rfkill, &["unblock", "wifi"], PROBE_TIMEOUT).await.ok()
}

/// Remove p2p-dev siblings that can keep a radio busy for AP transitions.
pub async fn cleanup_p2p_dev_ifaces(parent_ifname: &str) -> Vec<String> {
    let mut removed = Vec::new();
    if parent_ifname.is_empty() {
        return removed;
    }
    let dump = super::iw::dev_dump().await;
    let mut candidates: Vec<String> = Vec::new();
    for iface in super::iw::parse_dev(&dump.combined()) {
        let name = iface.ifname;
        if name == format!("p2p-dev-{parent_ifname}")
            || (name.starts_with("p2p-dev-") && name.ends_with(parent_ifname))
        {
            candidates.push(name);
        }
    }
    candidates.sort();
    candidates.dedup();
    for ifname in candidates {
        let out = run_cmd(&iw_bin(), &["dev", &ifname, "del"], PROBE_TIMEOUT).await;
        if out.ok() {
            removed.push(ifname);
        }
    }
    removed
}

/// Assign an IPv4 address, flushing whatever was there first.
pub async fn assign_ipv4(ifname: &str, cidr: &str) -> CmdOutput {
    let _ = run_cmd(&ip_bin(), &["addr", "flush", "dev", ifname], PROBE_TIMEOUT).await;
    run_cmd(
        &ip_bin(),
        &["addr", "add", cidr, "dev", ifname],
        PROBE_TIMEOUT,
    )
    .await
}

pub async fn flush_ipv4(ifname: &str) -> CmdOutput {
    run_cmd(&ip_bin(), &["addr", "flush", "dev", ifname], PROBE_TIMEOUT).await
}

/// Create a kernel bridge device (idempotent: EEXIST counts as success).
pub async fn ensure_bridge(name: &str) -> bool {
    let out = run_cmd(
        &ip_bin(),
        &["link", "add", "name", name, "type", "bridge"],
        PROBE_TIMEOUT,
    )
    .await;
    out.ok() || out.combined().contains("File exists")
}

pub async fn bridge_attach(bridge: &str, ifname: &str) -> CmdOutput {
    run_cmd(
        &ip_bin(),
        &["link", "set", "dev", ifname, "master", bridge],
        PROBE_TIMEOUT,
    )
    .await
}

pub async fn bridge_detach(ifname: &str) -> CmdOutput {
    run_cmd(
        &ip_bin(),
        &["link", "set", "dev", ifname, "nomaster"],
        PROBE_TIMEOUT,
    )
    .await
}

pub async fn delete_link(name: &str) -> CmdOutput {
    run_cmd(&ip_bin(), &["link", "del", "dev", name], PROBE_TIMEOUT).await
}

/// Fixed transmit power via `iw`, in dBm (the tool takes mBm).
pub async fn set_txpower(ifname: &str, dbm: i32) -> CmdOutput {
    let mbm = (dbm * 100).to_string();
    run_cmd(
        &iw_bin(),
        &["dev", ifname, "set", "txpower", "fixed", &mbm],
        PROBE_TIMEOUT,
    )
    .await
}
