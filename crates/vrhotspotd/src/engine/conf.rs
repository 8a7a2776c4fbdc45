//! Engine runtime configuration directories.
//!
//! The orchestrator backend drops a config dir of its own; the direct
//! backends pre-generate one. Either way the lifecycle discovers it shortly
//! after spawn, ensures the hostapd control-interface directory, and
//! enforces the regulatory country on disk before readiness is awaited.

use super::supervisor::EngineHandle;
use crate::platform::{run_cmd, which};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where orchestrator-style runtime config dirs appear.
const ORCHESTRATOR_TMP: &str = "/dev/shm/lnxrouter_tmp";

/// hostapd control socket directories to try when the conf names none.
const CTRL_DIR_CANDIDATES: [&str; 2] = ["/run/hostapd", "/var/run/hostapd"];

/// Bound on config-dir discovery after spawn.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(1);

/// Roots scanned for engine runtime config dirs.
pub fn candidate_roots(run_dir: &Path) -> Vec<PathBuf> {
    vec![PathBuf::from(ORCHESTRATOR_TMP), run_dir.join("engine")]
}

/// Newest config dir under the roots, preferring ones named after the
/// adapter.
pub fn find_latest_conf_dir(roots: &[PathBuf], adapter_ifname: Option<&str>) -> Option<PathBuf> {
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for root in roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(ifname) = adapter_ifname {
                if !name.contains(ifname) {
                    continue;
                }
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            candidates.push((mtime, path));
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().next().map(|(_, p)| p)
}

/// Poll for the engine's runtime config dir within the discovery window and
/// record it on the handle. Pre-generated dirs resolve immediately.
pub async fn discover(
    handle: &EngineHandle,
    roots: &[PathBuf],
    adapter_ifname: Option<&str>,
) -> Option<PathBuf> {
    if let Some(dir) = handle.discovered_config_dir() {
        return Some(dir);
    }
    let deadline = Instant::now() + DISCOVERY_WINDOW;
    loop {
        // Only report a directory once its hostapd config is readable; the
        // backend may still be in the middle of writing it.
        if let Some(dir) = find_latest_conf_dir(roots, adapter_ifname) {
            if load_hostapd_conf(&dir).is_some() {
                info!("engine config dir discovered: {}", dir.display());
                handle.set_discovered_config_dir(dir.clone());
                return Some(dir);
            }
        }
        if Instant::now() >= deadline || !handle.is_alive() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// The hostapd settings the lifecycle cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostapdConf {
    pub interface: Option<String>,
    pub ssid: Option<String>,
    pub ctrl_interface_dir: Option<PathBuf>,
    pub ieee80211d: Option<u8>,
    pub country_code: Option<String>,
}

/// Parse the subset of a hostapd config this module operates on.
/// `ctrl_interface` accepts both a plain path and the `DIR=/path` form.
pub fn parse_hostapd_conf(text: &str) -> HostapdConf {
    let mut conf = HostapdConf::default();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "interface" => conf.interface = Some(value.to_string()),
            "ssid" => conf.ssid = Some(value.to_string()),
            "ctrl_interface" => {
                let dir = value
                    .strip_prefix("DIR=")
                    .map(|rest| rest.split_whitespace().next().unwrap_or(rest))
                    .unwrap_or_else(|| value.split_whitespace().next().unwrap_or(value));
                if !dir.is_empty() {
                    conf.ctrl_interface_dir = Some(PathBuf::from(dir));
                }
            }
            "ieee80211d" => conf.ieee80211d = value.parse().ok(),
            "country_code" => {
                if !value.is_empty() {
                    conf.country_code = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    conf
}

fn hostapd_conf_path(conf_dir: &Path) -> Option<PathBuf> {
    let direct = conf_dir.join("hostapd.conf");
    if direct.is_file() {
        return Some(direct);
    }
    // The orchestrator names it hostapd.conf as well, but scan defensively.
    std::fs::read_dir(conf_dir).ok()?.flatten().find_map(|e| {
        let path = e.path();
        let name = e.file_name().to_string_lossy().to_string();
        (name.starts_with("hostapd") && name.ends_with(".conf")).then_some(path)
    })
}

/// Read and parse the hostapd config inside a runtime dir.
pub fn load_hostapd_conf(conf_dir: &Path) -> Option<(PathBuf, HostapdConf)> {
    let path = hostapd_conf_path(conf_dir)?;
    let text = std::fs::read_to_string(&path).ok()?;
    Some((path.clone(), parse_hostapd_conf(&text)))
}

/// Make sure the control-interface directory named in the config exists
/// with mode 0755 so hostapd_cli can reach the socket.
pub fn ensure_ctrl_interface_dir(conf: &HostapdConf) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let dir = conf.ctrl_interface_dir.clone()?;
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("ctrl interface dir create failed {}: {}", dir.display(), e);
        return None;
    }
    if let Err(e) = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)) {
        warn!("ctrl interface dir chmod failed {}: {}", dir.display(), e);
    }
    Some(dir)
}

/// When `ieee80211d=1`, the country code must be two uppercase letters and
/// not the world domain.
pub fn country_valid_for_80211d(conf: &HostapdConf) -> bool {
    if conf.ieee80211d != Some(1) {
        return true;
    }
    match conf.country_code.as_deref() {
        Some(cc) => cc.len() == 2 && cc.chars().all(|c| c.is_ascii_uppercase()) && cc != "00",
        None => false,
    }
}

/// Rewrite (or append) `country_code=` in the config on disk.
/// Returns whether the file changed.
pub fn enforce_country(conf_path: &Path, country: &str) -> std::io::Result<bool> {
    if country.len() != 2 || country == "00" || !country.chars().all(|c| c.is_ascii_uppercase()) {
        return Ok(false);
    }
    let text = std::fs::read_to_string(conf_path)?;
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let mut modified = false;
    let mut found = false;

    for line in lines.iter_mut() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(current) = trimmed.strip_prefix("country_code=") {
            found = true;
            if current.trim() != country {
                *line = format!("country_code={country}");
                modified = true;
            }
            break;
        }
    }
    if !found {
        lines.push(format!("country_code={country}"));
        modified = true;
    }

    if modified {
        std::fs::write(conf_path, lines.join("\n") + "\n")?;
        info!("country code enforced in {}", conf_path.display());
    }
    Ok(modified)
}

/// Delete engine runtime config dirs. Best-effort; returns removed names.
pub fn remove_conf_dirs(roots: &[PathBuf], adapter_ifname: Option<&str>) -> Vec<String> {
    let mut removed = Vec::new();
    for root in roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(ifname) = adapter_ifname {
                if !name.contains(ifname) {
                    continue;
                }
            }
            if std::fs::remove_dir_all(&path).is_ok() {
                removed.push(name);
            }
        }
    }
    removed
}

/// Last `max_lines` of one log file, tagged with its name.
pub fn read_log_tail(path: &Path, max_lines: usize) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..]
        .iter()
        .map(|l| format!("[{name}] {l}"))
        .collect()
}

/// Tails of the AP daemon and DHCP logs inside a runtime dir, for
/// `Status.engine.ap_logs_tail`.
pub fn collect_ap_logs(conf_dir: &Path, max_lines: usize) -> Vec<String> {
    let mut out = Vec::new();
    for name in ["hostapd.log", "dnsmasq.log"] {
        let path = conf_dir.join(name);
        if path.is_file() {
            out.extend(read_log_tail(&path, max_lines));
        }
    }
    out
}

/// Locate the control socket directory for an AP interface.
pub fn find_ctrl_dir(conf_dir: Option<&Path>, ap_ifname: &str) -> Option<PathBuf> {
    if let Some(dir) = conf_dir {
        if let Some((_, conf)) = load_hostapd_conf(dir) {
            if let Some(ctrl) = conf.ctrl_interface_dir {
                if ctrl.join(ap_ifname).exists() {
                    return Some(ctrl);
                }
            }
        }
    }
    for cand in CTRL_DIR_CANDIDATES {
        let dir = PathBuf::from(cand);
        if dir.join(ap_ifname).exists() {
            return Some(dir);
        }
    }
    None
}

/// Primary readiness signal: the AP control channel answers a PING.
pub async fn hostapd_cli_ping(ctrl_dir: &Path, ap_ifname: &str) -> bool {
    let cli = super::vendor::resolve("hostapd_cli")
        .map(|(p, _)| p)
        .or_else(|| which("hostapd_cli"));
    let Some(cli) = cli else {
        return false;
    };
    let ctrl = ctrl_dir.to_string_lossy().to_string();
    let out = run_cmd(
        &cli,
        &["-p", &ctrl, "-i", ap_ifname, "ping"],
        Duration::from_millis(800),
    )
    .await;
    let pong = out.ok() && out.stdout.contains("PONG");
    if !pong {
        debug!("hostapd_cli ping {} failed: {}", ap_ifname, out.combined());
    }
    pong
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONF: &str = "\
interface=x0wlan1
driver=nl80211
ctrl_interface=/run/hostapd
ssid=VR-NET
hw_mode=a
channel=36
country_code=US
ieee80211d=1
";

    #[test]
    fn test_parse_hostapd_conf() {
        let conf = parse_hostapd_conf(CONF);
        assert_eq!(conf.interface.as_deref(), Some("x0wlan1"));
        assert_eq!(conf.ssid.as_deref(), Some("VR-NET"));
        assert_eq!(
            conf.ctrl_interface_dir.as_deref(),
            Some(Path::new("/run/hostapd"))
        );
        assert_eq!(conf.ieee80211d, Some(1));
        assert_eq!(conf.country_code.as_deref(), Some("US"));
    }

    #[test]
    fn test_parse_ctrl_interface_dir_form() {
        let conf = parse_hostapd_conf("ctrl_interface=DIR=/var/run/hostapd GROUP=wheel\n");
        assert_eq!(
            conf.ctrl_interface_dir.as_deref(),
            Some(Path::new("/var/run/hostapd"))
        );
    }

    #[test]
    fn test_country_validation_for_80211d() {
        let ok = parse_hostapd_conf("ieee80211d=1\ncountry_code=US\n");
        assert!(country_valid_for_80211d(&ok));

        let missing = parse_hostapd_conf("ieee80211d=1\n");
        assert!(!country_valid_for_80211d(&missing));

        let world = parse_hostapd_conf("ieee80211d=1\ncountry_code=00\n");
        assert!(!country_valid_for_80211d(&world));

        let lowercase = parse_hostapd_conf("ieee80211d=1\ncountry_code=us\n");
        assert!(!country_valid_for_80211d(&lowercase));

        let no_80211d = parse_hostapd_conf("country_code=00\n");
        assert!(country_valid_for_80211d(&no_80211d));
    }

    #[test]
    fn test_enforce_country_replaces_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostapd.conf");

        std::fs::write(&path, "ssid=X\ncountry_code=00\n").unwrap();
        assert!(enforce_country(&path, "DE").unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("country_code=DE"));
        assert!(!text.contains("country_code=00"));

        std::fs::write(&path, "ssid=X\n").unwrap();
        assert!(enforce_country(&path, "DE").unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("country_code=DE"));

        // Already correct: untouched.
        assert!(!enforce_country(&path, "DE").unwrap());
    }

    #[test]
    fn test_enforce_country_rejects_invalid_codes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostapd.conf");
        std::fs::write(&path, "ssid=X\n").unwrap();
        assert!(!enforce_country(&path, "00").unwrap());
        assert!(!enforce_country(&path, "usa").unwrap());
    }

    #[test]
    fn test_find_latest_conf_dir_prefers_adapter_match() {
        let root = TempDir::new().unwrap();
        let a = root.path().join("lnxrouter.wlan0.conf.ABC");
        let b = root.path().join("lnxrouter.wlan1.conf.DEF");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        let roots = vec![root.path().to_path_buf()];
        let found = find_latest_conf_dir(&roots, Some("wlan1")).unwrap();
        assert_eq!(found, b);
        assert!(find_latest_conf_dir(&roots, Some("wlan9")).is_none());
    }

    #[test]
    fn test_remove_conf_dirs() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("lnxrouter.wlan1.conf.XYZ");
        std::fs::create_dir_all(&dir).unwrap();
        let removed = remove_conf_dirs(&[root.path().to_path_buf()], Some("wlan1"));
        assert_eq!(removed, vec!["lnxrouter.wlan1.conf.XYZ".to_string()]);
        assert!(!dir.exists());
    }

    #[test]
    fn test_read_log_tail_caps_and_tags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostapd.log");
        let body: String = (0..300).map(|i| format!("line{i}\n")).collect();
        std::fs::write(&path, body).unwrap();
        let tail = read_log_tail(&path, 200);
        assert_eq!(tail.len(), 200);
        assert_eq!(tail.last().map(String::as_str), Some("[hostapd.log] line299"));
    }
}
