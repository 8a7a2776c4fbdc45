//! Vendored binary resolution.
//!
//! External programs are located by searching `$APP/vendor/bin/<os_profile>/`,
//! then `$APP/vendor/bin/`, then `$PATH`. `VR_HOTSPOT_FORCE_VENDOR_BIN`
//! forces vendored-only; `VR_HOTSPOT_FORCE_SYSTEM_BIN` the reverse.

use crate::platform::os_release::{self, OsFlavor};
use crate::platform::{is_executable, which};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const INSTALL_DIR_ENV: &str = "VR_HOTSPOT_INSTALL_DIR";
const FORCE_VENDOR_ENV: &str = "VR_HOTSPOT_FORCE_VENDOR_BIN";
const FORCE_SYSTEM_ENV: &str = "VR_HOTSPOT_FORCE_SYSTEM_BIN";
const PROFILE_ENV: &str = "VR_HOTSPOT_VENDOR_PROFILE";

const DEFAULT_INSTALL_DIR: &str = "/var/lib/vr-hotspot/app";

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn force_vendor() -> bool {
    env_flag(FORCE_VENDOR_ENV)
}

pub fn force_system() -> bool {
    env_flag(FORCE_SYSTEM_ENV)
}

/// Root of the vendored payload.
pub fn vendor_root() -> PathBuf {
    let install = std::env::var(INSTALL_DIR_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_DIR));
    install.join("vendor")
}

/// OS profile directory names to try, most specific first.
pub fn profiles() -> Vec<String> {
    if let Ok(value) = std::env::var(PROFILE_ENV) {
        let toks: Vec<String> = value
            .replace(',', " ")
            .split_whitespace()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        if !toks.is_empty() {
            return toks;
        }
    }
    let flavor = os_release::detect_flavor(&os_release::read());
    match flavor {
        OsFlavor::Bazzite => vec!["bazzite".into(), "fedora".into()],
        OsFlavor::SteamOs => vec!["steamos".into(), "arch".into()],
        OsFlavor::CachyOs => vec!["cachyos".into(), "arch".into()],
        OsFlavor::Fedora | OsFlavor::FedoraAtomic => vec!["fedora".into()],
        OsFlavor::Arch => vec!["arch".into()],
        _ => Vec::new(),
    }
}

/// Where one binary was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedFrom {
    VendorProfile(String),
    VendorBase,
    SystemPath,
}

/// Resolve one executable through the vendored search order.
pub fn resolve(name: &str) -> Option<(PathBuf, ResolvedFrom)> {
    resolve_in(&vendor_root(), name)
}

fn resolve_in(root: &Path, name: &str) -> Option<(PathBuf, ResolvedFrom)> {
    for profile in profiles() {
        let cand = root.join("bin").join(&profile).join(name);
        if is_executable(&cand) {
            return Some((cand, ResolvedFrom::VendorProfile(profile)));
        }
    }
    let cand = root.join("bin").join(name);
    if is_executable(&cand) {
        return Some((cand, ResolvedFrom::VendorBase));
    }
    if force_vendor() {
        return None;
    }
    which(name).map(|p| (p, ResolvedFrom::SystemPath))
}

/// The environment an engine child runs with: PATH preferring the vendor
/// directories, LD_LIBRARY_PATH for vendored libs, and explicit HOSTAPD /
/// DNSMASQ overrides when resolution picked a vendored copy.
#[derive(Debug, Clone, Default)]
pub struct EngineEnv {
    pub vars: HashMap<String, String>,
    /// Binaries that could not be resolved at all.
    pub missing: Vec<String>,
}

pub fn build_engine_env(required: &[&str]) -> EngineEnv {
    let root = vendor_root();
    let mut env = EngineEnv::default();

    let sys_path = "/usr/sbin:/usr/bin:/sbin:/bin";
    let mut vendor_bins: Vec<String> = Vec::new();
    for profile in profiles() {
        let dir = root.join("bin").join(&profile);
        if dir.is_dir() {
            vendor_bins.push(dir.to_string_lossy().to_string());
        }
    }
    let base_bin = root.join("bin");
    if base_bin.is_dir() {
        vendor_bins.push(base_bin.to_string_lossy().to_string());
    }

    let path = if force_system() || vendor_bins.is_empty() {
        sys_path.to_string()
    } else {
        format!("{}:{}", vendor_bins.join(":"), sys_path)
    };
    env.vars.insert("PATH".to_string(), path);

    let mut lib_dirs: Vec<String> = Vec::new();
    for profile in profiles() {
        let dir = root.join("lib").join(&profile);
        if dir.is_dir() {
            lib_dirs.push(dir.to_string_lossy().to_string());
        }
    }
    let base_lib = root.join("lib");
    if base_lib.is_dir() {
        lib_dirs.push(base_lib.to_string_lossy().to_string());
    }
    if !lib_dirs.is_empty() {
        env.vars
            .insert("LD_LIBRARY_PATH".to_string(), lib_dirs.join(":"));
    }

    for name in required {
        match resolve(name) {
            Some((path, _)) => {
                let key = name.to_ascii_uppercase();
                env.vars.insert(key, path.to_string_lossy().to_string());
            }
            None => env.missing.push(name.to_string()),
        }
    }

    env.vars.insert("LC_ALL".to_string(), "C".to_string());
    env.vars.insert("LANG".to_string(), "C".to_string());
    env
}
