//! Adapter inventory: probe output turned into a scored, band-annotated
//! list with a single recommendation.
//!
//! Scoring is deterministic: identical probe output yields an identical
//! order. Snapshots are never mutated in place; every read builds a new one.

use crate::platform::{iw, net};
use tracing::warn;
use vrhotspot_shared::adapters::{Adapter, AdapterInventory, BusType, RegDomain};
use vrhotspot_shared::config::BandPreference;
use vrhotspot_shared::error::{ErrorKind, LifecycleError};

/// Capability-based score; chipset-agnostic.
pub fn score_adapter(adapter: &Adapter) -> (i32, Vec<String>) {
    let mut score = 0;
    let mut warnings = Vec::new();

    if adapter.supports_ap {
        score += 50;
    } else {
        warnings.push("no_ap_mode".to_string());
    }

    if adapter.supports_6ghz {
        score += 15;
    }
    if adapter.supports_5ghz {
        score += 10;
    }

    if adapter.supports_80mhz {
        score += 20;
    } else if adapter.supports_5ghz {
        warnings.push("adapter_lacks_80mhz_bandwidth_support".to_string());
    }

    if adapter.regdom.source == "self-managed" {
        score += 20;
    }
    let cc = adapter.regdom.country.as_str();
    if cc != "00" && cc != "unknown" && !cc.is_empty() {
        score += 10;
    } else {
        warnings.push("regdom_global_or_unknown".to_string());
    }

    // wlan0 is disproportionately often an embedded radio with AP-mode
    // quirks; USB secondaries are the better default.
    if adapter.ifname == "wlan0" {
        score -= 30;
        warnings.push("wlan0_deprioritized_known_ap_mode_issues".to_string());
    }

    (score, warnings)
}

/// Rank adapters best-first. Tie-break order: supports_ap, supports_5ghz,
/// bus=usb, higher score, then a stable sort on ifname.
pub fn rank(adapters: &mut [Adapter]) {
    adapters.sort_by(|a, b| {
        b.supports_ap
            .cmp(&a.supports_ap)
            .then(b.supports_5ghz.cmp(&a.supports_5ghz))
            .then((b.bus == BusType::Usb).cmp(&(a.bus == BusType::Usb)))
            .then(b.score.cmp(&a.score))
            .then(a.ifname.cmp(&b.ifname))
    });
}

/// Enumerate radios and produce a ranked inventory. Read-only; probe errors
/// surface as a `platform_probe_failed` warning rather than a failure.
pub async fn snapshot() -> AdapterInventory {
    let mut inventory = AdapterInventory::default();

    let dev = iw::dev_dump().await;
    if !dev.ok() {
        inventory
            .warnings
            .push(format!("platform_probe_failed:iw_dev:{}", dev.code));
        return inventory;
    }
    let devs = iw::parse_dev(&dev.combined());

    let reg_out = iw::reg_get().await;
    let reg = if reg_out.ok() {
        iw::parse_reg_get(&reg_out.combined())
    } else {
        inventory
            .warnings
            .push(format!("platform_probe_failed:iw_reg_get:{}", reg_out.code));
        Default::default()
    };
    inventory.global_regdom = reg.global_country.clone();

    for dev_iface in devs {
        // Virtual AP children and p2p devices are not candidate radios.
        if dev_iface.ifname.starts_with("p2p-dev-") {
            continue;
        }

        let caps = match dev_iface.phy.as_deref() {
            Some(phy) => {
                let out = iw::phy_info(phy).await;
                if out.ok() {
                    iw::parse_phy_info(&out.combined())
                } else {
                    warn!("iw phy {} info failed: {}", phy, out.code);
                    Default::default()
                }
            }
            None => Default::default(),
        };

        let mut adapter = Adapter {
            ifname: dev_iface.ifname.clone(),
            phy: dev_iface.phy.clone(),
            bus: net::iface_bus(&dev_iface.ifname),
            driver: net::iface_driver(&dev_iface.ifname),
            mac: dev_iface.addr.or_else(|| net::iface_mac(&dev_iface.ifname)),
            supports_ap: caps.supports_ap,
            supports_2_4ghz: caps.supports_2_4ghz,
            supports_5ghz: caps.supports_5ghz,
            supports_6ghz: caps.supports_6ghz,
            supports_80mhz: caps.supports_80mhz,
            supports_80211ax: caps.supports_80211ax,
            regdom: RegDomain {
                country: reg.country_for(dev_iface.phy.as_deref()),
                source: reg.source_for(dev_iface.phy.as_deref()),
                global_country: reg
                    .global_country
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            score: 0,
            warnings: Vec::new(),
        };
        let (score, warnings) = score_adapter(&adapter);
        adapter.score = score;
        adapter.warnings = warnings;
        inventory.adapters.push(adapter);
    }

    rank(&mut inventory.adapters);
    inventory.recommended = inventory
        .adapters
        .iter()
        .find(|a| a.supports_ap)
        .map(|a| a.ifname.clone());
    inventory
}

/// Resolve the adapter to run the AP on for a requested band.
///
/// An explicit request wins if the adapter exists and can serve the band in
/// AP mode; otherwise the best-ranked alternative is chosen. A 6 GHz request
/// with no capable radio is a distinct error for the fallback rules.
pub fn select_for(
    inventory: &AdapterInventory,
    band: BandPreference,
    requested: Option<&str>,
) -> Result<Adapter, LifecycleError> {
    if let Some(name) = requested.filter(|n| !n.is_empty()) {
        let adapter = inventory
            .get(name)
            .ok_or_else(|| LifecycleError::new(ErrorKind::AdapterNotFound).with_detail(name))?;
        if !adapter.supports_ap {
            return Err(LifecycleError::new(ErrorKind::AdapterNoApMode).with_detail(name));
        }
        if let BandPreference::Band6g = band {
            if !adapter.supports_6ghz {
                return Err(LifecycleError::new(ErrorKind::No6ghzApAdapter).with_detail(name));
            }
        }
        return Ok(adapter.clone());
    }

    match band {
        BandPreference::Band6g => inventory
            .adapters
            .iter()
            .find(|a| a.supports_ap && a.supports_6ghz)
            .cloned()
            .ok_or_else(|| LifecycleError::new(ErrorKind::No6ghzApAdapter)),
        BandPreference::Band5g => {
            // A USB radio with 5 GHz AP support outranks an embedded one.
            let usb = inventory
                .adapters
                .iter()
                .find(|a| a.bus == BusType::Usb && a.supports_ap && a.supports_5ghz);
            usb.or_else(|| {
                inventory
                    .adapters
                    .iter()
                    .find(|a| a.supports_ap && a.supports_5ghz)
            })
            .or_else(|| inventory.adapters.iter().find(|a| a.supports_ap))
            .cloned()
            .ok_or_else(|| LifecycleError::new(ErrorKind::AdapterNoApMode))
        }
        _ => inventory
            .recommended_adapter()
            .cloned()
            .or_else(|| inventory.adapters.iter().find(|a| a.supports_ap).cloned())
            .ok_or_else(|| LifecycleError::new(ErrorKind::AdapterNoApMode)),
    }
}
