//! Adapter inventory records.
//!
//! Snapshots are immutable: every inventory read produces a fresh list that
//! replaces the previous one.

use serde::{Deserialize, Serialize};

/// Bus the radio hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    Usb,
    Pci,
    Embedded,
    #[default]
    Unknown,
}

impl BusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusType::Usb => "usb",
            BusType::Pci => "pci",
            BusType::Embedded => "embedded",
            BusType::Unknown => "unknown",
        }
    }
}

/// Regulatory domain context of a radio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegDomain {
    /// Two-letter country, or "00" for world, or "unknown".
    pub country: String,
    /// "self-managed" | "kernel-managed" | "global"
    pub source: String,
    pub global_country: String,
}

/// One radio visible to the host, with derived capabilities and score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Adapter {
    pub ifname: String,
    pub phy: Option<String>,
    pub bus: BusType,
    pub driver: Option<String>,
    pub mac: Option<String>,

    pub supports_ap: bool,
    pub supports_2_4ghz: bool,
    pub supports_5ghz: bool,
    pub supports_6ghz: bool,
    pub supports_80mhz: bool,
    pub supports_80211ax: bool,

    pub regdom: RegDomain,

    /// Capability score; higher is more preferred.
    pub score: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Adapter {
    pub fn supports_band(&self, band: &str) -> bool {
        match band {
            "2.4ghz" => self.supports_2_4ghz,
            "5ghz" => self.supports_5ghz,
            "6ghz" => self.supports_6ghz,
            _ => false,
        }
    }

    /// The best band this adapter can serve, used to resolve `recommended`.
    pub fn best_band(&self) -> Option<&'static str> {
        if self.supports_6ghz {
            Some("6ghz")
        } else if self.supports_5ghz {
            Some("5ghz")
        } else if self.supports_2_4ghz {
            Some("2.4ghz")
        } else {
            None
        }
    }
}

/// A full inventory read: ranked adapters plus one recommendation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterInventory {
    pub adapters: Vec<Adapter>,
    pub recommended: Option<String>,
    pub global_regdom: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl AdapterInventory {
    pub fn get(&self, ifname: &str) -> Option<&Adapter> {
        self.adapters.iter().find(|a| a.ifname == ifname)
    }

    pub fn recommended_adapter(&self) -> Option<&Adapter> {
        self.recommended.as_deref().and_then(|name| self.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_band_ordering() {
        let mut a = Adapter::default();
        assert_eq!(a.best_band(), None);
        a.supports_2_4ghz = true;
        assert_eq!(a.best_band(), Some("2.4ghz"));
        a.supports_5ghz = true;
        assert_eq!(a.best_band(), Some("5ghz"));
        a.supports_6ghz = true;
        assert_eq!(a.best_band(), Some("6ghz"));
    }

    #[test]
    fn test_inventory_lookup() {
        let inv = AdapterInventory {
            adapters: vec![Adapter {
                ifname: "wlan1".into(),
                ..Default::default()
            }],
            recommended: Some("wlan1".into()),
            ..Default::default()
        };
        assert!(inv.get("wlan1").is_some());
        assert!(inv.get("wlan9").is_none());
        assert_eq!(inv.recommended_adapter().unwrap().ifname, "wlan1");
    }
}
