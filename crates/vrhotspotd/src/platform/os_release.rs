//! `/etc/os-release` parsing and platform flavor detection.

use std::collections::HashMap;
use std::path::Path;

const OS_RELEASE_PATHS: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

/// Distro flavor classes the daemon adjusts behavior for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsFlavor {
    SteamOs,
    Bazzite,
    FedoraAtomic,
    Fedora,
    UbuntuDebian,
    Arch,
    CachyOs,
    #[default]
    Unknown,
}

impl OsFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFlavor::SteamOs => "steamos",
            OsFlavor::Bazzite => "bazzite",
            OsFlavor::FedoraAtomic => "fedora_atomic",
            OsFlavor::Fedora => "fedora",
            OsFlavor::UbuntuDebian => "ubuntu_debian",
            OsFlavor::Arch => "arch",
            OsFlavor::CachyOs => "cachyos",
            OsFlavor::Unknown => "unknown",
        }
    }

    pub fn family(&self) -> Option<&'static str> {
        match self {
            OsFlavor::SteamOs | OsFlavor::Arch | OsFlavor::CachyOs => Some("arch"),
            OsFlavor::Bazzite | OsFlavor::FedoraAtomic | OsFlavor::Fedora => Some("fedora"),
            OsFlavor::UbuntuDebian => Some("debian"),
            OsFlavor::Unknown => None,
        }
    }
}

fn strip_quotes(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2 {
        let bytes = v.as_bytes();
        if (bytes[0] == b'"' && bytes[v.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[v.len() - 1] == b'\'')
        {
            return &v[1..v.len() - 1];
        }
    }
    v
}

/// Parse os-release text into lowercase keys.
pub fn parse(text: &str) -> HashMap<String, String> {
    let mut data = HashMap::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            data.insert(key, strip_quotes(value).to_string());
        }
    }
    data
}

/// Read the first usable os-release file on the host.
pub fn read() -> HashMap<String, String> {
    for path in OS_RELEASE_PATHS {
        if let Ok(text) = std::fs::read_to_string(Path::new(path)) {
            let data = parse(&text);
            if !data.is_empty() {
                return data;
            }
        }
    }
    HashMap::new()
}

fn tokens(info: &HashMap<String, String>) -> Vec<String> {
    let mut out = Vec::new();
    for key in ["id", "id_like", "variant_id", "variant", "name"] {
        if let Some(value) = info.get(key) {
            out.extend(
                value
                    .replace(',', " ")
                    .split_whitespace()
                    .map(|t| t.to_ascii_lowercase()),
            );
        }
    }
    out
}

/// Classify the host into one flavor class.
pub fn detect_flavor(info: &HashMap<String, String>) -> OsFlavor {
    let toks = tokens(info);
    let has = |t: &str| toks.iter().any(|x| x == t);

    if has("steamos") {
        OsFlavor::SteamOs
    } else if has("bazzite") {
        OsFlavor::Bazzite
    } else if has("cachyos") {
        OsFlavor::CachyOs
    } else if has("fedora")
        && ["silverblue", "kinoite", "sericea", "onyx", "atomic", "ostree"]
            .iter()
            .any(|t| has(t))
    {
        OsFlavor::FedoraAtomic
    } else if has("fedora") {
        OsFlavor::Fedora
    } else if ["ubuntu", "debian", "pop", "linuxmint"].iter().any(|t| has(t)) {
        OsFlavor::UbuntuDebian
    } else if has("arch") {
        OsFlavor::Arch
    } else {
        OsFlavor::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_quotes_and_comments() {
        let text = "# comment\nID=\"steamos\"\nNAME='SteamOS'\nVERSION_ID=3.5\n";
        let data = parse(text);
        assert_eq!(data.get("id").map(String::as_str), Some("steamos"));
        assert_eq!(data.get("name").map(String::as_str), Some("SteamOS"));
        assert_eq!(data.get("version_id").map(String::as_str), Some("3.5"));
    }

    #[test]
    fn test_flavor_steamos() {
        let data = parse("ID=steamos\nID_LIKE=arch\n");
        assert_eq!(detect_flavor(&data), OsFlavor::SteamOs);
        assert_eq!(detect_flavor(&data).family(), Some("arch"));
    }

    #[test]
    fn test_flavor_bazzite_wins_over_fedora() {
        let data = parse("ID=bazzite\nID_LIKE=fedora\n");
        assert_eq!(detect_flavor(&data), OsFlavor::Bazzite);
    }

    #[test]
    fn test_flavor_fedora_atomic() {
        let data = parse("ID=fedora\nVARIANT_ID=kinoite\n");
        assert_eq!(detect_flavor(&data), OsFlavor::FedoraAtomic);
    }

    #[test]
    fn test_flavor_unknown() {
        assert_eq!(detect_flavor(&HashMap::new()), OsFlavor::Unknown);
    }
}
