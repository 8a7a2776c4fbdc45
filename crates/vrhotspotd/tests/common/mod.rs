//! Test host fixture: a sandboxed daemon core driven against scripted
//! stand-ins for the host tools (iw, ip, hostapd, dnsmasq, the orchestrator
//! and hostapd_cli).
//!
//! Each scenario lives in its own test binary so the process environment
//! (PATH, state dir) belongs to exactly one fixture.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use vrhotspotd::{Hotspot, HotspotPaths};

/// Tests in one binary share the process environment; take this lock first.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

pub struct TestHost {
    pub tmp: TempDir,
    pub bin: PathBuf,
    pub state: PathBuf,
    pub paths: HotspotPaths,
}

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

const IW_SCRIPT: &str = r#"#!/bin/sh
S="$VRHS_TEST_STATE"
if [ "$1" = "dev" ] && [ -z "$2" ]; then cat "$S/iw_dev.txt" 2>/dev/null; exit 0; fi
if [ "$1" = "reg" ] && [ "$2" = "get" ]; then cat "$S/iw_reg.txt" 2>/dev/null; exit 0; fi
if [ "$1" = "reg" ] && [ "$2" = "set" ]; then exit 0; fi
if [ "$1" = "phy" ] && [ "$3" = "info" ]; then cat "$S/iw_phy_info.txt" 2>/dev/null; exit 0; fi
if [ "$1" = "dev" ] && [ "$3" = "info" ]; then cat "$S/iw_dev_info_$2.txt" 2>/dev/null; exit 0; fi
if [ "$1" = "dev" ] && [ "$3" = "station" ]; then cat "$S/iw_station_$2.txt" 2>/dev/null; exit 0; fi
if [ "$1" = "dev" ] && [ "$3" = "del" ]; then exit 0; fi
if [ "$1" = "dev" ] && [ "$3" = "get" ]; then echo "Power save: off"; exit 0; fi
if [ "$1" = "dev" ] && [ "$3" = "set" ]; then exit 0; fi
if [ "$1" = "dev" ] && [ "$3" = "scan" ]; then exit 1; fi
exit 0
"#;

const IP_SCRIPT: &str = "#!/bin/sh\nexit 0\n";

/// Orchestrator stand-in: drops a runtime config dir from the template,
/// then signals AP readiness by creating the control socket.
const LNXROUTER_SCRIPT: &str = r#"#!/bin/sh
S="$VRHS_TEST_STATE"
IF=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--ap" ]; then IF="$a"; break; fi
  prev="$a"
done
D="$VRHS_ENGINE_DIR/lnxrouter.$IF.conf.test"
mkdir -p "$D"
cp "$S/hostapd_conf_template.txt" "$D/hostapd.conf" 2>/dev/null || true
CTRL=$(sed -n 's/^ctrl_interface=//p' "$D/hostapd.conf")
APIF=$(sed -n 's/^interface=//p' "$D/hostapd.conf")
mkdir -p "$CTRL" 2>/dev/null
echo "config dir: $D"
sleep "${VRHS_READY_DELAY:-0.2}"
if [ "${VRHS_NEVER_READY:-0}" != "1" ]; then
  touch "$CTRL/$APIF"
  echo "$APIF: AP-ENABLED"
fi
sleep 600
"#;

/// hostapd stand-in for the direct backends. A 6 GHz config (op_class=131)
/// never becomes ready unless VRHS_6GHZ_READY=1; VRHS_6GHZ_CRASH=1 makes it
/// exit early instead of hanging.
const HOSTAPD_SCRIPT: &str = r#"#!/bin/sh
CONF="$1"
CTRL=$(sed -n 's/^ctrl_interface=//p' "$CONF")
APIF=$(sed -n 's/^interface=//p' "$CONF")
if grep -q '^op_class=131' "$CONF" 2>/dev/null; then
  if [ "${VRHS_6GHZ_CRASH:-0}" = "1" ]; then
    sleep 0.2
    exit 3
  fi
  if [ "${VRHS_6GHZ_READY:-0}" != "1" ]; then
    sleep 600
  fi
fi
mkdir -p "$CTRL" 2>/dev/null
sleep "${VRHS_READY_DELAY:-0.2}"
touch "$CTRL/$APIF"
echo "$APIF: AP-ENABLED"
sleep 600
"#;

const DNSMASQ_SCRIPT: &str = "#!/bin/sh\nsleep 600\n";

const HOSTAPD_CLI_SCRIPT: &str = r#"#!/bin/sh
CTRL=""
IFACE=""
while [ $# -gt 0 ]; do
  case "$1" in
    -p) CTRL="$2"; shift 2 ;;
    -i) IFACE="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if [ -e "$CTRL/$IFACE" ]; then
  echo "PONG"
  exit 0
fi
echo "FAIL"
exit 1
"#;

impl TestHost {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("bin");
        let state = tmp.path().join("state");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&state).unwrap();

        write_script(&bin, "iw", IW_SCRIPT);
        write_script(&bin, "ip", IP_SCRIPT);
        write_script(&bin, "lnxrouter", LNXROUTER_SCRIPT);
        write_script(&bin, "hostapd", HOSTAPD_SCRIPT);
        write_script(&bin, "dnsmasq", DNSMASQ_SCRIPT);
        write_script(&bin, "hostapd_cli", HOSTAPD_CLI_SCRIPT);

        let paths = HotspotPaths::under(tmp.path());
        std::fs::create_dir_all(paths.run_dir.join("engine")).unwrap();

        std::env::set_var("PATH", format!("{}:/usr/bin:/bin", bin.display()));
        std::env::set_var("VRHS_TEST_STATE", &state);
        std::env::set_var("VR_HOTSPOT_INSTALL_DIR", tmp.path().join("app"));
        std::env::set_var("VRHS_ENGINE_DIR", paths.run_dir.join("engine"));
        std::env::set_var("VRHS_READY_DELAY", "0.2");
        std::env::remove_var("VRHS_NEVER_READY");
        std::env::remove_var("VRHS_6GHZ_READY");
        std::env::remove_var("VRHS_6GHZ_CRASH");

        Self {
            bin,
            state,
            paths,
            tmp,
        }
    }

    pub fn core(&self) -> Arc<Hotspot> {
        Hotspot::new(self.paths.clone())
    }

    pub fn write_state(&self, name: &str, content: &str) {
        std::fs::write(self.state.join(name), content).unwrap();
    }

    pub fn ctrl_dir(&self) -> PathBuf {
        self.state.join("ctrl")
    }

    /// Standard `iw dev` fixture: one managed parent plus its virtual AP
    /// child advertising `ssid` on 5 GHz channel 36 at 80 MHz.
    pub fn seed_iw_dev(&self, parent: &str, ssid: &str) {
        let content = format!(
            "phy#1\n\
             \tInterface {parent}\n\
             \t\taddr 00:11:22:33:44:55\n\
             \t\ttype managed\n\
             \tInterface x0{parent}\n\
             \t\taddr 00:11:22:33:44:66\n\
             \t\tssid {ssid}\n\
             \t\ttype AP\n\
             \t\tchannel 36 (5180 MHz), width: 80 MHz, center1: 5210 MHz\n"
        );
        self.write_state("iw_dev.txt", &content);
    }

    /// phy capabilities: AP mode, 2.4 + 5 GHz, VHT80, Wi-Fi 6; optionally a
    /// 6 GHz band as well.
    pub fn seed_phy_info(&self, with_6ghz: bool) {
        let mut content = String::from(
            "Wiphy phy1\n\
             \tSupported interface modes:\n\
             \t\t * managed\n\
             \t\t * AP\n\
             \tBand 1:\n\
             \t\tFrequencies:\n\
             \t\t\t* 2412 MHz [1] (20.0 dBm)\n\
             \t\t\t* 2437 MHz [6] (20.0 dBm)\n\
             \tBand 2:\n\
             \t\tVHT Capabilities (0x339071f2):\n\
             \t\t\tSupported Channel Width: neither 160 nor 80+80\n\
             \t\tHE Iftypes: managed, AP\n\
             \t\tFrequencies:\n\
             \t\t\t* 5180 MHz [36] (23.0 dBm)\n\
             \t\t\t* 5200 MHz [40] (23.0 dBm)\n\
             \t\t\t* 5220 MHz [44] (23.0 dBm)\n\
             \t\t\t* 5240 MHz [48] (23.0 dBm)\n",
        );
        if with_6ghz {
            content.push_str(
                "\tBand 4:\n\
                 \t\tFrequencies:\n\
                 \t\t\t* 5955 MHz [1] (23.0 dBm)\n\
                 \t\t\t* 5975 MHz [5] (23.0 dBm)\n",
            );
        }
        self.write_state("iw_phy_info.txt", &content);
    }

    pub fn seed_reg(&self, country: &str) {
        self.write_state(
            "iw_reg.txt",
            &format!("global\ncountry {country}: DFS-FCC\n"),
        );
    }

    /// The hostapd config the fake orchestrator drops into its runtime dir.
    pub fn seed_orchestrator_conf(&self, ap_ifname: &str, ssid: &str, country: Option<&str>) {
        let mut content = format!(
            "interface={ap_ifname}\n\
             driver=nl80211\n\
             ctrl_interface={}\n\
             ssid={ssid}\n\
             hw_mode=a\n\
             channel=36\n\
             ieee80211d=1\n",
            self.ctrl_dir().display()
        );
        if let Some(cc) = country {
            content.push_str(&format!("country_code={cc}\n"));
        }
        self.write_state("hostapd_conf_template.txt", &content);
    }

    /// Seed everything a happy-path 5 GHz orchestrator start needs.
    pub fn seed_happy_5ghz(&self, parent: &str, ssid: &str) {
        self.seed_iw_dev(parent, ssid);
        self.seed_phy_info(false);
        self.seed_reg("US");
        self.seed_orchestrator_conf(&format!("x0{parent}"), ssid, Some("US"));
    }
}

/// Wait until `predicate` holds or the deadline passes.
pub async fn wait_for(
    mut predicate: impl FnMut() -> bool,
    timeout: std::time::Duration,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    predicate()
}
