//! AP readiness detection.
//!
//! After engine spawn the lifecycle awaits one of two signals within the
//! configured timeout: the AP control channel answering a PING (primary),
//! or an alive engine with the AP interface administratively UP, typed AP
//! by the kernel, and advertising the requested SSID (fallback). The poll
//! loop runs every ~100 ms and is cancellable through a watch flag.

use crate::engine::conf;
use crate::engine::supervisor::EngineHandle;
use crate::platform::{iw, net};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Poll cadence of the readiness loop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the prober learned about the AP once it came up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadyInfo {
    pub ifname: String,
    pub ssid: Option<String>,
    pub channel: Option<u16>,
    pub freq_mhz: Option<u32>,
    pub width_mhz: Option<u32>,
}

/// Why the probe returned without readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    EngineExited,
    TimedOut,
    Cancelled,
}

/// Inputs for one readiness wait.
pub struct ProbeParams<'a> {
    pub target_phy: Option<&'a str>,
    pub ssid: &'a str,
    pub expected_ap_ifname: Option<&'a str>,
    pub conf_dir: Option<&'a Path>,
    pub timeout: Duration,
}

/// Candidate AP interface in the current `iw dev` dump: prefer the expected
/// name, then any AP-typed interface on the target phy, then any AP-typed
/// interface advertising the SSID.
fn pick_candidate(
    devs: &[iw::DevInterface],
    params: &ProbeParams<'_>,
) -> Option<iw::DevInterface> {
    if let Some(expected) = params.expected_ap_ifname {
        if let Some(dev) = devs.iter().find(|d| d.ifname == expected) {
            return Some(dev.clone());
        }
    }
    if let Some(phy) = params.target_phy {
        if let Some(dev) = devs
            .iter()
            .find(|d| d.is_ap() && d.phy.as_deref() == Some(phy))
        {
            return Some(dev.clone());
        }
    }
    devs.iter()
        .find(|d| d.is_ap() && d.ssid.as_deref() == Some(params.ssid))
        .cloned()
}

fn ssid_matches(dev: &iw::DevInterface, requested: &str) -> bool {
    if requested.is_empty() {
        return true;
    }
    match dev.ssid.as_deref() {
        // Some drivers publish the SSID into `iw dev` late; a missing SSID
        // is not a mismatch.
        None => true,
        Some(ssid) => ssid == requested,
    }
}

async fn probe_once(
    handle: &EngineHandle,
    params: &ProbeParams<'_>,
) -> Option<ReadyInfo> {
    let dump = iw::dev_dump().await;
    let devs = iw::parse_dev(&dump.combined());
    let candidate = pick_candidate(&devs, params)?;

    if !candidate.is_ap() {
        return None;
    }
    if !ssid_matches(&candidate, params.ssid) {
        return None;
    }

    // Primary: control channel ping.
    if let Some(ctrl_dir) = conf::find_ctrl_dir(params.conf_dir, &candidate.ifname) {
        if conf::hostapd_cli_ping(&ctrl_dir, &candidate.ifname).await {
            return Some(enrich(candidate).await);
        }
    }

    // Fallback: engine alive + iface up + kernel reports AP type.
    if handle.is_alive() && net::iface_is_up(&candidate.ifname) {
        let info = iw::parse_dev_info(&iw::dev_info(&candidate.ifname).await.combined());
        if info.iftype.as_deref() == Some("AP") {
            let mut ready = enrich(candidate).await;
            ready.channel = ready.channel.or(info.channel);
            ready.freq_mhz = ready.freq_mhz.or(info.freq_mhz);
            ready.width_mhz = ready.width_mhz.or(info.width_mhz);
            return Some(ready);
        }
    }
    None
}

async fn enrich(candidate: iw::DevInterface) -> ReadyInfo {
    let mut ready = ReadyInfo {
        ifname: candidate.ifname.clone(),
        ssid: candidate.ssid.clone(),
        channel: candidate.channel,
        freq_mhz: candidate.freq_mhz,
        width_mhz: candidate.width_mhz,
    };
    if ready.channel.is_none() || ready.width_mhz.is_none() {
        let info = iw::parse_dev_info(&iw::dev_info(&candidate.ifname).await.combined());
        ready.channel = ready.channel.or(info.channel);
        ready.freq_mhz = ready.freq_mhz.or(info.freq_mhz);
        ready.width_mhz = ready.width_mhz.or(info.width_mhz);
        ready.ssid = ready.ssid.or(info.ssid);
    }
    ready
}

/// Await readiness. Never mutates host state; on timeout the caller decides
/// what to tear down.
pub async fn await_ready(
    handle: &EngineHandle,
    params: ProbeParams<'_>,
    cancel: &watch::Receiver<bool>,
) -> (ProbeOutcome, Option<ReadyInfo>) {
    let deadline = Instant::now() + params.timeout;
    loop {
        if *cancel.borrow() {
            debug!("readiness probe cancelled");
            return (ProbeOutcome::Cancelled, None);
        }

        if let Some(ready) = probe_once(handle, &params).await {
            info!(
                ifname = %ready.ifname,
                channel = ?ready.channel,
                width = ?ready.width_mhz,
                "access point ready"
            );
            return (ProbeOutcome::Ready, Some(ready));
        }

        if !handle.is_alive() {
            return (ProbeOutcome::EngineExited, None);
        }
        if Instant::now() >= deadline {
            return (ProbeOutcome::TimedOut, None);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(ifname: &str, phy: &str, iftype: &str, ssid: Option<&str>) -> iw::DevInterface {
        iw::DevInterface {
            ifname: ifname.into(),
            phy: Some(phy.into()),
            iftype: Some(iftype.into()),
            ssid: ssid.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_candidate_prefers_expected_name() {
        let devs = vec![
            dev("x0wlan1", "phy1", "AP", Some("VR-NET")),
            dev("wlan9", "phy9", "AP", Some("VR-NET")),
        ];
        let params = ProbeParams {
            target_phy: Some("phy9"),
            ssid: "VR-NET",
            expected_ap_ifname: Some("x0wlan1"),
            conf_dir: None,
            timeout: Duration::from_secs(1),
        };
        let picked = pick_candidate(&devs, &params).unwrap();
        assert_eq!(picked.ifname, "x0wlan1");
    }

    #[test]
    fn test_candidate_falls_back_to_phy_then_ssid() {
        let devs = vec![
            dev("wlan0", "phy0", "managed", None),
            dev("x0wlan1", "phy1", "AP", Some("VR-NET")),
        ];
        let params = ProbeParams {
            target_phy: Some("phy1"),
            ssid: "VR-NET",
            expected_ap_ifname: None,
            conf_dir: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(pick_candidate(&devs, &params).unwrap().ifname, "x0wlan1");

        let params = ProbeParams {
            target_phy: None,
            ssid: "VR-NET",
            expected_ap_ifname: None,
            conf_dir: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(pick_candidate(&devs, &params).unwrap().ifname, "x0wlan1");
    }

    #[test]
    fn test_ssid_mismatch_rejected_but_missing_tolerated() {
        let advertised = dev("x0wlan1", "phy1", "AP", Some("OTHER"));
        assert!(!ssid_matches(&advertised, "VR-NET"));
        let silent = dev("x0wlan1", "phy1", "AP", None);
        assert!(ssid_matches(&silent, "VR-NET"));
    }
}
