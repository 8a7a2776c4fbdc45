//! Regulatory enforcement: an engine config carrying `ieee80211d=1` with no
//! usable country code is fatal, skips the fallback chain, and leaves no
//! engine process behind.

mod common;

use common::TestHost;
use serde_json::json;
use vrhotspot_shared::error::ResultCode;
use vrhotspot_shared::status::Phase;

#[tokio::test(flavor = "multi_thread")]
async fn invalid_country_for_80211d_is_fatal() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    host.seed_iw_dev("wlan53", "VR-NET");
    host.seed_phy_info(false);
    host.seed_reg("00");
    // The orchestrator writes ieee80211d=1 without a country code.
    host.seed_orchestrator_conf("x0wlan53", "VR-NET", None);
    let core = host.core();

    let patch = json!({
        "ssid": "VR-NET",
        "wpa2_passphrase": "correcthorse",
        "band_preference": "5ghz",
        "country": "",
        "ap_adapter_ifname": "wlan53",
        "ap_ready_timeout_s": 2.0,
    });
    core.save_config(patch.as_object().unwrap()).unwrap();

    let result = core.start(None).await;
    assert!(!result.ok);
    assert_eq!(
        result.result_code,
        ResultCode::HostapdInvalidCountryCodeFor80211d
    );
    assert_eq!(result.data.phase, Phase::Error);
    assert_eq!(
        result.data.last_error.as_deref(),
        Some("hostapd_invalid_country_code_for_80211d")
    );
    // The error carries operator remediation.
    let detail = result.data.last_error_detail.expect("error detail");
    assert!(detail.remediation.is_some());

    // The engine that was briefly spawned is gone.
    if let Some(pid) = result.data.engine.pid {
        let gone = common::wait_for(
            || !std::path::Path::new(&format!("/proc/{pid}")).exists(),
            std::time::Duration::from_secs(3),
        )
        .await;
        assert!(gone, "engine process survived the regulatory failure");
    }

    // Repair from the error state lands in Stopped.
    let repaired = core.repair().await;
    assert!(repaired.ok);
    assert_eq!(repaired.result_code, ResultCode::Repaired);
    assert_eq!(repaired.data.phase, Phase::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn valid_country_is_enforced_on_disk() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    host.seed_iw_dev("wlan54", "VR-NET");
    host.seed_phy_info(false);
    host.seed_reg("US");
    // Template starts with the world domain; the lifecycle must rewrite it
    // to the configured country before validation.
    host.seed_orchestrator_conf("x0wlan54", "VR-NET", Some("00"));
    let core = host.core();

    let patch = json!({
        "ssid": "VR-NET",
        "wpa2_passphrase": "correcthorse",
        "band_preference": "5ghz",
        "country": "DE",
        "ap_adapter_ifname": "wlan54",
        "ap_ready_timeout_s": 3.0,
    });
    core.save_config(patch.as_object().unwrap()).unwrap();

    let result = core.start(None).await;
    assert!(result.ok, "start failed: {:?}", result.data.last_error);
    assert_eq!(result.data.selected_country.as_deref(), Some("DE"));

    // The on-disk engine config now carries the enforced country.
    let engine_dir = host.paths.run_dir.join("engine");
    let mut enforced = false;
    for entry in std::fs::read_dir(&engine_dir).unwrap().flatten() {
        let conf = entry.path().join("hostapd.conf");
        if let Ok(text) = std::fs::read_to_string(conf) {
            if text.contains("country_code=DE") {
                enforced = true;
            }
            assert!(!text.contains("country_code=00"));
        }
    }
    assert!(enforced, "country_code=DE not found in engine config");

    core.stop().await;
}
