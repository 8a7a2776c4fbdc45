//! Non-timeout failures at 6 GHz are terminal: only a readiness timeout may
//! step down to 5 GHz, so an engine crash on the 6 GHz attempt must end in
//! Error instead of silently landing on another band.

mod common;

use common::TestHost;
use serde_json::json;
use vrhotspot_shared::error::ResultCode;
use vrhotspot_shared::status::Phase;

#[tokio::test(flavor = "multi_thread")]
async fn engine_crash_at_6ghz_does_not_fall_back() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    host.seed_iw_dev("wlan60", "VR-NET");
    host.seed_phy_info(true);
    host.seed_reg("US");
    // The 6 GHz engine dies shortly after spawn rather than timing out.
    std::env::set_var("VRHS_6GHZ_CRASH", "1");
    let core = host.core();

    let patch = json!({
        "ssid": "VR-NET",
        "wpa2_passphrase": "correcthorse",
        "band_preference": "6ghz",
        "ap_security": "wpa3_sae",
        "country": "US",
        "ap_adapter_ifname": "wlan60",
        "ap_ready_timeout_s": 1.0,
    });
    core.save_config(patch.as_object().unwrap()).unwrap();

    let result = core.start(None).await;
    assert!(!result.ok);
    assert_eq!(result.result_code, ResultCode::StartFailed);
    assert_eq!(result.data.phase, Phase::Error);
    assert_eq!(
        result.data.last_error.as_deref(),
        Some("engine_crash_early")
    );
    assert!(
        result.data.fallback_reason.is_none(),
        "crash at 6 GHz must not set a fallback reason: {:?}",
        result.data.fallback_reason
    );
    // Exactly one attempt: the chain terminated instead of trying 5 GHz.
    let attempts: Vec<&String> = result
        .data
        .warnings
        .iter()
        .filter(|w| w.starts_with("attempt_failed:"))
        .collect();
    assert_eq!(attempts.len(), 1, "warnings: {:?}", result.data.warnings);
    assert!(attempts[0].contains("6ghz"));

    // Repair clears the error state.
    let repaired = core.repair().await;
    assert!(repaired.ok);
    assert_eq!(repaired.data.phase, Phase::Stopped);
}
