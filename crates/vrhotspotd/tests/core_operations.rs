//! Core operation surface: config round-trips through the store, invalid
//! patches are rejected with the full error list, and start failures from
//! missing capabilities are typed.

mod common;

use common::TestHost;
use serde_json::json;
use vrhotspot_shared::error::ResultCode;
use vrhotspot_shared::status::Phase;

#[tokio::test(flavor = "multi_thread")]
async fn config_round_trip_is_identity() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    let core = host.core();

    // Defaults load cleanly when nothing is persisted yet.
    let initial = core.get_config();
    assert!(!initial.wpa2_passphrase_set);
    assert!(initial.config.validate().is_empty());

    let patch = json!({
        "ssid": "VR-NET",
        "channel_2g_fallback": 11,
        "dhcp_dns": ["1.1.1.1", "8.8.8.8"],
    });
    core.save_config(patch.as_object().unwrap()).unwrap();

    // Save then load is identity (plus defaults injection).
    let loaded = core.get_config().config;
    assert_eq!(loaded.ssid, "VR-NET");
    assert_eq!(loaded.channel_2g_fallback, 11);
    assert!(loaded.validate().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_patch_returns_every_violation() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    let core = host.core();

    let patch = json!({
        "ssid": "",
        "channel_2g_fallback": 15,
        "country": "usa",
    });
    let errors = core.save_config(patch.as_object().unwrap()).unwrap_err();
    let codes: Vec<&str> = errors.iter().map(|e| e.code.as_str()).collect();
    assert!(codes.contains(&"ssid_length_1_32"));
    assert!(codes.contains(&"channel_2g_range_1_14"));
    assert!(codes.contains(&"country_two_uppercase_letters"));

    // Nothing was persisted.
    assert!(!host.paths.data_dir.join("config.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_with_no_adapters_is_typed_failure() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    host.write_state("iw_dev.txt", "");
    host.seed_reg("US");
    let core = host.core();

    let patch = json!({
        "wpa2_passphrase": "correcthorse",
        "band_preference": "5ghz",
    });
    core.save_config(patch.as_object().unwrap()).unwrap();

    let result = core.start(None).await;
    assert!(!result.ok);
    assert_eq!(result.result_code, ResultCode::StartFailed);
    assert_eq!(result.data.phase, Phase::Error);
    assert_eq!(
        result.data.last_error.as_deref(),
        Some("adapter_no_ap_mode")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn start_with_invalid_override_is_config_invalid() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    host.seed_happy_5ghz("wlan58", "VR-NET");
    let core = host.core();

    let patch = json!({"wpa2_passphrase": "correcthorse"});
    core.save_config(patch.as_object().unwrap()).unwrap();

    let overrides = json!({"channel_2g_fallback": 15});
    let result = core.start(Some(overrides.as_object().unwrap().clone())).await;
    assert!(!result.ok);
    assert_eq!(result.result_code, ResultCode::ConfigInvalid);
    assert_eq!(result.data.phase, Phase::Error);

    // The bad override never reached the store.
    assert_eq!(core.get_config().config.channel_2g_fallback, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_engine_binary_is_fatal_without_retries() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    host.seed_happy_5ghz("wlan59", "VR-NET");
    std::fs::remove_file(host.bin.join("lnxrouter")).unwrap();
    let core = host.core();

    let patch = json!({
        "wpa2_passphrase": "correcthorse",
        "band_preference": "5ghz",
        "country": "US",
        "ap_adapter_ifname": "wlan59",
    });
    core.save_config(patch.as_object().unwrap()).unwrap();

    let result = core.start(None).await;
    assert!(!result.ok);
    assert_eq!(result.result_code, ResultCode::MissingBinary);
    assert_eq!(result.data.phase, Phase::Error);
    // Exactly one attempt: a missing binary skips the fallback chain.
    let attempts = result
        .data
        .warnings
        .iter()
        .filter(|w| w.starts_with("attempt_failed:"))
        .count();
    assert_eq!(attempts, 1, "warnings: {:?}", result.data.warnings);
}
