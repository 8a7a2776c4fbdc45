//! Watchdog and repair: engine death while Running is observed at the next
//! interval; a failing supervised restart lands in Error; repair returns
//! the machine to Stopped and cleans up runtime artifacts.

mod common;

use common::TestHost;
use serde_json::json;
use std::sync::Arc;
use vrhotspot_shared::error::ResultCode;
use vrhotspot_shared::status::Phase;
use vrhotspotd::watchdog;

#[tokio::test(flavor = "multi_thread")]
async fn watchdog_observes_death_then_repair_recovers() {
    let _env = common::ENV_LOCK.lock().await;
    let host = TestHost::new();
    host.seed_happy_5ghz("wlan55", "VR-NET");
    let core = host.core();

    let patch = json!({
        "ssid": "VR-NET",
        "wpa2_passphrase": "correcthorse",
        "band_preference": "5ghz",
        "country": "US",
        "ap_adapter_ifname": "wlan55",
        "ap_ready_timeout_s": 3.0,
        "watchdog_enable": true,
        "watchdog_interval_s": 0.5,
    });
    core.save_config(patch.as_object().unwrap()).unwrap();

    let started = core.start(None).await;
    assert!(started.ok, "start failed: {:?}", started.data.last_error);
    let engine_pid = started.data.engine.pid.expect("engine pid");

    tokio::spawn(watchdog::run(Arc::clone(&core)));

    // Make the supervised restart fail (the orchestrator binary vanishes),
    // then kill the engine externally.
    std::fs::remove_file(host.bin.join("lnxrouter")).unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(engine_pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    // The watchdog must observe the death, attempt the supervised restart
    // (which fails), and transition the machine to Error.
    let errored = common::wait_for(
        || {
            let st = core.get_status(false);
            st.last_op.as_deref() == Some("watchdog") && st.phase == Phase::Error
        },
        std::time::Duration::from_secs(15),
    )
    .await;
    let status = core.get_status(false);
    assert!(
        errored,
        "watchdog never reached Error: phase={:?} last_op={:?}",
        status.phase, status.last_op
    );
    assert!(
        status
            .warnings
            .iter()
            .any(|w| w.contains("watchdog")),
        "missing watchdog warning: {:?}",
        status.warnings
    );

    let repaired = core.repair().await;
    assert!(repaired.ok);
    assert_eq!(repaired.result_code, ResultCode::Repaired);
    assert_eq!(repaired.data.phase, Phase::Stopped);
    assert!(repaired.data.engine.pid.is_none());

    // Runtime config dirs are gone.
    let engine_dir = host.paths.run_dir.join("engine");
    let leftovers: Vec<_> = std::fs::read_dir(&engine_dir)
        .map(|it| it.flatten().collect())
        .unwrap_or_default();
    assert!(
        leftovers.is_empty(),
        "repair left engine config dirs behind"
    );

    // A stopped machine stays stoppable.
    let again = core.stop().await;
    assert_eq!(again.result_code, ResultCode::AlreadyStopped);
}
