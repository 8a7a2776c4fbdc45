//! vrhotspotd - VR hotspot daemon.
//!
//! Owns the lifecycle core and its cooperative periodic tasks. The HTTP
//! control plane runs as a separate collaborator and drives the core
//! through its operation surface.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vrhotspotd::{watchdog, Hotspot, HotspotPaths};

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hook();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vrhotspotd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("vrhotspotd v{}", env!("CARGO_PKG_VERSION"));

    let paths = HotspotPaths::system();
    for dir in [&paths.data_dir, &paths.run_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("failed to create {}: {}", dir.display(), e);
        }
    }

    let core = Hotspot::new(paths);

    // A previous daemon instance may have died mid-run; reconcile whatever
    // it left behind before accepting operations.
    let repaired = core.repair().await;
    info!(
        "startup reconcile: {}",
        repaired.result_code.as_str()
    );

    tokio::spawn(watchdog::run(Arc::clone(&core)));
    tokio::spawn(watchdog::run_telemetry(Arc::clone(&core)));

    if core.config().autostart {
        info!("autostart enabled, bringing the hotspot up");
        let result = core.start(None).await;
        info!("autostart: {}", result.result_code.as_str());
    }

    // The control plane owns request dispatch; the daemon core idles until
    // terminated, leaving the kernel clean on the way out.
    wait_for_shutdown().await;
    info!("shutdown signal received, stopping hotspot");
    let stopped = core.stop().await;
    info!("shutdown: {}", stopped.result_code.as_str());
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("SIGTERM handler failed ({}), falling back to ctrl-c", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

fn setup_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC in vrhotspotd at {location}: {panic_info}");
        default_hook(panic_info);
    }));
}
