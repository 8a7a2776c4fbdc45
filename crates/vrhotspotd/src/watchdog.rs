//! Watchdog: observes engine death while Running and drives a supervised
//! restart on the last effective plan.
//!
//! Repeated restart failures back off exponentially (base = the watchdog
//! interval, capped at 30 s); a successful restart resets the backoff. The
//! task is cooperative and never holds the lifecycle lock between ticks.

use crate::lifecycle::Hotspot;
use crate::telemetry::TelemetrySampler;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cap on the supervised-restart backoff.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

fn interval_of(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.5))
}

/// Run the watchdog until the daemon exits.
pub async fn run(core: Arc<Hotspot>) {
    let mut backoff = Duration::from_secs(2);
    let mut next_restart: Option<Instant> = None;

    loop {
        let cfg = core.config();
        let interval = interval_of(cfg.watchdog_interval_s);
        tokio::time::sleep(interval).await;

        if !cfg.watchdog_enable {
            continue;
        }
        if !core.is_phase_running() {
            backoff = interval.max(Duration::from_secs(2));
            next_restart = None;
            continue;
        }
        if core.engine_alive() {
            backoff = interval.max(Duration::from_secs(2));
            next_restart = None;
            continue;
        }

        if let Some(at) = next_restart {
            if Instant::now() < at {
                debug!("watchdog restart deferred by backoff");
                continue;
            }
        }

        warn!("watchdog: engine is not alive");
        let ok = core.supervised_restart().await;
        if ok {
            backoff = interval.max(Duration::from_secs(2));
            next_restart = None;
        } else {
            let delay = backoff.min(BACKOFF_MAX);
            next_restart = Some(Instant::now() + delay);
            backoff = (backoff * 2).min(BACKOFF_MAX);
            warn!(
                "watchdog: supervised restart failed, next attempt in {:?}",
                delay
            );
        }
    }
}

/// Run the telemetry sampler until the daemon exits.
pub async fn run_telemetry(core: Arc<Hotspot>) {
    let mut sampler = TelemetrySampler::new();
    loop {
        let cfg = core.config();
        let interval = interval_of(cfg.telemetry_interval_s);
        tokio::time::sleep(interval).await;
        core.telemetry_tick(&mut sampler).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_floor() {
        assert_eq!(interval_of(0.1), Duration::from_secs_f64(0.5));
        assert_eq!(interval_of(2.0), Duration::from_secs(2));
    }
}
