//! The hotspot lifecycle state machine.
//!
//! One owned [`Hotspot`] value composes every lower component under a single
//! serialization lock: start, stop, repair and restart never overlap, status
//! reads observe an atomically published snapshot, and every exit path
//! leaves kernel network state clean by draining the revert ledger.

use crate::engine::cmd::{self, Band, EffectivePlan};
use crate::engine::conf;
use crate::engine::supervisor::EngineHandle;
use crate::engine::BackendKind;
use crate::firewall::{self, Profile};
use crate::inventory;
use crate::ledger::{RevertAction, RevertLedger};
use crate::nat_accel;
use crate::platform::{iw, net, PlatformFacts};
use crate::qos;
use crate::readiness::{self, ProbeOutcome, ProbeParams, ReadyInfo};
use crate::telemetry::TelemetrySampler;
use crate::tuner;
use crate::channel as channel_scan;
use serde_json::{Map, Value};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use vrhotspot_shared::adapters::{Adapter, AdapterInventory};
use vrhotspot_shared::config::{ApSecurity, BandPreference, Config, ConfigView, FieldError};
use vrhotspot_shared::error::{ErrorKind, LifecycleError, ResultCode};
use vrhotspot_shared::status::{HotspotMode, LifecycleResult, Phase, PreflightReport, Status};
use vrhotspot_shared::store::{ConfigStore, PassphraseStore, StatusStore, TokenStore};

/// Grace given to the engine group on stop.
const ENGINE_STOP_GRACE: Duration = Duration::from_secs(3);

/// Spawn early-fail window: exits inside it abort the attempt immediately.
const EARLY_FAIL_WINDOW: Duration = Duration::from_secs(1);

/// Hard bound on backend attempts within one start call.
const MAX_START_ATTEMPTS: u32 = 3;

/// Auto-provisioned passphrases are reused for this long across retries.
const AUTOGEN_PASSPHRASE_TTL: Duration = Duration::from_secs(300);

/// Where the daemon keeps its stores.
#[derive(Debug, Clone)]
pub struct HotspotPaths {
    pub data_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl HotspotPaths {
    pub fn system() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/vr-hotspot"),
            run_dir: PathBuf::from("/run/vr-hotspot"),
        }
    }

    /// Everything under one base directory; used by tests.
    pub fn under(base: &Path) -> Self {
        Self {
            data_dir: base.join("data"),
            run_dir: base.join("run"),
        }
    }
}

/// Band/channel/virt settings of one attempt; the rest of the plan derives
/// from config and platform facts.
#[derive(Debug, Clone, Copy)]
struct AttemptSettings {
    band: Band,
    channel: Option<u16>,
    no_virt: bool,
    auto_select: bool,
}

/// State owned by the lifecycle worker, guarded by the serialization lock.
struct Worker {
    ledger: RevertLedger,
    last_plan: Option<EffectivePlan>,
}

/// The lifecycle core. One per daemon; tests build several against
/// independent temp dirs.
pub struct Hotspot {
    paths: HotspotPaths,
    config_store: ConfigStore,
    passphrase_store: PassphraseStore,
    token_store: TokenStore,
    status_store: StatusStore,

    status: StdMutex<Status>,
    worker: AsyncMutex<Worker>,
    engine: StdMutex<Option<Arc<EngineHandle>>>,

    /// Raised while a stop is pending so a running readiness probe shortens.
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,

    autogen_passphrase: StdMutex<Option<(String, Instant)>>,
}

impl Hotspot {
    pub fn new(paths: HotspotPaths) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let core = Self {
            config_store: ConfigStore::new(&paths.data_dir),
            passphrase_store: PassphraseStore::new(&paths.data_dir),
            token_store: TokenStore::new(&paths.data_dir),
            status_store: StatusStore::new(&paths.run_dir),
            status: StdMutex::new(Status::default()),
            worker: AsyncMutex::new(Worker {
                ledger: RevertLedger::new(),
                last_plan: None,
            }),
            engine: StdMutex::new(None),
            cancel_tx,
            cancel_rx,
            autogen_passphrase: StdMutex::new(None),
            paths,
        };
        Arc::new(core)
    }

    pub fn paths(&self) -> &HotspotPaths {
        &self.paths
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.token_store
    }

    // -----------------------------------------------------------------
    // Status publication
    // -----------------------------------------------------------------

    fn update_status(&self, f: impl FnOnce(&mut Status)) {
        let mut st = self.status.lock().expect("status lock");
        f(&mut st);
        if let Err(e) = self.status_store.save(&st) {
            warn!("status persist failed: {}", e);
        }
    }

    fn engine_snapshot(&self) -> Option<Arc<EngineHandle>> {
        self.engine.lock().expect("engine lock").clone()
    }

    fn set_engine(&self, handle: Option<Arc<EngineHandle>>) {
        *self.engine.lock().expect("engine lock") = handle;
    }

    /// Published snapshot for the control plane. A snapshot that still
    /// claims `running` against a dead engine is reconciled in the returned
    /// copy; the stored phase is the watchdog's to transition.
    pub fn get_status(&self, include_logs: bool) -> Status {
        let engine = self.engine_snapshot();
        let mut st = self.status.lock().expect("status lock");

        if let Some(handle) = &engine {
            let (stdout, stderr) = handle.tail_logs();
            st.engine.stdout_tail = stdout;
            st.engine.stderr_tail = stderr;
        }

        let mut view = st.view(include_logs);
        let engine_alive = engine.as_ref().map(|h| h.is_alive()).unwrap_or(false);
        if view.running && !engine_alive {
            view.set_phase(Phase::Error);
            view.last_error = Some("engine_not_running_state_reconciled".to_string());
        }
        view
    }

    pub fn is_phase_running(&self) -> bool {
        self.status.lock().expect("status lock").phase == Phase::Running
    }

    pub fn engine_alive(&self) -> bool {
        self.engine_snapshot().map(|h| h.is_alive()).unwrap_or(false)
    }

    // -----------------------------------------------------------------
    // Configuration surface
    // -----------------------------------------------------------------

    pub fn config(&self) -> Config {
        self.config_store.load()
    }

    pub fn get_config(&self) -> ConfigView {
        let cfg = self.config_store.load();
        let passphrase = self.passphrase_store.get();
        ConfigView::new(cfg, passphrase.as_deref())
    }

    /// Merge a patch over the stored record. The passphrase key routes to
    /// the side-store and never enters the config file.
    pub fn save_config(&self, patch: &Map<String, Value>) -> Result<ConfigView, Vec<FieldError>> {
        if let Some(Value::String(passphrase)) = patch.get("wpa2_passphrase") {
            self.passphrase_store.set(passphrase).map_err(|e| vec![e])?;
        }
        let cfg = self.config_store.save_patch(patch)?;
        let passphrase = self.passphrase_store.get();
        Ok(ConfigView::new(cfg, passphrase.as_deref()))
    }

    /// Reveal the stored passphrase; requires an explicit confirmation flag.
    pub fn reveal_passphrase(&self, confirm: bool) -> Result<String, LifecycleError> {
        if !confirm {
            return Err(LifecycleError::new(ErrorKind::ConfirmationRequired));
        }
        self.passphrase_store
            .get()
            .ok_or_else(|| LifecycleError::new(ErrorKind::PassphraseNotSet))
    }

    pub async fn list_adapters(&self) -> AdapterInventory {
        inventory::snapshot().await
    }

    fn effective_passphrase(
        &self,
        overrides: Option<&Map<String, Value>>,
        warnings: &mut Vec<String>,
    ) -> Result<String, LifecycleError> {
        if let Some(Value::String(p)) = overrides.and_then(|o| o.get("wpa2_passphrase")) {
            if vrhotspot_shared::config::validate_passphrase(p).is_some() {
                return Err(LifecycleError::new(ErrorKind::PassphraseInvalidLength));
            }
            return Ok(p.clone());
        }
        if let Some(p) = self.passphrase_store.get() {
            return Ok(p);
        }

        // Fresh installs have no passphrase; provision one rather than
        // refusing to start, and reuse it across quick retries.
        {
            let cache = self.autogen_passphrase.lock().expect("autogen lock");
            if let Some((p, at)) = cache.as_ref() {
                if at.elapsed() <= AUTOGEN_PASSPHRASE_TTL {
                    warnings.push("auto_generated_passphrase".to_string());
                    return Ok(p.clone());
                }
            }
        }
        let generated = self
            .passphrase_store
            .provision()
            .map_err(|e| LifecycleError::new(ErrorKind::PassphraseInvalidLength).with_detail(e.code))?;
        *self.autogen_passphrase.lock().expect("autogen lock") =
            Some((generated.clone(), Instant::now()));
        warnings.push("auto_generated_passphrase".to_string());
        warn!("no passphrase set, auto-provisioned one");
        Ok(generated)
    }

    // -----------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------

    fn correlation_id(op: &str) -> String {
        format!("{op}-{}", uuid::Uuid::new_v4().simple())
    }

    fn result(&self, code: ResultCode, cid: &str) -> LifecycleResult {
        LifecycleResult::new(code, cid, self.get_status(false))
    }

    /// Start the hotspot. A concurrent lifecycle operation yields
    /// `lifecycle_busy` without touching host state.
    pub async fn start(&self, overrides: Option<Map<String, Value>>) -> LifecycleResult {
        let cid = Self::correlation_id("start");
        let Ok(mut worker) = self.worker.try_lock() else {
            return self.result(ResultCode::LifecycleBusy, &cid);
        };
        self.start_locked(&mut worker, &cid, overrides.as_ref()).await
    }

    /// Stop the hotspot. Waits for an in-flight start to reach a terminal
    /// state; the pending-stop flag shortens its readiness probe.
    pub async fn stop(&self) -> LifecycleResult {
        let cid = Self::correlation_id("stop");
        let _ = self.cancel_tx.send(true);
        let mut worker = self.worker.lock().await;
        let _ = self.cancel_tx.send(false);
        self.stop_locked(&mut worker, &cid, false).await
    }

    /// Stop from any state plus deep cleanup of strays and artifacts.
    pub async fn repair(&self) -> LifecycleResult {
        let cid = Self::correlation_id("repair");
        let _ = self.cancel_tx.send(true);
        let mut worker = self.worker.lock().await;
        let _ = self.cancel_tx.send(false);
        self.stop_locked(&mut worker, &cid, true).await
    }

    /// `stop` then `start` under one continuous serialization window.
    pub async fn restart(&self) -> LifecycleResult {
        let cid = Self::correlation_id("restart");
        let _ = self.cancel_tx.send(true);
        let mut worker = self.worker.lock().await;
        let _ = self.cancel_tx.send(false);
        let stop_result = self.stop_locked(&mut worker, &cid, false).await;
        if !matches!(
            stop_result.result_code,
            ResultCode::Stopped | ResultCode::AlreadyStopped
        ) {
            return stop_result;
        }
        self.start_locked(&mut worker, &cid, None).await
    }

    async fn fail_start(
        &self,
        worker: &mut Worker,
        cid: &str,
        err: LifecycleError,
        mut warnings: Vec<String>,
    ) -> LifecycleResult {
        if let Some(handle) = self.engine_snapshot() {
            handle.stop(ENGINE_STOP_GRACE).await;
        }
        self.set_engine(None);
        warnings.extend(worker.ledger.drain().await);

        let code = ResultCode::from_error(err.kind);
        self.update_status(|st| {
            st.set_phase(Phase::Error);
            st.last_error = Some(err.kind.as_str().to_string());
            st.last_error_detail = Some(err.to_detail());
            st.warnings.extend(warnings);
            st.record_op("start", cid);
        });
        error!("start failed: {}", err);
        self.result(code, cid)
    }

    async fn start_locked(
        &self,
        worker: &mut Worker,
        cid: &str,
        overrides: Option<&Map<String, Value>>,
    ) -> LifecycleResult {
        {
            let st = self.status.lock().expect("status lock");
            if st.phase == Phase::Running && self.engine_alive() {
                drop(st);
                info!("start requested while running");
                return self.result(ResultCode::AlreadyRunning, cid);
            }
        }

        self.update_status(|st| {
            st.set_phase(Phase::Starting);
            st.record_op("start", cid);
            st.warnings.clear();
            st.last_error = None;
            st.last_error_detail = None;
            st.fallback_reason = None;
            st.telemetry = None;
        });

        let mut warnings: Vec<String> = Vec::new();

        let base_cfg = self.config_store.load();
        let mut cfg = match merge_overrides(&base_cfg, overrides) {
            Ok(cfg) => cfg,
            Err(errors) => {
                let err = LifecycleError::new(ErrorKind::ConfigInvalid)
                    .with_detail(field_errors_to_string(&errors));
                return self.fail_start(worker, cid, err, warnings).await;
            }
        };

        let validation = cfg.validate();
        if !validation.is_empty() {
            let err = LifecycleError::new(ErrorKind::ConfigInvalid)
                .with_detail(field_errors_to_string(&validation));
            return self.fail_start(worker, cid, err, warnings).await;
        }

        let facts = PlatformFacts::gather().await;
        warnings.extend(facts.apply_overrides(&mut cfg));
        self.update_status(|st| st.platform = facts.to_status());

        let passphrase = match self.effective_passphrase(overrides, &mut warnings) {
            Ok(p) => p,
            Err(err) => return self.fail_start(worker, cid, err, warnings).await,
        };

        let inventory = inventory::snapshot().await;
        warnings.extend(inventory.warnings.iter().cloned());
        let adapter = match inventory::select_for(
            &inventory,
            cfg.band_preference,
            cfg.ap_adapter_ifname.as_deref(),
        ) {
            Ok(adapter) => adapter,
            Err(err) => return self.fail_start(worker, cid, err, warnings).await,
        };
        info!(
            adapter = %adapter.ifname,
            band = cfg.band_preference.as_str(),
            "adapter selected"
        );

        let band = match resolve_band(cfg.band_preference, &adapter) {
            Ok(band) => band,
            Err(err) => return self.fail_start(worker, cid, err, warnings).await,
        };

        // 6 GHz only runs WPA3-SAE, whatever the stored security says.
        if band == Band::G6 && cfg.ap_security != ApSecurity::Wpa3Sae {
            cfg.ap_security = ApSecurity::Wpa3Sae;
            warnings.push("wpa3_sae_forced_for_6ghz".to_string());
        }

        // Pre-start interface preparation; all best-effort.
        let mut preflight = PreflightReport::default();
        net::rfkill_unblock_wifi().await;
        let removed = net::cleanup_p2p_dev_ifaces(&adapter.ifname).await;
        if !removed.is_empty() {
            preflight
                .warnings
                .push(format!("removed_p2p_dev_ifaces:{}", removed.join(",")));
        }
        if !net::bring_iface_up(&adapter.ifname).await {
            preflight
                .warnings
                .push("ap_iface_not_up_prestart".to_string());
        }
        if adapter.regdom.country == "00" || adapter.regdom.country == "unknown" {
            preflight
                .warnings
                .push("regdom_global_or_unknown".to_string());
        }
        warnings.extend(preflight.warnings.iter().cloned());
        self.update_status(|st| st.preflight = preflight);

        if let Some(cc) = cfg.country_code() {
            let _ = iw::reg_set(cc).await;
        }

        let uplink = match cfg.bridge_uplink_ifname.clone() {
            Some(u) if !u.is_empty() => Some(u),
            _ => net::default_uplink().await,
        };

        let mut settings = AttemptSettings {
            band,
            channel: None,
            no_virt: cfg.optimized_no_virt,
            auto_select: cfg.channel_auto_select,
        };
        let mut no_virt_flip_done = settings.no_virt;
        let mut fallback_reason: Option<String> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let plan = self
                .build_plan(&cfg, &facts, &adapter, &settings, &passphrase, uplink.as_deref())
                .await;

            info!(
                attempt,
                band = plan.band.as_str(),
                backend = plan.backend.as_str(),
                channel = ?plan.channel,
                no_virt = plan.no_virt,
                "start attempt"
            );

            let ctx = AttemptCtx {
                cfg: &cfg,
                facts: &facts,
                adapter_phy: adapter.phy.clone(),
                cid,
            };
            match self.run_attempt(worker, &ctx, &plan, &mut warnings).await {
                Ok(ready) => {
                    let code = if attempt > 1 {
                        ResultCode::StartedWithFallback
                    } else {
                        ResultCode::Started
                    };
                    self.publish_running(&plan, &adapter, &ready, fallback_reason.clone(), &warnings, cid);
                    worker.last_plan = Some(plan);
                    return self.result(code, cid);
                }
                Err(err) => {
                    warnings.push(format!(
                        "attempt_failed:{}:{}",
                        plan.band.as_str(),
                        err.kind.as_str()
                    ));
                    // Roll back this attempt completely before deciding.
                    warnings.extend(worker.ledger.drain().await);

                    if *self.cancel_rx.borrow() {
                        // A stop is pending: abort cleanly instead of
                        // burning the remaining fallback attempts.
                        warnings.push("start_aborted_by_pending_stop".to_string());
                        self.update_status(|st| {
                            st.set_phase(Phase::Stopped);
                            st.clear_run_details();
                            st.warnings.extend(warnings.clone());
                            st.record_op("start", cid);
                        });
                        return self.result(ResultCode::StartFailed, cid);
                    }

                    if attempt >= MAX_START_ATTEMPTS {
                        return self.fail_start(worker, cid, err, warnings).await;
                    }
                    match plan_fallback(&settings, err.kind, &cfg, no_virt_flip_done) {
                        Some((next, reason, warning)) => {
                            warnings.push(warning);
                            if next.no_virt != settings.no_virt {
                                no_virt_flip_done = true;
                            }
                            fallback_reason = Some(reason);
                            settings = next;
                        }
                        None => {
                            return self.fail_start(worker, cid, err, warnings).await;
                        }
                    }
                }
            }
        }
    }

    async fn build_plan(
        &self,
        cfg: &Config,
        facts: &PlatformFacts,
        adapter: &Adapter,
        settings: &AttemptSettings,
        passphrase: &str,
        uplink: Option<&str>,
    ) -> EffectivePlan {
        let backend = if cfg.bridge_mode {
            BackendKind::Bridge
        } else if settings.band == Band::G6
            || cfg.ap_security == ApSecurity::Wpa3Sae
            || facts.prefer_direct_backend()
        {
            BackendKind::Direct
        } else {
            BackendKind::Orchestrator
        };

        let channel = self.resolve_channel(cfg, adapter, settings).await;

        let security = if settings.band == Band::G6 {
            ApSecurity::Wpa3Sae
        } else {
            cfg.ap_security
        };

        EffectivePlan {
            backend,
            band: settings.band,
            ssid: cfg.ssid.clone(),
            passphrase: passphrase.to_string(),
            security,
            country: cfg.country_code().map(str::to_string),
            channel,
            width: cfg.channel_width,
            beacon_interval_ms: cfg.beacon_interval_ms,
            dtim_period: cfg.dtim_period,
            short_guard_interval: cfg.short_guard_interval,
            tx_power_dbm: cfg.tx_power_dbm,
            wifi6: adapter.supports_80211ax,
            adapter_ifname: adapter.ifname.clone(),
            no_virt: settings.no_virt,
            gateway_ip: cfg.lan_gateway_ip,
            dhcp_start_ip: cfg.dhcp_start_ip,
            dhcp_end_ip: cfg.dhcp_end_ip,
            dns_offer: cfg.dhcp_dns.offer(cfg.lan_gateway_ip),
            enable_internet: cfg.enable_internet && !cfg.bridge_mode,
            bridge_name: cfg.bridge_name.clone(),
            bridge_uplink: uplink.map(str::to_string),
            ctrl_dir: self.paths.run_dir.join("hostapd"),
        }
    }

    async fn resolve_channel(
        &self,
        cfg: &Config,
        adapter: &Adapter,
        settings: &AttemptSettings,
    ) -> Option<u16> {
        if let Some(channel) = settings.channel {
            return Some(channel);
        }
        let configured = match settings.band {
            Band::G24 => Some(cfg.channel_2g_clamped() as u16),
            Band::G5 => cfg.channel_5g,
            Band::G6 => cfg.channel_6g,
        };
        if configured.is_some() {
            return configured;
        }
        if settings.auto_select {
            let picked = channel_scan::select_best_channel(
                &adapter.ifname,
                settings.band.as_str(),
                None,
            )
            .await;
            if let Some(ch) = picked {
                // Remember the pick so subsequent starts skip the scan.
                let key = match settings.band {
                    Band::G24 => "channel_2g_fallback",
                    Band::G5 => "channel_5g",
                    Band::G6 => "channel_6g",
                };
                let mut patch = Map::new();
                patch.insert(key.to_string(), Value::from(ch));
                if let Err(e) = self.config_store.save_patch(&patch) {
                    warn!("channel persist failed: {:?}", e);
                }
                return Some(ch);
            }
        }
        match settings.band {
            Band::G6 => Some(1),
            _ => None,
        }
    }

    /// One backend attempt: tune, reconcile firewall, spawn, enforce
    /// country, await readiness, apply runtime knobs. On error the caller
    /// drains the ledger.
    async fn run_attempt(
        &self,
        worker: &mut Worker,
        ctx: &AttemptCtx<'_>,
        plan: &EffectivePlan,
        warnings: &mut Vec<String>,
    ) -> Result<ReadyInfo, LifecycleError> {
        warnings.extend(tuner::apply_pre(ctx.cfg, &mut worker.ledger));

        if ctx.cfg.firewall_enabled {
            let choice = firewall::choose_backend(
                ctx.facts,
                plan.backend == BackendKind::Direct && plan.band == Band::G6,
            );
            let nat_wanted = plan.enable_internet;
            let profile = Profile {
                ap_ifname: plan
                    .expected_ap_ifname()
                    .unwrap_or_else(|| plan.adapter_ifname.clone()),
                lan_cidr: lan_cidr(plan.gateway_ip),
                uplink_ifname: plan.bridge_uplink.clone(),
                masquerade: nat_wanted && ctx.cfg.firewall_enable_masquerade,
                forward: nat_wanted && ctx.cfg.firewall_enable_forward,
                zone: Some(ctx.cfg.firewall_zone.clone()),
            };
            let token = firewall::apply(choice, &profile).await?;
            if !token.is_noop() {
                worker.ledger.push(RevertAction::Firewall(token));
            }
        }

        if plan.backend == BackendKind::Bridge {
            let bridge = plan
                .bridge_name
                .clone()
                .unwrap_or_else(|| "br-vr".to_string());
            if net::ensure_bridge(&bridge).await {
                worker.ledger.push(RevertAction::RemoveBridge(bridge.clone()));
            }
            if let Some(uplink) = plan.bridge_uplink.as_deref() {
                let out = net::bridge_attach(&bridge, uplink).await;
                if out.ok() {
                    worker.ledger.push(RevertAction::BridgeDetach {
                        ifname: uplink.to_string(),
                    });
                } else {
                    warnings.push(format!("bridge_attach_failed:{uplink}"));
                }
            }
        }

        let spec = match plan.backend {
            BackendKind::Orchestrator => cmd::build_orchestrator(plan)?,
            BackendKind::Direct => {
                let conf_dir = self.new_engine_conf_dir(&plan.adapter_ifname);
                cmd::build_direct(plan, &conf_dir)?
            }
            BackendKind::Bridge => {
                let conf_dir = self.new_engine_conf_dir(&plan.adapter_ifname);
                cmd::build_bridge(plan, &conf_dir)?
            }
        };

        let handle = Arc::new(
            EngineHandle::spawn(&spec)
                .map_err(|e| LifecycleError::new(e.kind).with_detail(e.detail))?,
        );
        self.set_engine(Some(Arc::clone(&handle)));
        self.update_status(|st| {
            st.adapter = Some(plan.adapter_ifname.clone());
            st.engine.pid = Some(handle.pid());
            st.engine.cmd = Some(handle.redacted_cmd());
            st.engine.started_ts = Some(handle.started_ts());
            st.engine.last_exit_code = None;
            st.engine.last_error = None;
            st.engine.ap_logs_tail = Vec::new();
        });

        if let Some(class) = handle.wait_early(EARLY_FAIL_WINDOW).await {
            let err = LifecycleError::new(class.error_kind())
                .with_detail(format!("engine exited early ({})", class.as_str()));
            self.capture_failure_logs(&handle, None);
            self.teardown_attempt(&handle, &plan.adapter_ifname).await;
            return Err(err);
        }

        // Discover the runtime config dir, ensure the control-interface
        // directory, and enforce the regulatory country on disk.
        let roots = conf::candidate_roots(&self.paths.run_dir);
        let conf_dir = conf::discover(&handle, &roots, Some(&plan.adapter_ifname)).await;
        if let Some(dir) = &conf_dir {
            if let Some((conf_path, mut parsed)) = conf::load_hostapd_conf(dir) {
                conf::ensure_ctrl_interface_dir(&parsed);
                if let Some(cc) = plan.country.as_deref() {
                    match conf::enforce_country(&conf_path, cc) {
                        Ok(true) => {
                            if let Some((_, reloaded)) = conf::load_hostapd_conf(dir) {
                                parsed = reloaded;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warnings.push(format!("country_enforce_failed:{e}")),
                    }
                }
                if !conf::country_valid_for_80211d(&parsed) {
                    self.teardown_attempt(&handle, &plan.adapter_ifname).await;
                    return Err(LifecycleError::new(
                        ErrorKind::HostapdInvalidCountryCodeFor80211d,
                    ));
                }
            }
        }

        let timeout = Duration::from_secs_f64(ctx.cfg.ap_ready_timeout_clamped());
        let params = ProbeParams {
            target_phy: ctx.adapter_phy.as_deref(),
            ssid: &plan.ssid,
            expected_ap_ifname: spec.expected_ap_ifname.as_deref(),
            conf_dir: conf_dir.as_deref(),
            timeout,
        };
        let (outcome, ready) = readiness::await_ready(&handle, params, &self.cancel_rx).await;
        match outcome {
            ProbeOutcome::Ready => {}
            ProbeOutcome::EngineExited => {
                let kind = handle
                    .exit_reason()
                    .map(|c| c.error_kind())
                    .unwrap_or(ErrorKind::EngineCrashEarly);
                self.capture_failure_logs(&handle, conf_dir.as_deref());
                self.teardown_attempt(&handle, &plan.adapter_ifname).await;
                return Err(LifecycleError::new(kind));
            }
            ProbeOutcome::TimedOut | ProbeOutcome::Cancelled => {
                self.capture_failure_logs(&handle, conf_dir.as_deref());
                self.teardown_attempt(&handle, &plan.adapter_ifname).await;
                return Err(LifecycleError::new(ErrorKind::ApReadyTimeout));
            }
        }
        let ready = ready.unwrap_or_default();

        // Runtime knobs against the live AP interface.
        warnings.extend(
            tuner::apply_runtime(
                ctx.cfg,
                &ready.ifname,
                &plan.adapter_ifname,
                &[handle.pid()],
                &mut worker.ledger,
            )
            .await,
        );

        let zone_active = ctx.facts.firewall.zone_manager_active();
        let (qos_state, qos_warnings) =
            qos::apply(ctx.cfg.qos_preset, &ready.ifname, zone_active).await;
        warnings.extend(qos_warnings);
        if let Some(state) = qos_state {
            worker.ledger.push(RevertAction::Qos(state));
        }

        let (nat_state, nat_warnings) = nat_accel::apply(
            ctx.cfg.nat_accel,
            ctx.cfg.bridge_mode,
            plan.enable_internet,
            zone_active,
            &ready.ifname,
            plan.bridge_uplink.as_deref(),
        )
        .await;
        warnings.extend(nat_warnings);
        if let Some(state) = nat_state {
            worker.ledger.push(RevertAction::NatAccel(state));
        }

        Ok(ready)
    }

    fn new_engine_conf_dir(&self, adapter_ifname: &str) -> PathBuf {
        self.paths.run_dir.join("engine").join(format!(
            "hostapd.{adapter_ifname}.conf.{}",
            vrhotspot_shared::now_epoch()
        ))
    }

    fn capture_failure_logs(&self, handle: &EngineHandle, conf_dir: Option<&Path>) {
        let (stdout, stderr) = handle.tail_logs();
        let ap_logs = conf_dir
            .map(|dir| conf::collect_ap_logs(dir, 200))
            .unwrap_or_default();
        self.update_status(|st| {
            st.engine.stdout_tail = stdout;
            st.engine.stderr_tail = stderr;
            st.engine.last_exit_code = handle.last_exit_code();
            if !ap_logs.is_empty() {
                st.engine.ap_logs_tail = ap_logs;
            }
        });
    }

    async fn teardown_attempt(&self, handle: &EngineHandle, adapter_ifname: &str) {
        handle.stop(ENGINE_STOP_GRACE).await;
        self.set_engine(None);
        let roots = conf::candidate_roots(&self.paths.run_dir);
        conf::remove_conf_dirs(&roots, Some(adapter_ifname));
    }

    fn publish_running(
        &self,
        plan: &EffectivePlan,
        adapter: &Adapter,
        ready: &ReadyInfo,
        fallback_reason: Option<String>,
        warnings: &[String],
        cid: &str,
    ) {
        let detected_band = ready
            .freq_mhz
            .and_then(iw::band_from_freq_mhz)
            .unwrap_or(plan.band.as_str());
        let width = ready.width_mhz.or(plan.width.mhz()).or(match plan.band {
            Band::G5 => Some(80),
            _ => Some(20),
        });
        let mode = if plan.backend == BackendKind::Bridge {
            HotspotMode::Bridge
        } else {
            HotspotMode::Nat
        };

        self.update_status(|st| {
            st.set_phase(Phase::Running);
            st.adapter = Some(adapter.ifname.clone());
            st.ap_interface = Some(ready.ifname.clone());
            st.band = Some(detected_band.to_string());
            st.mode = Some(mode);
            st.channel_width_mhz = width;
            st.selected_band = Some(detected_band.to_string());
            st.selected_width_mhz = width;
            st.selected_channel = ready.channel.or(plan.channel);
            st.selected_country = plan.country.clone();
            st.fallback_reason = fallback_reason;
            st.warnings = warnings.to_vec();
            st.last_error = None;
            st.last_error_detail = None;
            st.record_op("start", cid);
        });
        info!(
            ap_interface = %ready.ifname,
            band = detected_band,
            "hotspot running"
        );
    }

    async fn stop_locked(&self, worker: &mut Worker, cid: &str, repair: bool) -> LifecycleResult {
        let engine = {
            let mut guard = self.engine.lock().expect("engine lock");
            guard.take()
        };

        let already_stopped = {
            let st = self.status.lock().expect("status lock");
            st.phase == Phase::Stopped
        };
        if already_stopped && engine.is_none() && worker.ledger.is_empty() && !repair {
            return self.result(ResultCode::AlreadyStopped, cid);
        }

        let op = if repair { "repair" } else { "stop" };
        self.update_status(|st| {
            st.set_phase(Phase::Stopping);
            st.record_op(op, cid);
        });

        let mut warnings: Vec<String> = Vec::new();
        let adapter_ifname = {
            let st = self.status.lock().expect("status lock");
            st.adapter.clone()
        };

        let mut exit_code = None;
        if let Some(handle) = engine {
            exit_code = handle.stop(ENGINE_STOP_GRACE).await;
        }

        // Second-pass teardown: engine children or orphan helpers that
        // escaped the group.
        warnings.extend(self.kill_stray_processes());

        warnings.extend(worker.ledger.drain().await);

        let roots = conf::candidate_roots(&self.paths.run_dir);
        let removed_dirs = conf::remove_conf_dirs(&roots, adapter_ifname.as_deref());
        if repair && !removed_dirs.is_empty() {
            warnings.push(format!("removed_engine_conf_dirs:{}", removed_dirs.join(",")));
        }

        if repair {
            warnings.extend(firewall::rules::purge_tagged_rules().await);
            let removed = self.cleanup_virtual_ap_ifaces().await;
            if !removed.is_empty() {
                warnings.push(format!("removed_virtual_ap_ifaces:{}", removed.join(",")));
            }
            worker.last_plan = None;
        }

        if warnings.iter().any(|w| w.starts_with("firewall_")) {
            warnings.push("firewall_revert_incomplete".to_string());
        }

        self.update_status(|st| {
            st.set_phase(Phase::Stopped);
            st.clear_run_details();
            st.engine.last_exit_code = exit_code;
            st.warnings = warnings;
            st.last_error = None;
            st.last_error_detail = None;
            st.record_op(op, cid);
        });
        info!(op, "hotspot stopped");

        let code = if repair {
            ResultCode::Repaired
        } else {
            ResultCode::Stopped
        };
        self.result(code, cid)
    }

    /// Kill leftover AP pipeline processes that reference this daemon's
    /// runtime artifacts but are no longer attributable to the handle.
    fn kill_stray_processes(&self) -> Vec<String> {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

        let mut warnings = Vec::new();
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let run_dir = self.paths.run_dir.to_string_lossy().to_string();
        let markers = [run_dir.as_str(), "/dev/shm/lnxrouter_tmp", "vr-hotspot"];
        let own_pid = std::process::id();

        let mut killed = Vec::new();
        for (pid, process) in system.processes() {
            if pid.as_u32() == own_pid {
                continue;
            }
            let name = process.name().to_string_lossy().to_string();
            if !["hostapd", "dnsmasq", "lnxrouter"]
                .iter()
                .any(|n| name.contains(n))
            {
                continue;
            }
            let cmdline = process
                .cmd()
                .iter()
                .map(|c| c.to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            if !markers.iter().any(|m| cmdline.contains(m)) {
                continue;
            }
            if process.kill() {
                killed.push(format!("{name}:{pid}"));
            } else {
                warnings.push(format!("stray_kill_failed:{name}:{pid}"));
            }
        }
        if !killed.is_empty() {
            info!("killed stray engine processes: {}", killed.join(","));
        }
        warnings
    }

    /// Delete leftover virtual AP children (x0-style names, kernel type AP).
    async fn cleanup_virtual_ap_ifaces(&self) -> Vec<String> {
        let mut removed = Vec::new();
        let dump = iw::dev_dump().await;
        for dev in iw::parse_dev(&dump.combined()) {
            let is_virtual = dev.ifname.starts_with('x')
                && dev.ifname[1..].starts_with(|c: char| c.is_ascii_digit());
            if is_virtual && dev.is_ap() {
                let out = iw::dev_del(&dev.ifname).await;
                if out.ok() {
                    removed.push(dev.ifname);
                }
            }
        }
        removed
    }

    // -----------------------------------------------------------------
    // Watchdog hooks
    // -----------------------------------------------------------------

    /// Supervised restart after the watchdog observed engine death: stop,
    /// then one attempt on the last effective plan (not the stored config).
    /// Returns false when the restart failed and the machine is in Error.
    pub async fn supervised_restart(&self) -> bool {
        let cid = Self::correlation_id("watchdog");
        let Ok(mut worker) = self.worker.try_lock() else {
            // A lifecycle operation is in flight; it owns the machine.
            return true;
        };

        let running = {
            let st = self.status.lock().expect("status lock");
            st.phase == Phase::Running
        };
        if running && self.engine_alive() {
            return true;
        }
        if !running {
            return true;
        }

        warn!("watchdog observed engine death, attempting supervised restart");
        self.update_status(|st| st.push_warning("watchdog_engine_died"));
        let _ = self.stop_locked(&mut worker, &cid, false).await;

        let Some(plan) = worker.last_plan.clone() else {
            self.update_status(|st| {
                st.set_phase(Phase::Error);
                st.last_error = Some(ErrorKind::EngineCrashLate.as_str().to_string());
                st.record_op("watchdog", &cid);
            });
            return false;
        };

        self.update_status(|st| {
            st.set_phase(Phase::Starting);
            st.record_op("watchdog", &cid);
        });

        let cfg = self.config_store.load();
        let facts = PlatformFacts::gather().await;
        let inventory = inventory::snapshot().await;
        let adapter_phy = inventory
            .get(&plan.adapter_ifname)
            .and_then(|a| a.phy.clone());
        let ctx = AttemptCtx {
            cfg: &cfg,
            facts: &facts,
            adapter_phy,
            cid: &cid,
        };

        let mut warnings = vec!["watchdog_supervised_restart".to_string()];
        match self.run_attempt(&mut worker, &ctx, &plan, &mut warnings).await {
            Ok(ready) => {
                let adapter = inventory
                    .get(&plan.adapter_ifname)
                    .cloned()
                    .unwrap_or_else(|| Adapter {
                        ifname: plan.adapter_ifname.clone(),
                        ..Default::default()
                    });
                self.publish_running(&plan, &adapter, &ready, None, &warnings, &cid);
                true
            }
            Err(err) => {
                warnings.extend(worker.ledger.drain().await);
                self.update_status(|st| {
                    st.set_phase(Phase::Error);
                    st.last_error = Some(err.kind.as_str().to_string());
                    st.last_error_detail = Some(err.to_detail());
                    st.warnings.extend(warnings);
                    st.record_op("watchdog", &cid);
                });
                error!("supervised restart failed: {}", err);
                false
            }
        }
    }

    /// One telemetry sample, published into the status snapshot. Never takes
    /// the lifecycle lock.
    pub async fn telemetry_tick(&self, sampler: &mut TelemetrySampler) {
        let cfg = self.config_store.load();
        if !cfg.telemetry_enable {
            return;
        }
        let (running, ap_interface) = {
            let st = self.status.lock().expect("status lock");
            (st.phase == Phase::Running, st.ap_interface.clone())
        };
        if !running {
            sampler.reset();
            return;
        }
        let Some(ap) = ap_interface else {
            return;
        };
        let snap = sampler.sample(&ap).await;
        self.update_status(|st| {
            for w in &snap.warnings {
                if !st.warnings.contains(w) {
                    st.warnings.push(w.clone());
                }
            }
            st.telemetry = Some(snap);
        });
    }
}

struct AttemptCtx<'a> {
    cfg: &'a Config,
    facts: &'a PlatformFacts,
    adapter_phy: Option<String>,
    #[allow(dead_code)]
    cid: &'a str,
}

fn lan_cidr(gateway: Ipv4Addr) -> String {
    let o = gateway.octets();
    format!("{}.{}.{}.0/24", o[0], o[1], o[2])
}

fn field_errors_to_string(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}:{}", e.field, e.code))
        .collect::<Vec<_>>()
        .join(",")
}

/// Merge start overrides over the stored record. Unknown keys are ignored;
/// the passphrase key is handled by the caller.
fn merge_overrides(
    cfg: &Config,
    overrides: Option<&Map<String, Value>>,
) -> Result<Config, Vec<FieldError>> {
    let Some(patch) = overrides.filter(|p| !p.is_empty()) else {
        return Ok(cfg.clone());
    };
    let mut value = serde_json::to_value(cfg)
        .map_err(|e| vec![FieldError::new("config", &format!("serialize_failed:{e}"))])?;
    let Some(obj) = value.as_object_mut() else {
        return Err(vec![FieldError::new("config", "not_an_object")]);
    };
    for (k, v) in patch {
        if k == "wpa2_passphrase" {
            continue;
        }
        obj.insert(k.clone(), v.clone());
    }
    serde_json::from_value(value)
        .map_err(|e| vec![FieldError::new("config", &format!("deserialize_failed:{e}"))])
}

/// Resolve `recommended` to the chosen adapter's best band.
fn resolve_band(pref: BandPreference, adapter: &Adapter) -> Result<Band, LifecycleError> {
    match pref {
        BandPreference::Band2g => Ok(Band::G24),
        BandPreference::Band5g => Ok(Band::G5),
        BandPreference::Band6g => Ok(Band::G6),
        BandPreference::Recommended => match adapter.best_band() {
            Some("6ghz") => Ok(Band::G6),
            Some("5ghz") => Ok(Band::G5),
            Some("2.4ghz") => Ok(Band::G24),
            _ => Err(LifecycleError::new(ErrorKind::AdapterNoApMode)
                .with_detail(adapter.ifname.clone())),
        },
    }
}

/// The fallback chain: what to try after one failed attempt, if anything.
fn plan_fallback(
    failed: &AttemptSettings,
    kind: ErrorKind,
    cfg: &Config,
    no_virt_flip_done: bool,
) -> Option<(AttemptSettings, String, String)> {
    if !kind.retryable() {
        return None;
    }

    // A driver that rejects the channel often objects to the virtual AP
    // child, not the channel itself; flip no-virt once before changing band.
    if kind == ErrorKind::DriverRejectedChannel && !failed.no_virt && !no_virt_flip_done {
        let next = AttemptSettings {
            no_virt: true,
            ..*failed
        };
        return Some((
            next,
            "no_virt_retry".to_string(),
            "driver_rejected_channel_retry_no_virt".to_string(),
        ));
    }

    match failed.band {
        // Only a readiness timeout steps down from 6 GHz; every other
        // failure class there is terminal.
        Band::G6 if kind == ErrorKind::ApReadyTimeout => {
            let next = AttemptSettings {
                band: Band::G5,
                channel: None,
                no_virt: failed.no_virt,
                auto_select: failed.auto_select,
            };
            let reason = format!("{}_6ghz", kind.as_str());
            Some((next, reason.clone(), reason))
        }
        Band::G5 if matches!(kind, ErrorKind::ApReadyTimeout | ErrorKind::DriverRejectedChannel) => {
            let next = AttemptSettings {
                band: Band::G24,
                channel: Some(cfg.channel_2g_clamped().max(1) as u16),
                no_virt: failed.no_virt,
                auto_select: true,
            };
            let reason = format!("{}_5ghz", kind.as_str());
            Some((next, reason.clone(), reason))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(band: Band) -> AttemptSettings {
        AttemptSettings {
            band,
            channel: None,
            no_virt: false,
            auto_select: false,
        }
    }

    #[test]
    fn test_fallback_6ghz_timeout_goes_to_5ghz() {
        let cfg = Config::default();
        let (next, reason, _) =
            plan_fallback(&settings(Band::G6), ErrorKind::ApReadyTimeout, &cfg, false).unwrap();
        assert_eq!(next.band, Band::G5);
        assert_eq!(reason, "ap_ready_timeout_6ghz");
    }

    #[test]
    fn test_fallback_5ghz_goes_to_2_4ghz_auto_channel() {
        let cfg = Config::default();
        let (next, reason, _) =
            plan_fallback(&settings(Band::G5), ErrorKind::ApReadyTimeout, &cfg, false).unwrap();
        assert_eq!(next.band, Band::G24);
        assert_eq!(next.channel, Some(6));
        assert!(next.auto_select);
        assert_eq!(reason, "ap_ready_timeout_5ghz");
    }

    #[test]
    fn test_fallback_driver_rejection_flips_no_virt_first() {
        let cfg = Config::default();
        let (next, reason, _) = plan_fallback(
            &settings(Band::G5),
            ErrorKind::DriverRejectedChannel,
            &cfg,
            false,
        )
        .unwrap();
        assert_eq!(next.band, Band::G5);
        assert!(next.no_virt);
        assert_eq!(reason, "no_virt_retry");

        // Flip already spent: band fallback instead.
        let (next, _, _) = plan_fallback(
            &settings(Band::G5),
            ErrorKind::DriverRejectedChannel,
            &cfg,
            true,
        )
        .unwrap();
        assert_eq!(next.band, Band::G24);
    }

    #[test]
    fn test_fallback_6ghz_only_retries_on_timeout() {
        let cfg = Config::default();
        // The one-shot no-virt flip already spent: a channel rejection at
        // 6 GHz must terminate, not step down a band.
        let mut rejected = settings(Band::G6);
        rejected.no_virt = true;
        assert!(plan_fallback(&rejected, ErrorKind::DriverRejectedChannel, &cfg, true).is_none());
        assert!(plan_fallback(
            &settings(Band::G6),
            ErrorKind::DriverRejectedChannel,
            &cfg,
            true
        )
        .is_none());

        // Retryable-in-general kinds are still terminal at 6 GHz.
        for kind in [
            ErrorKind::EngineCrashEarly,
            ErrorKind::EngineCrashLate,
            ErrorKind::ApInterfaceNotUp,
            ErrorKind::ApTypeMismatch,
            ErrorKind::SsidNotAdvertised,
        ] {
            assert!(
                plan_fallback(&settings(Band::G6), kind, &cfg, false).is_none(),
                "{} must not retry from 6ghz",
                kind.as_str()
            );
        }
    }

    #[test]
    fn test_fallback_fatal_kinds_stop_the_chain() {
        let cfg = Config::default();
        for kind in [
            ErrorKind::MissingBinary,
            ErrorKind::DependencyMissing,
            ErrorKind::HostapdInvalidCountryCodeFor80211d,
            ErrorKind::No6ghzApAdapter,
        ] {
            assert!(plan_fallback(&settings(Band::G6), kind, &cfg, false).is_none());
        }
    }

    #[test]
    fn test_fallback_2_4ghz_is_terminal() {
        let cfg = Config::default();
        assert!(plan_fallback(&settings(Band::G24), ErrorKind::ApReadyTimeout, &cfg, true).is_none());
    }

    #[test]
    fn test_resolve_band_recommended() {
        let mut adapter = Adapter {
            ifname: "wlan1".into(),
            supports_ap: true,
            supports_2_4ghz: true,
            supports_5ghz: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_band(BandPreference::Recommended, &adapter).unwrap(),
            Band::G5
        );
        adapter.supports_6ghz = true;
        assert_eq!(
            resolve_band(BandPreference::Recommended, &adapter).unwrap(),
            Band::G6
        );
    }

    #[test]
    fn test_merge_overrides_keeps_unknown_keys_out() {
        let cfg = Config::default();
        let mut patch = Map::new();
        patch.insert("ssid".into(), Value::from("VR-NET"));
        patch.insert("wpa2_passphrase".into(), Value::from("secret-here"));
        patch.insert("bogus_key".into(), Value::from(1));
        let merged = merge_overrides(&cfg, Some(&patch)).unwrap();
        assert_eq!(merged.ssid, "VR-NET");
        // The passphrase never lands in the config record.
        let text = serde_json::to_string(&merged).unwrap();
        assert!(!text.contains("secret-here"));
    }

    #[test]
    fn test_lan_cidr() {
        assert_eq!(lan_cidr(Ipv4Addr::new(192, 168, 68, 1)), "192.168.68.0/24");
    }
}
