//! The published status snapshot.
//!
//! One authoritative record per daemon; readers always get a stable copy.
//! All discovery fields are optional so a snapshot never invents state.

use crate::error::{ErrorDetail, ResultCode};
use crate::telemetry::TelemetrySnapshot;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of the hotspot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stopped => "stopped",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Error => "error",
        }
    }
}

/// NAT or bridge operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotspotMode {
    Nat,
    Bridge,
}

/// Engine subset of the snapshot. The argv copy is always redacted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub pid: Option<u32>,
    pub cmd: Option<Vec<String>>,
    pub started_ts: Option<i64>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub stdout_tail: Vec<String>,
    #[serde(default)]
    pub stderr_tail: Vec<String>,
    #[serde(default)]
    pub ap_logs_tail: Vec<String>,
}

impl EngineStatus {
    pub fn cleared() -> Self {
        Self::default()
    }

    /// Copy without log tails, for `get_status(include_logs=false)`.
    pub fn without_logs(&self) -> Self {
        Self {
            stdout_tail: Vec::new(),
            stderr_tail: Vec::new(),
            ap_logs_tail: Vec::new(),
            ..self.clone()
        }
    }
}

/// Host platform summary attached to the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformStatus {
    /// OS label from os-release ("steamos", "bazzite", "fedora", ...).
    pub flavor: String,
    pub family: Option<String>,
    /// Whether a zone-based firewall manager is active.
    pub zone_firewall_active: bool,
    /// Selected firewall backend ("firewalld" | "iptables" | ...).
    pub firewall_backend: String,
    pub network_manager_running: bool,
}

/// Preflight sub-report collected before engine spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreflightReport {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Observable state emitted to the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    pub running: bool,
    pub phase: Phase,

    pub adapter: Option<String>,
    pub ap_interface: Option<String>,
    pub band: Option<String>,
    pub mode: Option<HotspotMode>,
    pub channel_width_mhz: Option<u32>,

    pub selected_band: Option<String>,
    pub selected_width_mhz: Option<u32>,
    pub selected_channel: Option<u16>,
    pub selected_country: Option<String>,

    pub fallback_reason: Option<String>,

    pub last_op: Option<String>,
    pub last_op_ts: Option<i64>,
    pub last_correlation_id: Option<String>,

    pub last_error: Option<String>,
    pub last_error_detail: Option<ErrorDetail>,

    pub engine: EngineStatus,
    pub telemetry: Option<TelemetrySnapshot>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub platform: PlatformStatus,
    pub preflight: PreflightReport,
}

impl Status {
    /// Invariant: `running` always equals `phase == running`.
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.running = phase == Phase::Running;
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn record_op(&mut self, op: &str, correlation_id: &str) {
        self.last_op = Some(op.to_string());
        self.last_op_ts = Some(crate::now_epoch());
        self.last_correlation_id = Some(correlation_id.to_string());
    }

    /// Snapshot copy handed to status readers.
    pub fn view(&self, include_logs: bool) -> Status {
        let mut copy = self.clone();
        if !include_logs {
            copy.engine = copy.engine.without_logs();
        }
        copy
    }

    /// Clear the per-run selection fields when leaving `Running`.
    pub fn clear_run_details(&mut self) {
        self.adapter = None;
        self.ap_interface = None;
        self.band = None;
        self.mode = None;
        self.channel_width_mhz = None;
        self.fallback_reason = None;
        self.engine = EngineStatus::cleared();
        self.telemetry = None;
    }
}

/// The response envelope for every lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleResult {
    pub ok: bool,
    pub result_code: ResultCode,
    pub correlation_id: String,
    pub data: Status,
}

impl LifecycleResult {
    pub fn new(result_code: ResultCode, correlation_id: &str, data: Status) -> Self {
        Self {
            ok: result_code.is_ok(),
            result_code,
            correlation_id: correlation_id.to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_tracks_phase() {
        let mut st = Status::default();
        assert!(!st.running);
        st.set_phase(Phase::Running);
        assert!(st.running);
        st.set_phase(Phase::Stopping);
        assert!(!st.running);
    }

    #[test]
    fn test_view_strips_logs() {
        let mut st = Status::default();
        st.engine.stdout_tail = vec!["line".into()];
        st.engine.ap_logs_tail = vec!["hostapd: AP-ENABLED".into()];
        let bare = st.view(false);
        assert!(bare.engine.stdout_tail.is_empty());
        assert!(bare.engine.ap_logs_tail.is_empty());
        let full = st.view(true);
        assert_eq!(full.engine.stdout_tail.len(), 1);
    }

    #[test]
    fn test_clear_run_details() {
        let mut st = Status::default();
        st.adapter = Some("wlan1".into());
        st.engine.pid = Some(42);
        st.clear_run_details();
        assert!(st.adapter.is_none());
        assert!(st.engine.pid.is_none());
    }

    #[test]
    fn test_result_envelope_ok_flag() {
        let res = LifecycleResult::new(ResultCode::Started, "cid", Status::default());
        assert!(res.ok);
        let res = LifecycleResult::new(ResultCode::LifecycleBusy, "cid", Status::default());
        assert!(!res.ok);
    }

    #[test]
    fn test_phase_wire_form() {
        assert_eq!(
            serde_json::to_string(&Phase::Starting).unwrap(),
            "\"starting\""
        );
    }
}
