//! Error taxonomy surfaced to the control plane.
//!
//! Every lifecycle failure path constructs one `LifecycleError`; nothing
//! bubbles up as a bare string or panic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error kinds, grouped as in the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Lifecycle
    AlreadyRunning,
    AlreadyStopped,
    LifecycleBusy,
    // Configuration
    ConfigInvalid,
    PassphraseNotSet,
    PassphraseInvalidLength,
    ConfirmationRequired,
    // Adapter
    AdapterNotFound,
    AdapterNoApMode,
    No6ghzApAdapter,
    // Regulatory
    HostapdInvalidCountryCodeFor80211d,
    CountryNotSet,
    // Engine process
    MissingBinary,
    DependencyMissing,
    EngineSpawnFailed,
    EngineCrashEarly,
    EngineCrashLate,
    DriverRejectedChannel,
    // Readiness
    ApReadyTimeout,
    ApInterfaceNotUp,
    ApTypeMismatch,
    SsidNotAdvertised,
    // Firewall
    FirewallApplyFailed,
    FirewallRevertIncomplete,
    // Host tuning (warning class)
    TuningPartiallyApplied,
    // Internal
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::AlreadyStopped => "already_stopped",
            ErrorKind::LifecycleBusy => "lifecycle_busy",
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::PassphraseNotSet => "passphrase_not_set",
            ErrorKind::PassphraseInvalidLength => "passphrase_invalid_length",
            ErrorKind::ConfirmationRequired => "confirmation_required",
            ErrorKind::AdapterNotFound => "adapter_not_found",
            ErrorKind::AdapterNoApMode => "adapter_no_ap_mode",
            ErrorKind::No6ghzApAdapter => "no_6ghz_ap_adapter",
            ErrorKind::HostapdInvalidCountryCodeFor80211d => {
                "hostapd_invalid_country_code_for_80211d"
            }
            ErrorKind::CountryNotSet => "country_not_set",
            ErrorKind::MissingBinary => "missing_binary",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::EngineSpawnFailed => "engine_spawn_failed",
            ErrorKind::EngineCrashEarly => "engine_crash_early",
            ErrorKind::EngineCrashLate => "engine_crash_late",
            ErrorKind::DriverRejectedChannel => "driver_rejected_channel",
            ErrorKind::ApReadyTimeout => "ap_ready_timeout",
            ErrorKind::ApInterfaceNotUp => "ap_interface_not_up",
            ErrorKind::ApTypeMismatch => "ap_type_mismatch",
            ErrorKind::SsidNotAdvertised => "ssid_not_advertised",
            ErrorKind::FirewallApplyFailed => "firewall_apply_failed",
            ErrorKind::FirewallRevertIncomplete => "firewall_revert_incomplete",
            ErrorKind::TuningPartiallyApplied => "tuning_partially_applied",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Whether a `Starting` attempt failing with this kind may be retried on
    /// a modified plan. Regulatory, adapter-capability and missing-binary
    /// failures are fatal to the whole operation.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ApReadyTimeout
                | ErrorKind::DriverRejectedChannel
                | ErrorKind::EngineCrashEarly
                | ErrorKind::EngineCrashLate
                | ErrorKind::ApInterfaceNotUp
                | ErrorKind::ApTypeMismatch
                | ErrorKind::SsidNotAdvertised
        )
    }

    /// Short operator guidance for kinds that have a known remedy.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            ErrorKind::CountryNotSet | ErrorKind::HostapdInvalidCountryCodeFor80211d => Some(
                "Set a valid 2-letter country code in the configuration and start again.",
            ),
            ErrorKind::No6ghzApAdapter => Some(
                "No adapter supports AP mode on 6 GHz; choose 5 GHz or attach a 6 GHz-capable adapter.",
            ),
            ErrorKind::AdapterNoApMode => Some(
                "The selected adapter's driver does not support AP mode; pick another adapter.",
            ),
            ErrorKind::MissingBinary | ErrorKind::DependencyMissing => Some(
                "Install hostapd and dnsmasq or re-run the installer to restore vendored binaries.",
            ),
            ErrorKind::PassphraseNotSet => {
                Some("Set a WPA2 passphrase (8-63 printable characters) before revealing it.")
            }
            ErrorKind::ApReadyTimeout => Some(
                "The access point did not come up in time; check adapter placement, regulatory domain and logs.",
            ),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured detail block attached to `Status.last_error_detail`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// The single failure record every lifecycle path produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl LifecycleError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            remediation: kind.remediation().map(str::to_string),
            warnings: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError).with_detail(detail)
    }

    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            title: self.kind.as_str().to_string(),
            remediation: self.remediation.clone(),
            errors: self
                .detail
                .iter()
                .cloned()
                .chain(self.warnings.iter().cloned())
                .collect(),
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{}: {}", self.kind, d),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Result codes carried in `LifecycleResult.result_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Started,
    StartedWithFallback,
    Stopped,
    Repaired,
    AlreadyRunning,
    AlreadyStopped,
    LifecycleBusy,
    StartFailed,
    StopFailed,
    ConfigInvalid,
    HostapdInvalidCountryCodeFor80211d,
    No6ghzApAdapter,
    MissingBinary,
    InternalError,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Started => "started",
            ResultCode::StartedWithFallback => "started_with_fallback",
            ResultCode::Stopped => "stopped",
            ResultCode::Repaired => "repaired",
            ResultCode::AlreadyRunning => "already_running",
            ResultCode::AlreadyStopped => "already_stopped",
            ResultCode::LifecycleBusy => "lifecycle_busy",
            ResultCode::StartFailed => "start_failed",
            ResultCode::StopFailed => "stop_failed",
            ResultCode::ConfigInvalid => "config_invalid",
            ResultCode::HostapdInvalidCountryCodeFor80211d => {
                "hostapd_invalid_country_code_for_80211d"
            }
            ResultCode::No6ghzApAdapter => "no_6ghz_ap_adapter",
            ResultCode::MissingBinary => "missing_binary",
            ResultCode::InternalError => "internal_error",
        }
    }

    /// Map a failure kind onto the closest public result code.
    pub fn from_error(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::AlreadyRunning => ResultCode::AlreadyRunning,
            ErrorKind::AlreadyStopped => ResultCode::AlreadyStopped,
            ErrorKind::LifecycleBusy => ResultCode::LifecycleBusy,
            ErrorKind::ConfigInvalid => ResultCode::ConfigInvalid,
            ErrorKind::HostapdInvalidCountryCodeFor80211d => {
                ResultCode::HostapdInvalidCountryCodeFor80211d
            }
            ErrorKind::No6ghzApAdapter => ResultCode::No6ghzApAdapter,
            ErrorKind::MissingBinary | ErrorKind::DependencyMissing => ResultCode::MissingBinary,
            ErrorKind::InternalError => ResultCode::InternalError,
            _ => ResultCode::StartFailed,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ResultCode::Started
                | ResultCode::StartedWithFallback
                | ResultCode::Stopped
                | ResultCode::Repaired
                | ResultCode::AlreadyRunning
                | ResultCode::AlreadyStopped
        )
    }
}
