//! Shared types for the VR hotspot daemon.
//!
//! Everything the control plane exchanges with the lifecycle core lives
//! here: the configuration record, the published status snapshot, the error
//! taxonomy, adapter inventory records, telemetry summaries, and the
//! persisted-store helpers (atomic writes, passphrase side-store).

pub mod adapters;
pub mod config;
pub mod error;
pub mod status;
pub mod store;
pub mod telemetry;

pub use adapters::{Adapter, AdapterInventory, BusType, RegDomain};
pub use config::{
    ApSecurity, BandPreference, ChannelWidth, Config, ConfigView, DhcpDns, FieldError, QosPreset,
};
pub use error::{ErrorDetail, ErrorKind, LifecycleError, ResultCode};
pub use status::{EngineStatus, LifecycleResult, Phase, PlatformStatus, Status};
pub use store::{ConfigStore, PassphraseStore, StatusStore, TokenStore};
pub use telemetry::{ClientSample, TelemetrySnapshot, TelemetrySummary};

/// Current epoch time in whole seconds.
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
