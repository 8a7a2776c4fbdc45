//! Engine adapters: uniform supervision over the external AP pipeline.
//!
//! Three backends share one contract: build an [`EngineSpec`], spawn it into
//! an [`supervisor::EngineHandle`], and let the lifecycle drive readiness,
//! log capture and teardown through the handle.

pub mod cmd;
pub mod conf;
pub mod supervisor;
pub mod vendor;

pub use cmd::{EngineSpec, VirtualApName};
pub use supervisor::{EngineHandle, ExitClass, SpawnFailure, ENGINE_TAIL_MAX_LINES};

use serde::{Deserialize, Serialize};

/// Which backend drives the pipeline for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// External shell orchestrator that spawns hostapd + dnsmasq itself
    /// (2.4/5 GHz NAT mode).
    Orchestrator,
    /// hostapd invoked directly on a pre-generated config (6 GHz / WPA3-SAE,
    /// and platforms that prefer it), dnsmasq alongside.
    Direct,
    /// Kernel bridge of uplink + AP interface; no NAT.
    Bridge,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Orchestrator => "orchestrator",
            BackendKind::Direct => "direct",
            BackendKind::Bridge => "bridge",
        }
    }
}
