//! Firewall reconciliation.
//!
//! Two interchangeable backends behind one contract: `apply(profile)`
//! returns a revert token, `revert(token)` undoes exactly what was added.
//! The zone backend defers to the host's zone-based manager; the rules
//! backend edits tagged packet-filter rules directly. Backends never call
//! each other.

pub mod rules;
pub mod zone;

pub use rules::RulesBackend;
pub use zone::ZoneBackend;

use crate::platform::facts::PlatformFacts;
use vrhotspot_shared::error::LifecycleError;

/// What the reconciler is asked to establish for one attempt.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub ap_ifname: String,
    /// LAN network in CIDR form, e.g. "192.168.68.0/24".
    pub lan_cidr: String,
    pub uplink_ifname: Option<String>,
    pub masquerade: bool,
    pub forward: bool,
    pub zone: Option<String>,
}

/// The uniform reconciler seam.
pub trait FirewallBackend {
    fn name(&self) -> &'static str;
    fn apply(
        &self,
        profile: &Profile,
    ) -> impl std::future::Future<Output = Result<RevertToken, LifecycleError>> + Send;
}

/// Everything needed to undo one `apply`, independent of live backend state.
#[derive(Debug, Clone)]
pub enum RevertToken {
    Zone(zone::ZoneRevert),
    Rules(rules::RulesRevert),
    /// Apply was a no-op (disabled, or deferred to the zone manager).
    None,
}

impl RevertToken {
    /// Undo best-effort. Each step logs a warning instead of aborting the
    /// rest of the revert.
    pub async fn revert(self) -> Vec<String> {
        match self {
            RevertToken::Zone(state) => state.revert().await,
            RevertToken::Rules(state) => state.revert().await,
            RevertToken::None => Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, RevertToken::None)
    }
}

/// The backend chosen for one lifecycle attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Zone,
    Rules,
    /// Zone manager active with the direct 6 GHz backend: skip internal NAT
    /// hooks entirely.
    Skip,
}

/// Backend selection from the platform facts gathered at Start.
pub fn choose_backend(facts: &PlatformFacts, direct_6ghz: bool) -> BackendChoice {
    if facts.firewall.zone_manager_active() {
        if direct_6ghz {
            BackendChoice::Skip
        } else {
            BackendChoice::Zone
        }
    } else {
        BackendChoice::Rules
    }
}

/// Run the chosen backend's apply.
pub async fn apply(
    choice: BackendChoice,
    profile: &Profile,
) -> Result<RevertToken, LifecycleError> {
    match choice {
        BackendChoice::Zone => ZoneBackend.apply(profile).await,
        BackendChoice::Rules => RulesBackend.apply(profile).await,
        BackendChoice::Skip => Ok(RevertToken::None),
    }
}
