//! VR hotspot daemon core.
//!
//! Turns a Linux host into a dedicated Wi-Fi access point for VR tethering:
//! a supervised, reconciled state machine over a hostapd/dnsmasq/NAT
//! pipeline. The control plane (out of tree) talks to [`lifecycle::Hotspot`].

pub mod channel;
pub mod engine;
pub mod firewall;
pub mod inventory;
pub mod ledger;
pub mod lifecycle;
pub mod nat_accel;
pub mod platform;
pub mod qos;
pub mod readiness;
pub mod telemetry;
pub mod tuner;
pub mod watchdog;

pub use lifecycle::{Hotspot, HotspotPaths};
