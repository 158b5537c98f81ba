//! # VPN Failover
//!
//! Keeps a small router's VPN tunnel up across WAN changes while a firewall
//! kill-switch makes sure LAN traffic never leaves outside the tunnel.
//!
//! The [`watchdog::Watchdog`] periodically selects a WAN uplink, reconciles
//! the kill-switch and restarts the tunnel when it fails or goes stale.
//! Administrative callers use [`control::Router`], which serialises with the
//! watchdog through a single lifecycle lock.

pub mod config;
pub mod control;
pub mod errors;
pub mod exec;
pub mod firewall;
pub mod lock;
pub mod network;
pub mod profiles;
pub mod settings;
pub mod status;
pub mod tunnel;
pub mod wan;
pub mod watchdog;

// Re-export commonly used types
pub use config::{FileConfig, Overrides, RouterConfig, DEFAULT_CONFIG_PATH};
pub use control::{ProfileEntry, Router};
pub use errors::{ErrorClass, RouterError, RouterResult};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use profiles::{Credentials, ProtocolKind, TunnelProfile};
pub use settings::WatchdogSettings;
pub use status::StatusSnapshot;
pub use tunnel::{Health, TunnelLifecycle, TunnelState};
pub use wan::{WanCandidate, WanKind};
pub use watchdog::{TickOutcome, Watchdog};
