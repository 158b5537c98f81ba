use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while reconciling the router's VPN and WAN state
#[derive(Error, Debug)]
pub enum RouterError {
    /// Interface could not be found
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Gateway could not be found for the specified interface
    #[error("Gateway not found for interface: {0}")]
    GatewayNotFound(String),

    /// Command could not be spawned or waited on
    #[error("Failed to execute command: {0}")]
    CommandExecution(String),

    /// Command did not finish within its timeout
    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Route modification failed
    #[error("Route modification failed: {0}")]
    RouteModificationFailed(String),

    /// Tunnel could not be brought up
    #[error("Tunnel start failed: {0}")]
    TunnelStartFailed(String),

    /// Tunnel could not be brought down
    #[error("Tunnel stop failed: {0}")]
    TunnelStopFailed(String),

    /// Output of a tunnel query could not be parsed
    #[error("Unexpected tunnel status output: {0}")]
    TunnelStatus(String),

    /// No profile is pointed at by the active pointer
    #[error("No VPN profile configured")]
    NoActiveProfile,

    /// Named profile does not exist in the profile directory
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Profile exists but cannot be used
    #[error("Invalid profile {name}: {reason}")]
    InvalidProfile { name: String, reason: String },

    /// A user supplied value failed the allow-list check
    #[error("Invalid {what}: {value:?}")]
    InvalidInput { what: &'static str, value: String },

    /// Settings value is out of bounds
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Kill-switch rules could not be applied or confirmed
    #[error("Firewall kill-switch failure: {0}")]
    Firewall(String),

    /// Another lifecycle operation held the lock past the bounded wait
    #[error("Tunnel busy with another operation, retry later")]
    Busy,

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Insufficient permissions
    #[error("Insufficient permissions (try running as root)")]
    InsufficientPermissions,

    /// Settings or configuration file could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be serialized
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// IO error
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    /// Unknown error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// How an error should be treated by the watchdog and reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried on the next tick
    Transient,
    /// Needs an administrative action, never retried automatically
    Structural,
    /// Kill-switch could not be confirmed, the tick is aborted
    SafetyCritical,
    /// Lost the race for the lifecycle lock
    Conflict,
}

impl RouterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RouterError::Firewall(_) => ErrorClass::SafetyCritical,
            RouterError::Busy => ErrorClass::Conflict,
            RouterError::NoActiveProfile
            | RouterError::ProfileNotFound(_)
            | RouterError::InvalidProfile { .. }
            | RouterError::InvalidInput { .. }
            | RouterError::InvalidSettings(_)
            | RouterError::InvalidConfiguration(_)
            | RouterError::InsufficientPermissions
            | RouterError::Parse(_) => ErrorClass::Structural,
            _ => ErrorClass::Transient,
        }
    }
}

/// Shorthand result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Convert anyhow errors to RouterError
impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        RouterError::Unknown(err.to_string())
    }
}
