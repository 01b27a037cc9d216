//! Inter-process coordination between setter and waiter roles
//!
//! A named, versioned channel carries switch-profile requests from setter
//! invocations to the single live waiter. The name doubles as the waiter's
//! singleton token.

pub mod message;
pub mod registry;

pub use message::{SwitchProfileRequest, MESSAGE_LIMIT};
pub use registry::{
    Registry, RegistryError, SwitchSender, WaiterEndpoint, CONNECT_PROBE, POLL_INTERVAL,
};

/// Channel name claimed by the waiter. The version suffix keeps incompatible
/// releases from talking to each other.
pub const WAITER_CHANNEL: &str = "volprof-waiter-v1";
