//! Infrastructure adapters for the volume profile tool
//!
//! - `ipc`: the singleton waiter registry and switch-profile channel
//! - `waiter`: the long-lived worker servicing switch requests
//! - `simulated`: an in-process session backend

pub mod ipc;
pub mod simulated;
pub mod waiter;

pub use ipc::{Registry, RegistryError, SwitchProfileRequest, WAITER_CHANNEL};
pub use simulated::SimulatedSessions;
pub use waiter::Waiter;
