//! Core domain for per-application volume profiles
//!
//! Platform-neutral building blocks shared by the setter and waiter roles:
//!
//! - Profile configuration: parsing, validation, and suffix matching
//! - The active profile cell read by session callbacks
//! - Session provider traits and the profile-applying consumer
//! - The service lifecycle state machine

pub mod domain;

pub use domain::*;
