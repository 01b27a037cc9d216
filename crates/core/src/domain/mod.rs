//! Domain entities and business rules

pub mod cell;
pub mod profile;
pub mod service;
pub mod session;

// Re-export specific items to avoid ambiguous glob imports
pub use cell::ActiveProfileCell;
pub use profile::{
    default_config_path, load_profile, ProfileError, ProfileSet, SessionKey, VolumeControl,
    VolumeProfile, DEVICE_SUFFIX, SYSTEM_SUFFIX,
};
pub use service::{
    ServiceController, ServiceHost, ServiceRunner, ServiceState, ServiceWorker, StopFlag,
};
pub use session::{
    AudioSession, ProfileApplier, SessionError, SessionHandler, SessionProvider,
    SessionSubscription, SubscriptionGuard, STOP_REASON,
};
