//! Audio session abstractions and the profile-applying consumer
//!
//! This module defines the platform-agnostic session interfaces (enumeration,
//! per-session volume, new-session notifications) and `ProfileApplier`, which
//! resolves the active profile against each session. Platform adapters live in
//! the `infra` crate.

use crate::domain::cell::ActiveProfileCell;
use crate::domain::profile::{SessionKey, VolumeProfile};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type Result<T> = std::result::Result<T, SessionError>;

/// Cancellation reason reported when the waiter shuts down.
pub const STOP_REASON: &str = "service stop";

/// Errors from platform calls against a single session or the device.
///
/// These are always scoped to one session: the caller logs and skips, it
/// never aborts the run.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The owning process exited or denied access before we could resolve it.
    #[error("process metadata unavailable: {0}")]
    ProcessUnavailable(String),

    /// The session disappeared between enumeration and the volume call.
    #[error("session is gone: {0}")]
    Gone(String),

    /// Any other platform error.
    #[error("platform call failed: {0}")]
    Platform(String),
}

/// A single audio session exposed by the platform.
pub trait AudioSession: Send + Sync {
    /// Resolve the key this session is matched under. Resolution may fail if
    /// the owning process is already gone; the session is then skipped.
    fn key(&self) -> Result<SessionKey>;

    /// Set the session's relative volume, `0.0..=1.0`.
    fn set_volume(&self, level: f32) -> Result<()>;
}

/// Receiver for new-session notifications.
///
/// Invoked by the platform on its own callback thread, possibly while the
/// platform holds internal locks: implementations must not block for
/// unbounded time and must never panic across the boundary.
pub trait SessionHandler: Send + Sync {
    fn on_session_created(&self, session: &dyn AudioSession);
}

/// Handle for an active new-session subscription.
pub trait SessionSubscription: Send {
    /// Cancel the subscription. Must be idempotent and must not race with an
    /// in-flight callback invocation.
    fn cancel(&mut self, reason: &str);
}

/// The platform session collaborator: enumeration, device volume, and
/// new-session notifications.
pub trait SessionProvider: Send + Sync {
    /// Enumerate the currently open sessions.
    fn sessions(&self) -> Result<Vec<Box<dyn AudioSession>>>;

    /// Set the device endpoint volume, `0.0..=1.0`.
    fn set_device_volume(&self, level: f32) -> Result<()>;

    /// Subscribe to new-session notifications.
    fn subscribe(&self, handler: Arc<dyn SessionHandler>) -> Result<Box<dyn SessionSubscription>>;
}

/// RAII wrapper around a `SessionSubscription`.
///
/// Cancels with [`STOP_REASON`] on drop; explicit `cancel` first is fine,
/// both paths are idempotent.
pub struct SubscriptionGuard {
    inner: Option<Box<dyn SessionSubscription>>,
}

impl SubscriptionGuard {
    pub fn new(inner: Box<dyn SessionSubscription>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn cancel(&mut self, reason: &str) {
        if let Some(mut subscription) = self.inner.take() {
            debug!(reason, "Cancelling session subscription");
            subscription.cancel(reason);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel(STOP_REASON);
    }
}

/// Applies the profile held by an [`ActiveProfileCell`] to audio sessions.
///
/// One applier serves both roles: the one-shot pass a setter performs over
/// everything currently open, and the per-session callback a waiter keeps
/// registered for new sessions.
pub struct ProfileApplier {
    cell: Arc<ActiveProfileCell>,
}

impl ProfileApplier {
    pub fn new(cell: Arc<ActiveProfileCell>) -> Self {
        Self { cell }
    }

    pub fn cell(&self) -> &Arc<ActiveProfileCell> {
        &self.cell
    }

    /// Apply the active profile to the device and every open session.
    ///
    /// Each failing session degrades only itself: the error is logged and the
    /// pass continues.
    pub fn apply_all(&self, provider: &dyn SessionProvider) {
        let profile = self.cell.read();

        if let Some(level) = profile.device_level() {
            match provider.set_device_volume(level) {
                Ok(()) => info!(level, "Set volume of device"),
                Err(e) => warn!(error = %e, "Failed to set device volume"),
            }
        }

        let sessions = match provider.sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate sessions");
                return;
            }
        };

        for session in sessions {
            self.apply_session(&profile, session.as_ref());
        }
    }

    /// Register this applier for new-session notifications.
    pub fn subscribe(
        self: &Arc<Self>,
        provider: &dyn SessionProvider,
    ) -> Result<SubscriptionGuard> {
        let subscription = provider.subscribe(Arc::clone(self) as Arc<dyn SessionHandler>)?;
        debug!("Session subscription registered");
        Ok(SubscriptionGuard::new(subscription))
    }

    fn apply_session(&self, profile: &VolumeProfile, session: &dyn AudioSession) {
        let key = match session.key() {
            Ok(key) => key,
            Err(e) => {
                // Process exited or access denied: skip this session.
                warn!(error = %e, "Skipping session with unresolvable key");
                return;
            }
        };

        let Some(level) = profile.level_for(&key) else {
            return;
        };

        match session.set_volume(level) {
            Ok(()) => match &key {
                SessionKey::Device => info!(level, "Set volume of device"),
                SessionKey::System => info!(level, "Set volume of system sounds"),
                SessionKey::Process(path) => info!(level, path, "Set volume of session"),
            },
            Err(e) => warn!(error = %e, ?key, "Failed to set session volume"),
        }
    }
}

impl SessionHandler for ProfileApplier {
    /// Runs on the platform's callback thread: a wait-free cell read followed
    /// by one volume call. Errors are logged and swallowed so one failing
    /// session never terminates the notification stream.
    fn on_session_created(&self, session: &dyn AudioSession) {
        let profile = self.cell.read();
        self.apply_session(&profile, session);
    }
}
