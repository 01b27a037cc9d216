//! Active profile cell
//!
//! Holds the profile currently in force. The session-created callback reads
//! it on the platform's notification thread while the switch-profile handler
//! replaces it, so reads must be wait-free and a replacement must be atomic:
//! a reader observes either the old or the new profile in full, never a mix.

use crate::domain::profile::VolumeProfile;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::debug;

/// A mutually-exclusive, always-valid holder of the active profile.
///
/// Readers get an `Arc` snapshot and never block each other; a writer swaps
/// the whole profile in one atomic store. The cell is never empty.
#[derive(Debug)]
pub struct ActiveProfileCell {
    inner: ArcSwap<VolumeProfile>,
}

impl ActiveProfileCell {
    pub fn new(initial: VolumeProfile) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    /// Snapshot of the active profile, safe to use without further
    /// synchronization.
    pub fn read(&self) -> Arc<VolumeProfile> {
        self.inner.load_full()
    }

    /// Atomically replace the active profile.
    pub fn write(&self, profile: VolumeProfile) {
        self.inner.store(Arc::new(profile));
        debug!("Active profile replaced");
    }
}
