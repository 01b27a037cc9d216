//! The waiter role
//!
//! A waiter holds the channel ownership token, keeps a new-session
//! subscription registered, and services switch-profile requests on a
//! background thread. It never re-applies a switched profile to sessions
//! that are already open; only sessions created afterwards pick it up.

use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use volprof_core::{
    load_profile, ActiveProfileCell, ProfileApplier, ServiceWorker, SessionProvider, StopFlag,
    SubscriptionGuard, VolumeProfile, STOP_REASON,
};

use crate::ipc::{WaiterEndpoint, POLL_INTERVAL};

/// Long-lived counterpart to one-shot setter invocations.
pub struct Waiter {
    applier: Arc<ProfileApplier>,
    provider: Arc<dyn SessionProvider>,
    endpoint: Option<WaiterEndpoint>,
    stop: Arc<StopFlag>,
    subscription: Option<SubscriptionGuard>,
    switch_thread: Option<JoinHandle<()>>,
}

impl Waiter {
    /// Build a waiter around an already-claimed channel endpoint.
    pub fn new(
        initial: VolumeProfile,
        provider: Arc<dyn SessionProvider>,
        endpoint: WaiterEndpoint,
    ) -> Self {
        let cell = Arc::new(ActiveProfileCell::new(initial));
        Self {
            applier: Arc::new(ProfileApplier::new(cell)),
            provider,
            endpoint: Some(endpoint),
            stop: Arc::new(StopFlag::new()),
            subscription: None,
            switch_thread: None,
        }
    }

    pub fn cell(&self) -> &Arc<ActiveProfileCell> {
        self.applier.cell()
    }

    /// Apply the active profile to the device and all open sessions once.
    pub fn apply_current(&self) {
        self.applier.apply_all(self.provider.as_ref());
    }

    fn run_switch_loop(endpoint: WaiterEndpoint, cell: Arc<ActiveProfileCell>, stop: Arc<StopFlag>) {
        while !stop.is_set() {
            let request = match endpoint.receive(POLL_INTERVAL) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Receive on waiter channel failed");
                    continue;
                }
            };

            match load_profile(&request.config_path, &request.profile) {
                Ok(profile) => {
                    info!(profile = %request.profile, "Switching active profile");
                    cell.write(profile);
                }
                Err(e) => {
                    // The previous profile stays in force.
                    warn!(error = %e, profile = %request.profile, "Rejected switch request");
                }
            }
        }
        // The endpoint drops here, releasing the channel name.
        debug!("Switch loop finished");
    }
}

impl ServiceWorker for Waiter {
    fn start(&mut self) -> anyhow::Result<()> {
        let endpoint = self
            .endpoint
            .take()
            .ok_or_else(|| anyhow::anyhow!("waiter was already started"))?;

        self.subscription = Some(self.applier.subscribe(self.provider.as_ref())?);

        let cell = Arc::clone(self.applier.cell());
        let stop = Arc::clone(&self.stop);
        self.switch_thread = Some(std::thread::spawn(move || {
            Self::run_switch_loop(endpoint, cell, stop);
        }));
        info!("Waiter started");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel(STOP_REASON);
        }
        self.stop.set();
        if let Some(thread) = self.switch_thread.take() {
            thread
                .join()
                .map_err(|_| anyhow::anyhow!("switch loop panicked"))?;
        }
        info!("Waiter stopped");
        Ok(())
    }
}
