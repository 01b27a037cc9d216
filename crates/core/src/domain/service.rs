//! Service lifecycle state machine
//!
//! Drives a worker through the host-visible lifecycle:
//!
//! - `StartPending` is reported before the worker starts, `Started` once it
//!   has, `StopPending` when a stop request arrives, and `Stopped` with the
//!   exit code at the end.
//! - The sequence is always linear and forward-only; a failed start skips
//!   `Started` and moves straight to the stop states, so the host is never
//!   told a dead worker is operational. Teardown always runs.
//! - Stop requests arrive asynchronously via [`ServiceController`] and are
//!   latched by [`StopFlag`], so a request before the runner reaches its wait
//!   is never lost.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

/// Wait hint reported alongside each pending state.
const PENDING_HINT: Duration = Duration::from_millis(1000);

/// States reported to the hosting environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Startup in progress. `checkpoint` increases across successive pending
    /// reports; `time_remaining` is the hint until the next report.
    StartPending {
        checkpoint: u32,
        time_remaining: Duration,
    },
    /// The worker is running and the service accepts stop requests.
    Started,
    /// Shutdown in progress.
    StopPending {
        checkpoint: u32,
        time_remaining: Duration,
    },
    /// Terminal. `exit_code` is zero on clean shutdown.
    Stopped { exit_code: u32 },
}

impl ServiceState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceState::Stopped { .. })
    }

    /// Stop requests are only honored once the service is up.
    pub fn accepts_stop(&self) -> bool {
        matches!(self, ServiceState::Started)
    }
}

/// A latching stop signal.
///
/// `set` wakes every waiter and stays set; `wait` returns immediately if the
/// flag was already set. Lock poisoning is ignored since the guarded value is
/// a plain bool that is valid in either state.
#[derive(Debug, Default)]
pub struct StopFlag {
    state: Mutex<bool>,
    signal: Condvar,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut stopped = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.signal.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the flag is set.
    pub fn wait(&self) {
        let mut stopped = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            stopped = self
                .signal
                .wait(stopped)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Cloneable handle for requesting a stop from another thread or a platform
/// control callback. `stop` never blocks and never panics.
#[derive(Debug, Clone)]
pub struct ServiceController {
    stop: Arc<StopFlag>,
}

impl ServiceController {
    pub fn stop(&self) {
        debug!("Stop requested");
        self.stop.set();
    }
}

/// The long-running work hosted by the service.
pub trait ServiceWorker {
    /// Bring the worker up. Must return promptly; long-running work happens
    /// on threads the worker owns.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Tear the worker down, joining any threads it spawned.
    fn stop(&mut self) -> anyhow::Result<()>;
}

/// Sink for lifecycle state reports, e.g. a service control manager or a
/// console logger.
pub trait ServiceHost: Send + Sync {
    fn report(&self, state: &ServiceState) -> anyhow::Result<()>;
}

/// Drives a [`ServiceWorker`] through the full lifecycle.
pub struct ServiceRunner<W> {
    worker: W,
    stop: Arc<StopFlag>,
}

impl<W: ServiceWorker> ServiceRunner<W> {
    pub fn new(worker: W) -> Self {
        Self {
            worker,
            stop: Arc::new(StopFlag::new()),
        }
    }

    /// Handle for signalling the runner to stop, safe to hand to other
    /// threads before `run` is called.
    pub fn controller(&self) -> ServiceController {
        ServiceController {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Run the lifecycle to completion and return the exit code.
    ///
    /// A worker failure does not short-circuit teardown: the stop states are
    /// still reported and `worker.stop` still runs, only the exit code
    /// reflects the failure. A failed start skips the `Started` report.
    pub fn run(mut self, host: &dyn ServiceHost) -> u32 {
        let mut failed = false;
        let mut checkpoint = 0;

        self.report(
            host,
            &ServiceState::StartPending {
                checkpoint,
                time_remaining: PENDING_HINT,
            },
            &mut failed,
        );
        checkpoint += 1;

        match self.worker.start() {
            Ok(()) => {
                self.report(host, &ServiceState::Started, &mut failed);
                info!("Service started");
                self.stop.wait();
            }
            Err(e) => {
                error!(error = %e, "Worker failed to start");
                failed = true;
            }
        }

        self.report(
            host,
            &ServiceState::StopPending {
                checkpoint,
                time_remaining: PENDING_HINT,
            },
            &mut failed,
        );

        if let Err(e) = self.worker.stop() {
            error!(error = %e, "Worker failed to stop cleanly");
            failed = true;
        }

        let exit_code = u32::from(failed);
        self.report(host, &ServiceState::Stopped { exit_code }, &mut failed);
        info!(exit_code, "Service stopped");
        exit_code
    }

    fn report(&self, host: &dyn ServiceHost, state: &ServiceState, failed: &mut bool) {
        if let Err(e) = host.report(state) {
            error!(error = %e, ?state, "Failed to report service state");
            *failed = true;
        }
    }
}
