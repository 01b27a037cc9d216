//! Simulated session backend
//!
//! An in-process stand-in for a platform audio stack. Sessions are spawned
//! by the caller, volumes are recorded instead of applied to hardware, and
//! new-session notifications are delivered from a dedicated pump thread like
//! a real platform callback would be.

use crossbeam::channel::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use tracing::debug;
use volprof_core::{
    AudioSession, SessionError, SessionHandler, SessionKey, SessionProvider, SessionSubscription,
};

/// Pending notifications buffered between spawner and pump thread.
const EVENT_CAPACITY: usize = 64;

struct SessionState {
    key: SessionKey,
    volume: Mutex<Option<f32>>,
    broken: bool,
}

struct SessionHandle(Arc<SessionState>);

impl AudioSession for SessionHandle {
    fn key(&self) -> volprof_core::session::Result<SessionKey> {
        if self.0.broken {
            return Err(SessionError::ProcessUnavailable(
                "simulated process exited".into(),
            ));
        }
        Ok(self.0.key.clone())
    }

    fn set_volume(&self, level: f32) -> volprof_core::session::Result<()> {
        if self.0.broken {
            return Err(SessionError::Gone("simulated session gone".into()));
        }
        *self.0.volume.lock().unwrap_or_else(|e| e.into_inner()) = Some(level);
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    device_volume: Mutex<Option<f32>>,
    sessions: Mutex<Vec<Arc<SessionState>>>,
    handler: Mutex<Option<Arc<dyn SessionHandler>>>,
    cancel_reasons: Mutex<Vec<String>>,
}

/// Cloneable backend handle; clones share the same simulated device.
#[derive(Clone)]
pub struct SimulatedSessions {
    shared: Arc<Shared>,
    events: Sender<Arc<SessionState>>,
}

impl SimulatedSessions {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let (events, receiver) = channel::bounded(EVENT_CAPACITY);
        spawn_pump(Arc::downgrade(&shared), receiver);
        Self { shared, events }
    }

    /// Open a session for a process at `path` and notify the subscriber.
    pub fn spawn_session(&self, path: impl Into<String>) {
        self.spawn(SessionState {
            key: SessionKey::Process(path.into()),
            volume: Mutex::new(None),
            broken: false,
        });
    }

    /// Open a session whose owning process is already gone; every call
    /// against it fails.
    pub fn spawn_broken_session(&self) {
        self.spawn(SessionState {
            key: SessionKey::Process(String::new()),
            volume: Mutex::new(None),
            broken: true,
        });
    }

    /// Open the system-sounds session.
    pub fn add_system_session(&self) {
        self.spawn(SessionState {
            key: SessionKey::System,
            volume: Mutex::new(None),
            broken: false,
        });
    }

    pub fn device_volume(&self) -> Option<f32> {
        *self
            .shared
            .device_volume
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Last volume applied to the session keyed by `path`, or the system
    /// session when `path` matches none.
    pub fn volume_of(&self, path: &str) -> Option<f32> {
        let sessions = self.shared.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .find(|s| s.key == SessionKey::Process(path.into()))
            .and_then(|s| *s.volume.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn system_volume(&self) -> Option<f32> {
        let sessions = self.shared.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .find(|s| s.key == SessionKey::System)
            .and_then(|s| *s.volume.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Reasons passed to subscription cancellations, in order.
    pub fn cancel_reasons(&self) -> Vec<String> {
        self.shared
            .cancel_reasons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn spawn(&self, state: SessionState) {
        let state = Arc::new(state);
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&state));
        // Ignore a closed pump; it only closes when the backend is dropped.
        let _ = self.events.send(state);
    }
}

impl Default for SimulatedSessions {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_pump(shared: Weak<Shared>, receiver: Receiver<Arc<SessionState>>) {
    thread::spawn(move || {
        // Ends when every backend clone has been dropped.
        while let Ok(state) = receiver.recv() {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            // The handler entry stays locked for the whole invocation, so a
            // cancel blocks until the in-flight callback has returned.
            let handler = shared.handler.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handler) = handler.as_ref() {
                handler.on_session_created(&SessionHandle(state));
            }
        }
        debug!("Simulated notification pump finished");
    });
}

struct SimulatedSubscription {
    shared: Weak<Shared>,
}

impl SessionSubscription for SimulatedSubscription {
    fn cancel(&mut self, reason: &str) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut handler = shared.handler.lock().unwrap_or_else(|e| e.into_inner());
        if handler.take().is_some() {
            shared
                .cancel_reasons
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(reason.to_string());
        }
    }
}

impl SessionProvider for SimulatedSessions {
    fn sessions(&self) -> volprof_core::session::Result<Vec<Box<dyn AudioSession>>> {
        let sessions = self.shared.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sessions
            .iter()
            .map(|s| Box::new(SessionHandle(Arc::clone(s))) as Box<dyn AudioSession>)
            .collect())
    }

    fn set_device_volume(&self, level: f32) -> volprof_core::session::Result<()> {
        *self
            .shared
            .device_volume
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(level);
        Ok(())
    }

    fn subscribe(
        &self,
        handler: Arc<dyn SessionHandler>,
    ) -> volprof_core::session::Result<Box<dyn SessionSubscription>> {
        *self
            .shared
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
        Ok(Box::new(SimulatedSubscription {
            shared: Arc::downgrade(&self.shared),
        }))
    }
}
