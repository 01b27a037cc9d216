//! Integration tests for setter/waiter coordination
//!
//! These tests exercise the complete flow across crates: claiming the waiter
//! channel, applying profiles through the simulated backend, switching the
//! active profile over the channel, and the full service lifecycle.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use volprof_core::{
    ProfileSet, ServiceHost, ServiceRunner, ServiceState, SessionProvider, ServiceWorker,
    VolumeProfile, STOP_REASON,
};
use volprof_infra::ipc::{Registry, RegistryError, SwitchProfileRequest, POLL_INTERVAL};
use volprof_infra::{SimulatedSessions, Waiter};

const CONFIG: &str = r#"
[gaming]
controls = [
    { suffix = ":device", volume = 0.8 },
    { suffix = "chrome.exe", volume = 0.2 },
]

[movie]
controls = [
    { suffix = ":device", volume = 0.5 },
    { suffix = "chrome.exe", volume = 0.9 },
    { suffix = ":system", volume = 0.1 },
]
"#;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, CONFIG).unwrap();
    path
}

fn load(path: &std::path::Path, name: &str) -> VolumeProfile {
    ProfileSet::load(path).unwrap().require(name).unwrap().clone()
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// ============================================================================
// CHANNEL ELECTION TESTS
// ============================================================================

#[test]
fn test_election_has_exactly_one_owner() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(Registry::new(dir.path()));

    let claims: Vec<_> = (0..6)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.try_become_waiter("election"))
        })
        .collect();

    let results: Vec<_> = claims.into_iter().map(|c| c.join().unwrap()).collect();
    let owners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(owners, 1);

    // Every loser got the already-exists answer, not an i/o error.
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, RegistryError::AlreadyExists { .. }));
        }
    }
}

#[test]
fn test_loser_can_reach_the_winner() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::new(dir.path());

    let owner = registry.try_become_waiter("election").unwrap();
    assert!(matches!(
        registry.try_become_waiter("election"),
        Err(RegistryError::AlreadyExists { .. })
    ));

    let sender = registry.try_open_existing("election").unwrap();
    let request = SwitchProfileRequest::new("gaming", "/tmp/config.toml");
    sender.send(&request).unwrap();

    // The message arrives within one poll interval.
    let received = owner.receive(POLL_INTERVAL).unwrap();
    assert_eq!(received, Some(request));
}

// ============================================================================
// END-TO-END SWITCH TESTS
// ============================================================================

#[test]
fn test_switch_reaches_new_sessions_only() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let registry = Registry::new(dir.path());
    let endpoint = registry.try_become_waiter("e2e").unwrap();

    let sessions = SimulatedSessions::new();
    let provider: Arc<dyn SessionProvider> = Arc::new(sessions.clone());
    let mut waiter = Waiter::new(load(&config, "gaming"), provider, endpoint);

    sessions.spawn_session(r"C:\apps\chrome.exe");
    sessions.add_system_session();
    waiter.start().unwrap();

    // Setter pass over everything currently open.
    waiter.apply_current();
    assert_eq!(sessions.device_volume(), Some(0.8));
    assert_eq!(sessions.volume_of(r"C:\apps\chrome.exe"), Some(0.2));
    // No :system control in the gaming profile.
    assert_eq!(sessions.system_volume(), None);

    // Switch over the channel.
    let sender = registry.try_open_existing("e2e").unwrap();
    sender
        .send(&SwitchProfileRequest::new("movie", &config))
        .unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        waiter.cell().read().device_level() == Some(0.5)
    }));

    // The already-open session keeps its old volume.
    assert_eq!(sessions.volume_of(r"C:\apps\chrome.exe"), Some(0.2));

    // A session created after the switch gets the new profile.
    sessions.spawn_session(r"C:\other\chrome.exe");
    assert!(wait_until(Duration::from_secs(3), || {
        sessions.volume_of(r"C:\other\chrome.exe") == Some(0.9)
    }));

    waiter.stop().unwrap();
}

#[test]
fn test_broken_session_does_not_block_others() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let registry = Registry::new(dir.path());
    let endpoint = registry.try_become_waiter("e2e").unwrap();

    let sessions = SimulatedSessions::new();
    let provider: Arc<dyn SessionProvider> = Arc::new(sessions.clone());
    let waiter = Waiter::new(load(&config, "gaming"), provider, endpoint);

    sessions.spawn_broken_session();
    sessions.spawn_session(r"C:\apps\chrome.exe");
    waiter.apply_current();

    assert_eq!(sessions.volume_of(r"C:\apps\chrome.exe"), Some(0.2));
}

// ============================================================================
// SERVICE LIFECYCLE TESTS
// ============================================================================

#[derive(Default)]
struct RecordingHost {
    states: Mutex<Vec<ServiceState>>,
}

impl ServiceHost for RecordingHost {
    fn report(&self, state: &ServiceState) -> anyhow::Result<()> {
        self.states.lock().unwrap().push(state.clone());
        Ok(())
    }
}

#[test]
fn test_waiter_under_service_runner() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let registry = Registry::new(dir.path());
    let endpoint = registry.try_become_waiter("svc").unwrap();

    let sessions = SimulatedSessions::new();
    let provider: Arc<dyn SessionProvider> = Arc::new(sessions.clone());
    let waiter = Waiter::new(load(&config, "gaming"), provider, endpoint);

    let runner = ServiceRunner::new(waiter);
    let controller = runner.controller();
    let host = Arc::new(RecordingHost::default());

    let run = {
        let host = Arc::clone(&host);
        thread::spawn(move || runner.run(host.as_ref()))
    };

    // Sessions created while the service runs pick up the profile.
    assert!(wait_until(Duration::from_secs(3), || {
        matches!(
            host.states.lock().unwrap().last(),
            Some(ServiceState::Started)
        )
    }));
    sessions.spawn_session(r"C:\apps\chrome.exe");
    assert!(wait_until(Duration::from_secs(3), || {
        sessions.volume_of(r"C:\apps\chrome.exe") == Some(0.2)
    }));

    controller.stop();
    let exit_code = run.join().unwrap();
    assert_eq!(exit_code, 0);

    // Clean teardown: linear state sequence, subscription cancelled with the
    // stop reason, channel name released.
    let states = host.states.lock().unwrap();
    assert_eq!(states.len(), 4);
    assert!(matches!(states[0], ServiceState::StartPending { .. }));
    assert_eq!(states[1], ServiceState::Started);
    assert!(matches!(states[2], ServiceState::StopPending { .. }));
    assert_eq!(states[3], ServiceState::Stopped { exit_code: 0 });
    assert_eq!(sessions.cancel_reasons(), vec![STOP_REASON.to_string()]);
    assert!(registry.try_become_waiter("svc").is_ok());
}

#[test]
fn test_stop_during_startup_is_honored() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let registry = Registry::new(dir.path());
    let endpoint = registry.try_become_waiter("svc").unwrap();

    let provider: Arc<dyn SessionProvider> = Arc::new(SimulatedSessions::new());
    let waiter = Waiter::new(load(&config, "gaming"), provider, endpoint);

    let runner = ServiceRunner::new(waiter);
    // Request arrives before run() is even called; it must not be lost.
    runner.controller().stop();

    let host = RecordingHost::default();
    assert_eq!(runner.run(&host), 0);
    assert!(host.states.lock().unwrap().last().unwrap().is_stopped());
}
