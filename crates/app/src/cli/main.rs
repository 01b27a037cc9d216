//! Volprof CLI Application

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use volprof_core::{
    default_config_path, ActiveProfileCell, ProfileApplier, ProfileSet, ServiceHost,
    ServiceRunner, ServiceState, ServiceWorker, SessionProvider, VolumeProfile,
};
use volprof_infra::ipc::{Registry, RegistryError, SwitchProfileRequest, WAITER_CHANNEL};
use volprof_infra::{SimulatedSessions, Waiter};

#[derive(Parser, Debug)]
#[command(name = "volprof")]
#[command(about = "Per-application volume profiles", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a profile to the device and all open audio sessions
    Apply {
        /// Profile name from the configuration file
        profile: String,

        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stay running and apply the profile to sessions as they appear
        #[arg(short, long)]
        wait: bool,
    },

    /// Run the waiter under a service host
    Serve {
        /// Profile name to start with
        profile: String,

        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the profiles defined in the configuration file
    List {
        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Reports lifecycle states through the log when no real service manager is
/// attached.
struct ConsoleHost;

impl ServiceHost for ConsoleHost {
    fn report(&self, state: &ServiceState) -> anyhow::Result<()> {
        tracing::info!(?state, "Service state");
        Ok(())
    }
}

fn config_path(config: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => Ok(default_config_path()?),
    }
}

fn load(config: Option<PathBuf>, profile: &str) -> anyhow::Result<(PathBuf, VolumeProfile)> {
    let path = config_path(config)?;
    let set = ProfileSet::load(&path)?;
    let profile = set.require(profile)?.clone();
    Ok((path, profile))
}

fn backend() -> Arc<SimulatedSessions> {
    Arc::new(SimulatedSessions::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version land here too; only real usage errors
            // exit nonzero, and with 1 rather than clap's default 2.
            let code = i32::from(e.use_stderr());
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    match cli.command {
        Command::Apply {
            profile,
            config,
            wait: false,
        } => apply(profile, config),
        Command::Apply {
            profile,
            config,
            wait: true,
        } => apply_and_wait(profile, config).await,
        Command::Serve { profile, config } => serve(profile, config).await,
        Command::List { config } => list(config),
    }
}

/// One-shot setter: apply everywhere now, then hand the profile off to a
/// running waiter if there is one.
fn apply(profile: String, config: Option<PathBuf>) -> anyhow::Result<()> {
    let (path, loaded) = load(config, &profile)?;

    let backend = backend();
    let applier = ProfileApplier::new(Arc::new(ActiveProfileCell::new(loaded)));
    applier.apply_all(backend.as_ref() as &dyn SessionProvider);

    match Registry::system().try_open_existing(WAITER_CHANNEL) {
        Ok(sender) => {
            sender.send(&SwitchProfileRequest::new(profile, path))?;
            tracing::info!("Notified running waiter");
        }
        Err(RegistryError::NotFound { .. }) => {
            tracing::debug!("No waiter running, nothing to notify");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Setter plus in-foreground waiter: claims the channel, applies the
/// profile, then services switch requests until enter is pressed.
async fn apply_and_wait(profile: String, config: Option<PathBuf>) -> anyhow::Result<()> {
    let (_path, loaded) = load(config, &profile)?;

    let endpoint = match Registry::system().try_become_waiter(WAITER_CHANNEL) {
        Ok(endpoint) => endpoint,
        Err(RegistryError::AlreadyExists { .. }) => {
            anyhow::bail!("a waiter process is already running");
        }
        Err(e) => return Err(e.into()),
    };

    let backend = backend();
    let mut waiter = Waiter::new(loaded, backend as Arc<dyn SessionProvider>, endpoint);
    waiter.apply_current();

    waiter.start()?;

    println!("press enter to stop");
    let stdin_line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)
    });
    tokio::select! {
        _ = stdin_line => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    waiter.stop()?;
    Ok(())
}

/// Run the waiter under the service lifecycle state machine.
async fn serve(profile: String, config: Option<PathBuf>) -> anyhow::Result<()> {
    let (_path, loaded) = load(config, &profile)?;

    let endpoint = match Registry::system().try_become_waiter(WAITER_CHANNEL) {
        Ok(endpoint) => endpoint,
        Err(RegistryError::AlreadyExists { .. }) => {
            anyhow::bail!("a waiter process is already running");
        }
        Err(e) => return Err(e.into()),
    };

    let backend = backend();
    let waiter = Waiter::new(loaded, backend as Arc<dyn SessionProvider>, endpoint);
    waiter.apply_current();

    let runner = ServiceRunner::new(waiter);
    let controller = runner.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            controller.stop();
        }
    });

    let exit_code = tokio::task::spawn_blocking(move || runner.run(&ConsoleHost))
        .await
        .context("service runner panicked")?;
    if exit_code != 0 {
        std::process::exit(exit_code as i32);
    }
    Ok(())
}

fn list(config: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path(config)?;
    let set = ProfileSet::load(&path)?;
    if set.is_empty() {
        println!("no profiles in {}", path.display());
        return Ok(());
    }
    for name in set.names() {
        println!("{name}");
    }
    Ok(())
}
