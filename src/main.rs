//! wardend - host-resident service and file supervisor
//!
//! Polls a configured set of OS services, restarts the ones that have
//! stopped, notifies on restart, and watches a configured set of files,
//! diffing the ones in configuration format and hot-reloading its own
//! behavior when its own configuration changes.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use wardend::{config, daemon, logging, notifier, reload, supervise, watch, Result};

#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "Host-resident service and file supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the INI configuration file
    #[arg(short, long, global = true, env = "WARDEND_CONFIG", default_value = "./monitorCfg/config.ini")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run service mode attached to the current terminal instead of
    /// through the host's service manager
    #[arg(short, long, global = true)]
    foreground: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the systemd unit and enable it
    Install,

    /// Disable and remove the systemd unit
    Uninstall,

    /// Start the installed systemd unit
    Start,

    /// Stop the installed systemd unit
    Stop,

    /// Report whether the supervisor is active
    Status,

    /// Parse and report on a configuration file without running
    Validate {
        /// Configuration file to validate
        #[arg(value_name = "CONFIG")]
        path: PathBuf,
    },
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}

/// Three independent rotating streams, one per long-lived task, routed by
/// module path rather than split across separate subscribers: the
/// supervision engine, the file-watch engine, and the hot-reload
/// coordinator each get their own directory under the working directory.
fn init_file_tracing(level: &str, cap_mb: Option<u64>) -> Result<()> {
    use tracing_subscriber::filter::Targets;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let service_writer = logging::DayRollingWriter::new("./monitorServiceLog", cap_mb)?;
    let service_layer = fmt::layer()
        .with_writer(service_writer)
        .with_ansi(false)
        .with_filter(Targets::new().with_target("wardend::supervise", tracing::Level::TRACE));

    let file_writer = logging::DayRollingWriter::new("./monitorFileLog", cap_mb)?;
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(Targets::new().with_target("wardend::watch", tracing::Level::TRACE));

    let cfg_writer = logging::DayRollingWriter::new("./monitorCfgLog", cap_mb)?;
    let cfg_layer = fmt::layer()
        .with_writer(cfg_writer)
        .with_ansi(false)
        .with_filter(Targets::new().with_target("wardend::reload", tracing::Level::TRACE));

    tracing_subscriber::registry()
        .with(base)
        .with(service_layer)
        .with(file_layer)
        .with(cfg_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = log_level(cli.verbose);

    let Some(command) = cli.command else {
        return run(cli.config, level, cli.foreground).await;
    };

    match command {
        Commands::Install => {
            init_tracing(level);
            let binary = std::env::current_exe()?;
            daemon::HostAdapter::new().install(&binary, &cli.config)?;
            println!("installed wardend.service");
        },

        Commands::Uninstall => {
            init_tracing(level);
            daemon::HostAdapter::new().uninstall()?;
            println!("uninstalled wardend.service");
        },

        Commands::Start => {
            init_tracing(level);
            daemon::HostAdapter::new().start()?;
            println!("started wardend.service");
        },

        Commands::Stop => {
            init_tracing(level);
            daemon::HostAdapter::new().stop()?;
            println!("stopped wardend.service");
        },

        Commands::Status => {
            init_tracing(level);
            let active = daemon::HostAdapter::new().is_active();
            println!("wardend.service: {}", if active { "active" } else { "inactive" });

            let guard = daemon::PidGuard::new(&daemon::default_runtime_dir()?)?;
            println!(
                "foreground instance: {}",
                if guard.is_running() { "running" } else { "not running" }
            );
        },

        Commands::Validate { path } => {
            init_tracing(level);
            let snap = config::load(&path)?;
            println!("configuration valid");
            println!("machine name: {}", snap.machine_name);
            println!("specific services: {}", snap.specific_services.len());
            println!("partial patterns: {}", snap.partial_patterns.len());
            println!("watched directories: {}", snap.file_dirs.len());
            println!("refresh interval: {:?}", snap.refresh_interval);
        },
    }

    Ok(())
}

async fn run(config_path: PathBuf, level: &str, foreground: bool) -> Result<()> {
    let pid_guard = daemon::PidGuard::new(&daemon::default_runtime_dir()?)?;
    pid_guard.claim()?;

    let store = std::sync::Arc::new(config::Store::load(&config_path)?);
    let snap = store.current();

    if foreground {
        init_tracing(level);
    } else {
        init_file_tracing(level, snap.log_file_size_mb)?;
    }

    info!(config = %config_path.display(), "wardend starting");

    let notifier = std::sync::Arc::new(notifier::Notifier::new(snap.notifier.clone()));
    let manager = std::sync::Arc::new(wardend::supervise::service_handle::SystemctlManager);
    let supervise = supervise::SuperviseEngine::new(manager, notifier.clone(), snap.machine_name.clone());
    supervise.update(snap.specific_services.clone(), snap.partial_patterns.clone()).await;
    supervise.clone().spawn_poller();

    let initial_files = config::materialize_file_list(&snap);
    let (watch_engine, mut watch_events) = watch::FileWatchEngine::start(initial_files)?;

    let (stop_tx, mut stop_rx) = daemon::signals::setup_signal_handlers();

    reload::HotReloadCoordinator::spawn(
        store.clone(),
        supervise.clone(),
        watch_engine.clone(),
        notifier.clone(),
        stop_tx.clone(),
    )?;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                info!("shutdown signal received");
                break;
            }
            event = watch_events.recv() => {
                match event {
                    Some(watch::WatchEvent::ConfigChanged { new_path, diffs, .. }) => {
                        wardend::metrics::record_file_diff(diffs.len());
                        info!(path = %new_path.display(), sections = diffs.len(), "watched file changed");
                    }
                    Some(watch::WatchEvent::Raw { path, kind }) => {
                        info!(path = %path.display(), ?kind, "watched file event");
                    }
                    None => {
                        error!("file watch engine event channel closed unexpectedly");
                        break;
                    }
                }
            }
        }
    }

    supervise.stop();
    watch_engine.stop();
    pid_guard.release();
    Ok(())
}
