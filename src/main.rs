//! tunnel-hub
//!
//! Loads a configuration file, applies it to every subsystem and keeps it
//! applied: file changes and SIGHUP re-apply, SIGINT/SIGTERM shut down.
//!
//! ```text
//!   config.toml ──▶ loader ──▶ ConfigurationSnapshot ──▶ Executor::apply
//!        ▲                                                  │
//!        │ notify / SIGHUP                                   ▼
//!        └──────────────────────────────── tunnel, DNS, listeners, iptables, ...
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use tunnel_hub::config::loader::{default_home, load};
use tunnel_hub::config::watcher::ConfigWatcher;
use tunnel_hub::config::ConfigurationSnapshot;
use tunnel_hub::executor::Executor;
use tunnel_hub::lifecycle::signals::{self, Signal};
use tunnel_hub::lifecycle::startup::{start_metrics, Startup};
use tunnel_hub::lifecycle::Shutdown;
use tunnel_hub::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "tunnel-hub", version)]
#[command(about = "Applies proxy and tunnel configuration to a running hub", long_about = None)]
struct Cli {
    /// Configuration file (default: <home>/config.toml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Home directory for providers and the profile cache
    #[arg(short = 'd', long = "directory")]
    home: Option<PathBuf>,

    /// Test the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Do not reload when the configuration file changes
    #[arg(long)]
    no_watch: bool,

    /// Rebind port listeners on every reload
    #[arg(long)]
    force_on_reload: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let home = cli.home.clone().unwrap_or_else(default_home);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| home.join("config.toml"));

    let snapshot = match load(&config_path, &home) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Parse config error: {e}");
            process::exit(1);
        }
    };

    if cli.test {
        println!(
            "configuration file {} test is successful",
            config_path.display()
        );
        return Ok(());
    }

    let log = Arc::new(init_logging(snapshot.general.log_level));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), home = %home.display(), "tunnel-hub starting");
    start_metrics(&snapshot.general);

    let Startup {
        executor,
        mut connections,
    } = Startup::build(&home, log);
    let shutdown = Shutdown::new();

    // forwarding engine is not part of this binary
    let mut drain_stop = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                conn = connections.recv() => match conn {
                    Some(conn) => tracing::debug!(connection = ?conn, "Connection admitted"),
                    None => break,
                },
                _ = drain_stop.triggered() => break,
            }
        }
    });

    apply_or_exit(&executor, &snapshot, true).await;

    let (watcher, mut updates) = ConfigWatcher::new(&config_path, &home);
    let _watcher = if cli.no_watch {
        None
    } else {
        match watcher.run() {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable, reload with SIGHUP");
                None
            }
        }
    };

    let mut signals = signals::listen()?;
    let mut stop = shutdown.subscribe();

    loop {
        tokio::select! {
            Some(snapshot) = updates.recv() => {
                apply_or_exit(&executor, &snapshot, cli.force_on_reload).await;
            }
            Some(signal) = signals.recv() => match signal {
                Signal::Reload => match load(&config_path, &home) {
                    Ok(snapshot) => apply_or_exit(&executor, &snapshot, cli.force_on_reload).await,
                    Err(e) => tracing::error!(error = %e, "Failed to reload config. Keeping current configuration."),
                },
                Signal::Shutdown => shutdown.trigger(),
            },
            _ = stop.triggered() => break,
        }
    }

    executor.shutdown().await;
    Ok(())
}

async fn apply_or_exit(executor: &Executor, snapshot: &ConfigurationSnapshot, force: bool) {
    if let Err(e) = executor.apply(snapshot, force).await {
        tracing::error!(error = %e, "Apply failed, exiting");
        process::exit(e.exit_code());
    }
}
