extern crate devmoded;

#[cfg(unix)]
use std::{fs::File, io::Write, os::fd::FromRawFd};
use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::{select, signal::unix::SignalKind};
use tracing::{error, info, warn};

use devmoded::{
    bus::{Bus, BusOptions},
    config::{self, MemStore},
    services_file,
};

/// Device-mode control daemon.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Connect to the session bus instead of the system bus.
    #[clap(long)]
    session: bool,

    /// XML file listing the services of interest to track.
    #[clap(long, value_parser)]
    services: Option<PathBuf>,

    /// Grace window in milliseconds before a stopped private peer is
    /// forgotten.
    #[clap(long, default_value_t = 500)]
    grace_ms: u64,

    /// File descriptor to which readiness notifications are sent.
    ///
    /// Once the daemon owns its bus name, it will print `READY=1\n` into
    /// this file descriptor and close it.
    ///
    /// This readiness notification mechanism which works on both systemd and s6.
    #[cfg(unix)]
    #[clap(long)]
    ready_fd: Option<i32>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    devmoded::tracing_subscriber::init();

    let args = Args::parse();

    let seeds = services_file::load(args.services.as_deref())?;
    let store = Arc::new(MemStore::new(config::default_settings()));
    let options = BusOptions {
        session: args.session,
        grace: Duration::from_millis(args.grace_ms),
        seeds,
    };
    let mut bus = Bus::connect(options, store).await?;

    #[cfg(unix)]
    if let Some(fd) = args.ready_fd {
        // SAFETY: We don't have any way to know if the fd is valid or not. The parent process is
        // responsible for passing a valid fd.
        let mut ready_file = unsafe { File::from_raw_fd(fd) };
        ready_file.write_all(b"READY=1\n")?;
    }

    let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate())?;

    select! {
        _ = sig_int.recv() => {
            info!("Received SIGINT, shutting down..");
        }
        _ = sig_term.recv() => {
            info!("Received SIGTERM, shutting down..");
        }
        res = bus.run() => match res {
            Ok(()) => warn!("Bus stopped, shutting down.."),
            Err(e) => error!("Bus stopped with an error: {}", e),
        }
    }

    if let Err(e) = bus.cleanup().await {
        error!("Failed to clean up: {}", e);
    }

    Ok(())
}
