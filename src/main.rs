//! flowtop - a per-interface network flow meter
//!
//! Captures packets on one or more interfaces, aggregates them into
//! bidirectional flow records over one-second windows, and publishes the
//! windows to an accounting hub consumed by print and webhook reporters.

mod api;
mod capture;
mod config;
mod core;
mod decoder;
mod notify;
mod utils;

use crate::capture::afpacket::AfpacketDriver;
use crate::capture::nflog;
use crate::capture::pcap::LibpcapDriver;
use crate::capture::{Direction, PacketDriver};
use crate::config::{Args, Config, EngineKind};
use crate::core::accounting::{Accounting, DEFAULT_RETENTION_SECS};
use crate::core::CaptureSession;
use crate::notify::print::PrintNotifier;
use crate::notify::webhook::WebhookNotifier;
use anyhow::Result;
use clap::Parser;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[tokio::main]
async fn main() {
    // The documented flag set is single-dash (`-engine`, `-l4`, ...);
    // normalize to the double-dash spelling clap understands.
    let args = Args::parse_from(config::normalize_args(std::env::args()));

    if args.show_version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    utils::logger::init_logging(Level::INFO);

    // Raw sockets and netlink group binds need root.
    if unsafe { libc::geteuid() } != 0 {
        error!("must run as root");
        process::exit(1);
    }

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            error!("args validation failed with err: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        error!("{:#}", err);
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let cpu_profile = match &config.profile.cpu_profile {
        Some(path) => {
            let guard = pprof::ProfilerGuardBuilder::default()
                .frequency(100)
                .build()?;
            info!("cpu profiling enabled, writing {} on exit", path.display());
            Some((guard, path.clone()))
        }
        None => None,
    };

    #[cfg(feature = "dhat-heap")]
    let _heap_profiler = config.profile.heap_profile.as_ref().map(|path| {
        info!("heap profiling enabled, writing {} on exit", path.display());
        dhat::Profiler::builder().file_name(path.clone()).build()
    });
    #[cfg(not(feature = "dhat-heap"))]
    if config.profile.heap_profile.is_some() {
        tracing::warn!("heap profiling requires a build with the dhat-heap feature");
    }

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (mut acct, publish_rx) = Accounting::new(DEFAULT_RETENTION_SECS);
    for iface in &config.capture.iface_list {
        acct.add_interface(iface);
    }
    let acct = Arc::new(acct);

    tasks.push(tokio::spawn({
        let acct = acct.clone();
        let cancel = cancel.clone();
        async move { acct.run_ingest(publish_rx, cancel).await }
    }));
    tasks.push(tokio::spawn({
        let acct = acct.clone();
        let cancel = cancel.clone();
        async move { acct.run_retention(cancel).await }
    }));

    match config.capture.engine {
        EngineKind::Libpcap | EngineKind::Afpacket => {
            for iface in &config.capture.iface_list {
                for direction in [Direction::Inbound, Direction::Outbound] {
                    let driver: Box<dyn PacketDriver> = match config.capture.engine {
                        EngineKind::Libpcap => {
                            Box::new(LibpcapDriver::open(iface, "", direction)?)
                        }
                        EngineKind::Afpacket => Box::new(AfpacketDriver::open(iface, direction)?),
                        EngineKind::Nflog => unreachable!("nflog handled below"),
                    };

                    let session = Arc::new(CaptureSession::new(
                        iface,
                        direction,
                        config.capture.decode_l4,
                        acct.sender(),
                    ));

                    tasks.push(tokio::spawn({
                        let session = session.clone();
                        let cancel = cancel.clone();
                        async move { session.run_rotate(cancel).await }
                    }));
                    tasks.push(tokio::task::spawn_blocking({
                        let cancel = cancel.clone();
                        move || session.run_capture(driver, cancel)
                    }));
                }
            }
        }
        EngineKind::Nflog => {
            for binding in &config.capture.nflog_bindings {
                let session = Arc::new(CaptureSession::new(
                    &binding.iface_name,
                    binding.direction,
                    config.capture.decode_l4,
                    acct.sender(),
                ));

                tasks.push(tokio::spawn({
                    let session = session.clone();
                    let cancel = cancel.clone();
                    async move { session.run_rotate(cancel).await }
                }));

                let mut driver = nflog::open_session_driver(session, binding.group_id)?;
                tasks.push(tokio::task::spawn_blocking({
                    let cancel = cancel.clone();
                    move || driver.run(cancel)
                }));
            }
        }
    }

    if config.http.enable {
        let addr = config.http.addr.clone();
        let port = config.http.port.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = api::serve(&addr, &port, cancel).await {
                error!("http server failed with err: {}", err);
            }
        }));
    }

    if config.print.enable {
        let notifier = PrintNotifier::new(
            acct.clone(),
            config.print.interval_secs,
            config.capture.decode_l4,
        );
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move { notifier.run(cancel).await }
        }));
    }

    if config.webhook.enable {
        let notifier = WebhookNotifier::new(acct.clone(), config.webhook.clone())?;
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move { notifier.run(cancel).await }
        }));
    }

    wait_for_shutdown_signal().await?;
    info!("received shutdown signal");
    cancel.cancel();

    for task in tasks {
        let _ = task.await;
    }

    if let Some((guard, path)) = cpu_profile {
        match guard.report().build() {
            Ok(report) => {
                let file = std::fs::File::create(&path)?;
                report.flamegraph(file)?;
                info!("cpu profile written to {}", path.display());
            }
            Err(err) => error!("failed to build cpu profile report with err: {}", err),
        }
    }

    info!("flowtop exit");
    Ok(())
}

/// Block until any of the shutdown signals arrives.
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sighup.recv() => {}
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }

    Ok(())
}
