use std::{
    env,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use common::config::Config;
use dataserver::{ConsoleReport, LatestSnapshot, QueryServer, ReadLoop};
use pubsub::{Channel, Reader};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Log to stderr so the report on stdout stays readable, override with `RUST_LOG=debug`.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 1 {
        let program = args.first().map(String::as_str).unwrap_or("data_server");
        eprintln!("Usage: {program}");
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("could not load configuration")?;

    let channel = Channel::<Reader>::attach(&config.channel.name)
        .context("is the bag reader running?")?;

    let running = Arc::new(AtomicBool::new(true));
    ctrlc::set_handler({
        let running = running.clone();
        move || {
            tracing::info!("Received shutdown signal");
            running.store(false, Ordering::Relaxed);
        }
    })
    .context("could not install the Ctrl-C handler")?;

    let snapshot = LatestSnapshot::new();
    let server = QueryServer::spawn(&config.server.bind_address, snapshot.clone(), running.clone())
        .with_context(|| format!("could not bind {}", config.server.bind_address))?;

    let mut read_loop = ReadLoop::new(channel, config.server.period(), running);
    read_loop.add_sink(snapshot);
    if config.server.console {
        read_loop.add_sink(ConsoleReport::stdout());
    }

    read_loop.run();
    server.join();

    Ok(())
}
