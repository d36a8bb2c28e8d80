use std::{env, process::ExitCode, sync::atomic::Ordering};

use anyhow::Context;
use common::config::Config;
use pubsub::{Channel, Writer};
use replayer::Replayer;
use rosbag::BagReader;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Log to stderr, override the level with `RUST_LOG=debug`.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        let program = args.first().map(String::as_str).unwrap_or("bag_reader");
        eprintln!("Usage: {program} <path_to_rosbag_db>");
        return ExitCode::FAILURE;
    }

    match run(&args[1]) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(bag_path: &str) -> anyhow::Result<()> {
    let config = Config::from_env().context("could not load configuration")?;

    let mut channel = Channel::<Writer>::create_or_attach(&config.channel.name)
        .context("could not create the telemetry channel")?;

    // on any error below the channel is dropped, which removes its name again
    let bag = BagReader::open(bag_path)?;

    let topics = bag.topics()?;
    for topic in &topics {
        tracing::info!(
            "Topic {} ({}): {} messages",
            topic.name,
            topic.type_name,
            topic.message_count
        );
    }

    let count = topics
        .iter()
        .find(|topic| topic.name == config.replay.topic)
        .map_or(0, |topic| topic.message_count);
    if count == 0 {
        tracing::warn!("No messages on topic {} in {bag_path}", config.replay.topic);
    } else {
        tracing::info!("Replaying {count} messages from {}", config.replay.topic);
    }

    let replayer = Replayer::new(config.replay.geometry, config.replay.pace());

    let running = replayer.running();
    ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal");
        running.store(false, Ordering::Relaxed);
    })
    .context("could not install the Ctrl-C handler")?;

    // rows are fetched while replaying, the bag is never loaded as a whole
    let stats = bag.with_messages(&config.replay.topic, |messages| {
        replayer.run(messages, &mut channel)
    })?;
    tracing::info!("Replay finished: {stats}");

    drop(channel);

    Ok(())
}
