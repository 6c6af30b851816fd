use clap::{App, Arg};
use colored::*;
use fieldpub::config::{DEFAULT_BRIDGE_HOSTNAME, DEFAULT_BRIDGE_PORT, PUBSUB_SITE};
use fieldpub::swarm::MqttQueue;
use fieldpub::{DeviceConfig, Pubber, PubberError, PubberOptions};
use fieldpub::{RestartPolicy, SwarmOptions, SwarmSupervisor};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("📡 Field Device Publisher");
    println!("=========================");

    let matches = App::new("fieldpub")
        .version("0.1.0")
        .about("Managed field device simulator")
        .arg(
            Arg::with_name("args")
                .help("Device config file, or: <project_id> <site_path> <device_id> <serial_no>")
                .multiple(true)
                .required(true),
        )
        .get_matches();

    let args: Vec<&str> = matches.values_of("args").unwrap_or_default().collect();
    match args.as_slice() {
        [config_file] => {
            let config = DeviceConfig::from_file(Path::new(config_file))?;
            run_single(config).await
        }
        [project_id, site_path, device_id, serial_no] => {
            if *site_path == PUBSUB_SITE {
                // In swarm mode the third argument names the bootstrap feed
                // subscription and the fourth is the instance count.
                run_swarm(project_id, device_id, serial_no).await
            } else {
                let config = DeviceConfig::for_device(project_id, site_path, device_id, serial_no);
                run_single(config).await
            }
        }
        _ => {
            eprintln!("{}", "Usage: fieldpub <config_file>".yellow());
            eprintln!(
                "{}",
                "       fieldpub <project_id> <site_path> <device_id> <serial_no>".yellow()
            );
            std::process::exit(1);
        }
    }
}

async fn run_single(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pubber = Pubber::initialize(PubberOptions::new(config)).await?;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    if !pubber.start_connection(done_tx).await {
        error!("No config received within the startup window");
        pubber.terminate().await;
        return Err(Box::new(PubberError::Handshake));
    }
    println!(
        "{} Device {} reporting",
        "✅".green(),
        pubber.device_id().bright_cyan()
    );

    tokio::select! {
        _ = done_rx.recv() => info!("Device {} finished", pubber.device_id()),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
    pubber.terminate().await;
    Ok(())
}

async fn run_swarm(
    project_id: &str,
    subscription: &str,
    count_arg: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let instance_count: u32 = count_arg
        .parse()
        .map_err(|_| format!("instance count must be a number, got {count_arg}"))?;

    let queue = MqttQueue::connect(subscription, DEFAULT_BRIDGE_HOSTNAME, DEFAULT_BRIDGE_PORT)
        .await?;
    let options = SwarmOptions {
        project_id: project_id.to_string(),
        instance_count,
        restart_policy: RestartPolicy::default(),
    };

    let supervisor = SwarmSupervisor::new(options, queue);
    let handles = supervisor.spawn_instances();
    println!(
        "{} Started all {} device instances",
        "✅".green(),
        handles.len().to_string().bright_cyan()
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping swarm");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
