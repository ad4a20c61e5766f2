// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet_daemon::{patches, Daemon, DaemonConfig};
use fleet_db::NodeDb;
use fleet_patch::Shutdown;

/// The fleetd cluster daemon.
#[derive(Parser)]
struct Args {
    /// The directory holding the daemon's state.
    #[clap(
        long,
        env = "FLEETD_VAR_DIR",
        value_name = "PATH",
        default_value = "/var/lib/fleetd"
    )]
    var_dir: PathBuf,
    /// The name this node registers under when joining a cluster.
    #[clap(long, env = "FLEETD_SERVER_NAME", default_value = "none")]
    server_name: String,
    /// The address this node uses for cluster traffic. An empty value leaves
    /// the cluster.
    #[clap(long, env = "FLEETD_CLUSTER_ADDRESS", value_name = "HOST:PORT")]
    cluster_address: Option<String>,
    /// The address of the current cluster leader.
    #[clap(long, env = "FLEETD_CLUSTER_LEADER", value_name = "HOST:PORT")]
    cluster_leader: Option<String>,
    /// How often cluster-wide waits re-check their condition.
    #[clap(
        long,
        env = "FLEETD_BARRIER_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "1s"
    )]
    barrier_interval: Duration,
    /// How long cluster-wide waits may take before startup fails. Waits
    /// forever if unset.
    #[clap(long, env = "FLEETD_BARRIER_TIMEOUT", value_parser = humantime::parse_duration)]
    barrier_timeout: Option<Duration>,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon. This is the default.
    Run,
    /// List the patches this build knows about.
    Patches {
        /// Print the list as JSON.
        #[clap(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run(Args::parse()).await {
        eprintln!("fleetd: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FLEETD_LOG_FILTER").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DaemonConfig {
        var_dir: args.var_dir,
        server_name: args.server_name,
        cluster_address: args.cluster_address,
        cluster_leader: args.cluster_leader,
        barrier_interval: args.barrier_interval,
        barrier_timeout: args.barrier_timeout,
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Run => serve(config).await,
        Command::Patches { json } => list_patches(&config, json),
    }
}

async fn serve(config: DaemonConfig) -> Result<(), anyhow::Error> {
    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal");
        shutdown.trigger();
    });

    let daemon = Daemon::start(config, signal).await?;
    daemon.serve().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn list_patches(config: &DaemonConfig, json: bool) -> Result<(), anyhow::Error> {
    // Opening the node database would create it, and a node with a new
    // database skips every patch on its first start.
    let db_dir = config.database_dir();
    let applied: BTreeSet<String> = if db_dir.join(NodeDb::FILE_NAME).exists() {
        NodeDb::open(&db_dir)?
            .applied_patches()?
            .into_iter()
            .map(|patch| patch.name)
            .collect()
    } else {
        BTreeSet::new()
    };

    let entries = patches::listing(patches::registry(), &applied);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in entries {
            let status = if entry.applied { "applied" } else { "pending" };
            println!("{:<40} {:<20} {}", entry.name, entry.stage.as_str(), status);
        }
    }
    Ok(())
}
