// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The fleetd daemon.
//!
//! [`Daemon::start`] runs the bootstrap sequence: it opens the node and
//! cluster databases, then initializes the storage and network subsystems,
//! calling into the patch [`StageGate`] before storage, after storage and
//! after networks. The daemon only starts serving once every stage has
//! completed.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use fleet_db::cluster::NodeInfo;
use fleet_db::{ClusterDb, NodeDb};
use fleet_patch::{PatchRunner, ShutdownSignal, StageGate};

pub mod config;
pub mod gateway;
pub mod patches;

pub use crate::config::DaemonConfig;
use crate::gateway::Gateway;
use crate::patches::PatchState;

/// A started fleetd daemon.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    node: Arc<NodeDb>,
    cluster: Arc<ClusterDb>,
    leader_tx: watch::Sender<Option<String>>,
    applied: Vec<String>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Brings the daemon up, applying every pending patch on the way.
    ///
    /// Fails without serving if any patch fails. The patches applied before
    /// the failure stay recorded and are not re-run on the next start.
    pub async fn start(
        config: DaemonConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Daemon, anyhow::Error> {
        let db_dir = config.database_dir();
        let node = Arc::new(NodeDb::open(&db_dir).context("opening node database")?);
        let cluster = Arc::new(ClusterDb::open(&db_dir).context("opening cluster database")?);

        if let Some(address) = &config.cluster_address {
            node.set_cluster_address(address)
                .context("recording cluster address")?;
            if !address.is_empty() {
                register_node(&cluster, &config.server_name, address)?;
            }
        }

        let registry = patches::registry();
        registry.validate()?;

        if node.is_fresh() {
            // A new node has nothing to upgrade.
            for name in registry.patch_names() {
                node.mark_patch_applied(name)
                    .with_context(|| format!("marking patch {name:?} as applied"))?;
            }
            info!(
                patches = registry.len(),
                "fresh install, marked all patches as applied"
            );
        }

        let (leader_tx, leader_rx) = watch::channel(config.cluster_leader.clone());
        let gateway = Gateway::new(Arc::clone(&node), Arc::clone(&cluster), leader_rx);
        let state = PatchState::new(config.clone(), Arc::clone(&node), Arc::clone(&cluster));
        let runner = PatchRunner::new(registry, &state, &*node, &gateway)
            .with_barrier(config.barrier())
            .with_shutdown(shutdown.clone());
        let gate = StageGate::new(runner);

        let mut applied = gate.pre_storage_init().await?;
        init_storage(&config).await?;
        applied.extend(gate.post_storage_init().await?);
        init_networks(&state).await?;
        applied.extend(gate.post_network_init().await?);

        info!(applied = applied.len(), "daemon started");
        Ok(Daemon {
            config,
            node,
            cluster,
            leader_tx,
            applied,
            shutdown,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn node_db(&self) -> &Arc<NodeDb> {
        &self.node
    }

    pub fn cluster_db(&self) -> &Arc<ClusterDb> {
        &self.cluster
    }

    /// The names of the patches applied by this start, in application order.
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    /// Publishes the address of the elected cluster leader.
    pub fn set_leader(&self, address: Option<String>) {
        self.leader_tx.send_replace(address);
    }

    /// Serves until shutdown is requested.
    pub async fn serve(self) -> Result<(), anyhow::Error> {
        info!(var_dir = %self.config.var_dir.display(), "serving");
        self.shutdown.triggered().await;
        info!("shutting down");
        Ok(())
    }
}

/// Records this node in the cluster database if it is not there yet.
fn register_node(cluster: &ClusterDb, name: &str, address: &str) -> Result<(), anyhow::Error> {
    cluster.transaction(|tx| -> Result<(), anyhow::Error> {
        if let Some(NodeInfo { name: existing, .. }) = tx.node_by_address(address)? {
            if existing != name {
                warn!(
                    address,
                    existing = %existing,
                    configured = name,
                    "cluster address already registered under another name"
                );
            }
            return Ok(());
        }
        tx.create_node(name, address)
            .with_context(|| format!("registering node {name:?} at {address}"))?;
        Ok(())
    })
}

async fn init_storage(config: &DaemonConfig) -> Result<(), anyhow::Error> {
    let dir = config.storage_pools_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating storage pool directory {}", dir.display()))?;
    info!("storage initialized");
    Ok(())
}

/// Brings up every created network. A network that fails to come up is
/// marked unavailable rather than failing startup.
async fn init_networks(state: &PatchState) -> Result<(), anyhow::Error> {
    let dir = state.config.networks_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating network directory {}", dir.display()))?;

    let networks = state.cluster.transaction(|tx| tx.created_networks())?;
    for network in networks {
        let path = dir.join(&network.name);
        match tokio::fs::create_dir_all(&path).await {
            Ok(()) => state.networks.mark_available(&network.name),
            Err(err) => {
                warn!(network = %network.name, "failed starting network: {err}");
                state.networks.mark_unavailable(&network.name);
            }
        }
    }
    info!("networks initialized");
    Ok(())
}
