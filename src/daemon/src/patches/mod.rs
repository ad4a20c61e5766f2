// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The patches shipped with fleetd.
//!
//! Only append to the list in [`registry`]: never remove entries and never
//! re-order them. Patches are one-time actions that fix up existing
//! configuration or move things around on disk. They must not be used to
//! change the database schema; use the migration lists in `fleet-db`
//! instead.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use fleet_db::{ClusterDb, NodeDb};
use fleet_patch::registry::PatchFnPtr;
use fleet_patch::{Patch, PatchContext, PatchDescriptor, PatchFn, Registry, Stage};

use crate::config::DaemonConfig;

mod cluster;
mod instance;
mod network;

/// The durable state patch bodies operate on.
#[derive(Debug)]
pub struct PatchState {
    pub config: DaemonConfig,
    pub node: Arc<NodeDb>,
    pub cluster: Arc<ClusterDb>,
    pub networks: NetworkHealth,
}

impl PatchState {
    pub fn new(config: DaemonConfig, node: Arc<NodeDb>, cluster: Arc<ClusterDb>) -> PatchState {
        PatchState {
            config,
            node,
            cluster,
            networks: NetworkHealth::default(),
        }
    }
}

/// Tracks networks that failed to come up.
#[derive(Debug, Default)]
pub struct NetworkHealth {
    unavailable: Mutex<BTreeSet<String>>,
}

impl NetworkHealth {
    pub fn mark_unavailable(&self, name: &str) {
        self.unavailable
            .lock()
            .expect("poisoned")
            .insert(name.to_owned());
    }

    pub fn mark_available(&self, name: &str) {
        self.unavailable.lock().expect("poisoned").remove(name);
    }

    /// Fails if any network is unavailable.
    ///
    /// Network patches run this first, as they may need to reach every
    /// network they change. Networks are only brought up after the
    /// post-storage-init stage, so the check can only fail for network
    /// patches of the post-network-init stage.
    pub fn pre_check(&self) -> Result<(), anyhow::Error> {
        let unavailable = self.unavailable.lock().expect("poisoned");
        if !unavailable.is_empty() {
            let names: Vec<_> = unavailable.iter().map(String::as_str).collect();
            anyhow::bail!("unavailable networks: {}", names.join(", "));
        }
        Ok(())
    }
}

/// A patch that changes networks. Runs the network pre-check before its body.
struct NetworkPatch(PatchFnPtr<PatchState>);

#[async_trait]
impl Patch<PatchState> for NetworkPatch {
    async fn run(
        &self,
        name: &str,
        ctx: &PatchContext<'_, PatchState>,
    ) -> Result<(), anyhow::Error> {
        ctx.state.networks.pre_check()?;
        (self.0)(name, ctx).await
    }
}

static REGISTRY: LazyLock<Registry<PatchState>> = LazyLock::new(|| {
    use Stage::*;
    Registry::new(vec![
        PatchDescriptor::new(
            "clustering_drop_database_role",
            PostStorageInit,
            PatchFn(cluster::drop_database_role),
        ),
        PatchDescriptor::new(
            "network_clear_bridge_volatile_hwaddr",
            PostStorageInit,
            NetworkPatch(network::clear_bridge_volatile_hwaddr),
        ),
        PatchDescriptor::new(
            "move_backups_instances",
            PostStorageInit,
            PatchFn(instance::move_backups_instances),
        ),
        PatchDescriptor::new(
            "network_fan_enable_nat",
            PostStorageInit,
            NetworkPatch(network::fan_enable_nat),
        ),
        PatchDescriptor::new(
            "vm_rename_uuid_key",
            PostStorageInit,
            PatchFn(instance::vm_rename_uuid_key),
        ),
        PatchDescriptor::new(
            "db_nodes_autoinc",
            PreStorageInit,
            PatchFn(cluster::db_nodes_autoinc),
        ),
        PatchDescriptor::new(
            "clustering_server_cert_trust",
            PreStorageInit,
            PatchFn(cluster::server_cert_trust),
        ),
        PatchDescriptor::new(
            "warnings_remove_empty_node",
            PostStorageInit,
            PatchFn(cluster::remove_warnings_with_empty_node),
        ),
        PatchDescriptor::new(
            "candid_rbac_remove_config_keys",
            PreStorageInit,
            PatchFn(cluster::remove_candid_rbac_config_keys),
        ),
        PatchDescriptor::new(
            "network_ovn_remove_routes",
            PostNetworkInit,
            NetworkPatch(network::ovn_remove_routes),
        ),
    ])
});

/// Returns the registry of every patch fleetd knows about.
pub fn registry() -> &'static Registry<PatchState> {
    &REGISTRY
}

/// A registered patch as reported by `fleetd patches`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchListing {
    pub name: &'static str,
    pub stage: Stage,
    pub applied: bool,
}

/// Lists every patch of `registry` with a valid stage, in registry order.
pub fn listing<S>(registry: &Registry<S>, applied: &BTreeSet<String>) -> Vec<PatchListing> {
    registry
        .iter()
        .filter(|patch| patch.stage().is_set())
        .map(|patch| PatchListing {
            name: patch.name(),
            stage: patch.stage(),
            applied: applied.contains(patch.name()),
        })
        .collect()
}
