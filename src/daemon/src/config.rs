// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_patch::Barrier;

/// Configures a [`Daemon`](crate::Daemon).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// The directory holding all of the daemon's state.
    pub var_dir: PathBuf,
    /// The name this node is known by in the cluster.
    pub server_name: String,
    /// The address this node uses for cluster traffic. `None` keeps the
    /// address recorded in the node database.
    pub cluster_address: Option<String>,
    /// The address of the current cluster leader, if known.
    pub cluster_leader: Option<String>,
    /// How often cluster-wide waits re-check their condition.
    pub barrier_interval: Duration,
    /// How long cluster-wide waits may take before startup fails. `None`
    /// waits forever.
    pub barrier_timeout: Option<Duration>,
}

impl DaemonConfig {
    pub fn new(var_dir: impl Into<PathBuf>) -> DaemonConfig {
        DaemonConfig {
            var_dir: var_dir.into(),
            server_name: "none".into(),
            cluster_address: None,
            cluster_leader: None,
            barrier_interval: fleet_patch::barrier::DEFAULT_POLL_INTERVAL,
            barrier_timeout: None,
        }
    }

    pub fn var_path(&self, rest: impl AsRef<Path>) -> PathBuf {
        self.var_dir.join(rest)
    }

    pub fn database_dir(&self) -> PathBuf {
        self.var_path("database")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.var_path("backups")
    }

    pub fn storage_pools_dir(&self) -> PathBuf {
        self.var_path("storage-pools")
    }

    pub fn networks_dir(&self) -> PathBuf {
        self.var_path("networks")
    }

    /// The PEM-encoded certificate this node presents to other members.
    pub fn server_cert_path(&self) -> PathBuf {
        self.var_path("server.crt")
    }

    pub fn barrier(&self) -> Barrier {
        Barrier::new(self.barrier_interval).with_timeout(self.barrier_timeout)
    }
}
