// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The read-only view of cluster membership that patches consult.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::Serialize;

/// A member of the cluster, as recorded in the cluster database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub address: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterViewError {
    /// This process is not part of a cluster.
    #[error("node is not clustered")]
    NotClustered,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Query surface exposed by the cluster membership machinery.
///
/// Every call reads the state at the moment it is made; nothing is cached
/// across calls.
#[async_trait]
pub trait ClusterView: Debug + Send + Sync {
    /// The cluster address of this node, or the empty string if the node is
    /// not clustered.
    async fn local_cluster_address(&self) -> Result<String, anyhow::Error>;

    /// The current cluster members, ordered by id.
    async fn members(&self) -> Result<Vec<Member>, anyhow::Error>;

    /// The address of the current leader.
    ///
    /// Fails with [`ClusterViewError::NotClustered`] when this node is not
    /// part of a cluster.
    async fn leader_address(&self) -> Result<String, ClusterViewError>;

    /// Reports whether this node is part of a cluster.
    async fn is_clustered(&self) -> Result<bool, anyhow::Error> {
        Ok(!self.local_cluster_address().await?.is_empty())
    }
}

/// A [`ClusterView`] over a fixed membership, for tests and single-node tools.
#[derive(Debug, Clone, Default)]
pub struct StaticClusterView {
    pub local_address: String,
    pub leader_address: Option<String>,
    pub members: Vec<Member>,
}

impl StaticClusterView {
    /// A view of a node that is not part of any cluster.
    pub fn standalone() -> StaticClusterView {
        StaticClusterView::default()
    }
}

#[async_trait]
impl ClusterView for StaticClusterView {
    async fn local_cluster_address(&self) -> Result<String, anyhow::Error> {
        Ok(self.local_address.clone())
    }

    async fn members(&self) -> Result<Vec<Member>, anyhow::Error> {
        Ok(self.members.clone())
    }

    async fn leader_address(&self) -> Result<String, ClusterViewError> {
        if self.local_address.is_empty() {
            return Err(ClusterViewError::NotClustered);
        }
        match &self.leader_address {
            Some(leader) => Ok(leader.clone()),
            None => Err(anyhow::anyhow!("no leader elected").into()),
        }
    }
}
