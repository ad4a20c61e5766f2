// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster membership as seen from this node.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use fleet_db::{ClusterDb, NodeDb};
use fleet_patch::{ClusterView, ClusterViewError, Member};

/// Answers membership questions from the node and cluster databases.
///
/// The leader address is published by the membership machinery through a
/// watch channel; `None` means no leader has been elected yet.
#[derive(Debug, Clone)]
pub struct Gateway {
    node: Arc<NodeDb>,
    cluster: Arc<ClusterDb>,
    leader: watch::Receiver<Option<String>>,
}

impl Gateway {
    pub fn new(
        node: Arc<NodeDb>,
        cluster: Arc<ClusterDb>,
        leader: watch::Receiver<Option<String>>,
    ) -> Gateway {
        Gateway {
            node,
            cluster,
            leader,
        }
    }
}

#[async_trait]
impl ClusterView for Gateway {
    async fn local_cluster_address(&self) -> Result<String, anyhow::Error> {
        Ok(self.node.cluster_address()?)
    }

    async fn members(&self) -> Result<Vec<Member>, anyhow::Error> {
        Ok(self
            .cluster
            .nodes()?
            .into_iter()
            .map(Member::from)
            .collect())
    }

    async fn leader_address(&self) -> Result<String, ClusterViewError> {
        if self.local_cluster_address().await?.is_empty() {
            return Err(ClusterViewError::NotClustered);
        }
        let leader = self.leader.borrow().clone();
        leader.ok_or_else(|| anyhow::anyhow!("no cluster leader elected yet").into())
    }
}
