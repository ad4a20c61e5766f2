// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Polling waits for cluster-wide conditions.
//!
//! Patches that mutate cluster-wide structures run their mutation on the
//! leader only, and the other members wait until they observe its effect.
//! Patches run once at startup, so the waits here poll at a fixed interval
//! rather than subscribe to changes. A wait blocks the startup of the node
//! performing it, and by default it has no timeout: a member that never
//! converges shows up as a repeated warning in the log.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::cluster::{ClusterView, ClusterViewError, Member};
use crate::context::{PatchContext, ShutdownSignal};

/// The default interval between two polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("shutdown requested while waiting for {what}")]
    Canceled { what: String },
    #[error("timed out after {elapsed:?} waiting for {what}")]
    TimedOut { what: String, elapsed: Duration },
    #[error("failed checking {what}")]
    Check {
        what: String,
        #[source]
        source: anyhow::Error,
    },
}

/// The role of this node with respect to leader-only patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// The node is not part of a cluster.
    Standalone,
    Leader,
    Follower,
}

/// What a patch body should do after [`Barrier::wait_for_leader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderDecision {
    /// This node is the leader, or is not clustered: apply the change.
    Apply,
    /// The change is already visible; there is nothing left to do.
    AlreadyDone,
}

/// Determines the role of this node.
pub async fn role(cluster: &dyn ClusterView) -> Result<NodeRole, anyhow::Error> {
    let leader = match cluster.leader_address().await {
        Ok(leader) => leader,
        Err(ClusterViewError::NotClustered) => return Ok(NodeRole::Standalone),
        Err(ClusterViewError::Other(e)) => return Err(e),
    };
    let local = cluster.local_cluster_address().await?;
    if local == leader {
        Ok(NodeRole::Leader)
    } else {
        Ok(NodeRole::Follower)
    }
}

/// A reusable polling wait.
#[derive(Debug, Clone)]
pub struct Barrier {
    interval: Duration,
    timeout: Option<Duration>,
}

impl Default for Barrier {
    fn default() -> Self {
        Barrier {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

impl Barrier {
    pub fn new(interval: Duration) -> Barrier {
        Barrier {
            interval,
            timeout: None,
        }
    }

    /// Gives up waiting after `timeout`, failing with
    /// [`BarrierError::TimedOut`].
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Barrier {
        self.timeout = timeout;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn start<'a>(&'a self, what: &'a str, shutdown: &'a ShutdownSignal) -> Wait<'a> {
        Wait {
            barrier: self,
            what,
            shutdown,
            start: Instant::now(),
        }
    }

    /// Polls `check` until it reports `true`.
    ///
    /// `what` describes the awaited condition for logs and errors. A warning
    /// is logged on every unsatisfied poll.
    pub async fn wait_until<F, Fut>(
        &self,
        what: &str,
        shutdown: &ShutdownSignal,
        mut check: F,
    ) -> Result<(), BarrierError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, anyhow::Error>>,
    {
        let wait = self.start(what, shutdown);
        loop {
            wait.check_canceled()?;
            if check().await.map_err(|e| wait.check_failed(e))? {
                return Ok(());
            }
            wait.pause().await?;
        }
    }

    /// Waits until this node may apply a leader-only change for `patch`.
    ///
    /// `done` reports whether the change is already in effect, in which case
    /// no node needs to apply it. Otherwise the leader, or a node that is not
    /// clustered, is told to apply the change, and every other node polls
    /// until the change shows up.
    pub async fn wait_for_leader<S, F, Fut>(
        &self,
        patch: &str,
        ctx: &PatchContext<'_, S>,
        mut done: F,
    ) -> Result<LeaderDecision, BarrierError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, anyhow::Error>>,
    {
        let what = format!("{patch:?} patch to be applied on leader cluster member");
        let wait = self.start(&what, &ctx.shutdown);
        loop {
            wait.check_canceled()?;
            if done().await.map_err(|e| wait.check_failed(e))? {
                return Ok(LeaderDecision::AlreadyDone);
            }
            match role(ctx.cluster).await.map_err(|e| wait.check_failed(e))? {
                NodeRole::Standalone | NodeRole::Leader => return Ok(LeaderDecision::Apply),
                NodeRole::Follower => wait.pause().await?,
            }
        }
    }

    /// Waits until every cluster member has the post-condition of `patch`.
    ///
    /// `missing` receives the current members and returns the ones that do
    /// not have the post-condition yet.
    pub async fn wait_for_members<S, F, Fut>(
        &self,
        patch: &str,
        ctx: &PatchContext<'_, S>,
        mut missing: F,
    ) -> Result<(), BarrierError>
    where
        F: FnMut(Vec<Member>) -> Fut,
        Fut: Future<Output = Result<Vec<Member>, anyhow::Error>>,
    {
        let what = format!("{patch:?} patch to be applied on all cluster members");
        let wait = self.start(&what, &ctx.shutdown);
        loop {
            wait.check_canceled()?;
            let members = ctx
                .cluster
                .members()
                .await
                .map_err(|e| wait.check_failed(e))?;
            let missing = missing(members).await.map_err(|e| wait.check_failed(e))?;
            if missing.is_empty() {
                info!("{patch:?} patch applied on all cluster members");
                return Ok(());
            }
            for member in &missing {
                warn!(member = %member.name, "cluster member has not applied {patch:?} yet");
            }
            wait.pause().await?;
        }
    }
}

/// The state of one in-progress wait.
struct Wait<'a> {
    barrier: &'a Barrier,
    what: &'a str,
    shutdown: &'a ShutdownSignal,
    start: Instant,
}

impl Wait<'_> {
    fn check_canceled(&self) -> Result<(), BarrierError> {
        if self.shutdown.is_triggered() {
            return Err(BarrierError::Canceled {
                what: self.what.into(),
            });
        }
        Ok(())
    }

    fn check_failed(&self, source: anyhow::Error) -> BarrierError {
        BarrierError::Check {
            what: self.what.into(),
            source,
        }
    }

    /// Sleeps until the next poll, unless the wait timed out or shutdown is
    /// requested in the meantime.
    async fn pause(&self) -> Result<(), BarrierError> {
        let elapsed = self.start.elapsed();
        if let Some(timeout) = self.barrier.timeout {
            if elapsed >= timeout {
                return Err(BarrierError::TimedOut {
                    what: self.what.into(),
                    elapsed,
                });
            }
        }
        warn!(elapsed = ?elapsed, "waiting for {}", self.what);

        tokio::select! {
            _ = tokio::time::sleep(self.barrier.interval) => Ok(()),
            _ = self.shutdown.triggered() => Err(BarrierError::Canceled {
                what: self.what.into(),
            }),
        }
    }
}
