// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use tokio::sync::watch;

use crate::barrier::Barrier;
use crate::cluster::ClusterView;
use crate::store::AppliedPatchStore;

/// The handle a patch body runs against.
///
/// The context exposes only what a patch may depend on: the
/// durable state `S` (which provides scoped transactions), the applied-patch
/// records, the cluster view, the polling barrier, and the process shutdown
/// signal.
pub struct PatchContext<'a, S> {
    pub state: &'a S,
    pub applied: &'a dyn AppliedPatchStore,
    pub cluster: &'a dyn ClusterView,
    pub barrier: &'a Barrier,
    pub shutdown: ShutdownSignal,
}

impl<S> fmt::Debug for PatchContext<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchContext")
            .field("applied", &self.applied)
            .field("cluster", &self.cluster)
            .field("barrier", &self.barrier)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// The sending half of the process shutdown signal.
///
/// Shutdown works by creating a watch channel (which remembers only the last
/// value sent to it) and handing a receiver to everything that waits at
/// startup. Dropping the `Shutdown` does not trigger it.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (tx, _rx) = watch::channel(false);
        Shutdown { tx }
    }

    /// Returns a new receiver for the shutdown signal.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Requests shutdown. Every outstanding and future wait observes it.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

/// The receiving half of the process shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> ShutdownSignal {
        ShutdownSignal { rx: None }
    }

    /// Reports whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Completes once shutdown has been requested.
    ///
    /// If the sending half is dropped without triggering, this never
    /// completes.
    pub async fn triggered(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
