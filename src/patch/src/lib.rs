// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! One-time startup patches.
//!
//! Patches are one-time actions that bring the on-disk and database state of a
//! node into shape after a software upgrade. They run at startup, after the
//! database schema has been fully updated and before the daemon starts serving
//! requests or managed workloads. Patches can therefore assume a working
//! database, but nothing else.
//!
//! Patches are **not** a schema-migration mechanism. Schema changes belong to
//! the database layer's own migration list.
//!
//! Each patch is tagged with the [`Stage`] of daemon startup it must run in.
//! The [`StageGate`](gate::StageGate) is invoked once per stage by the
//! bootstrap sequence, and the [`PatchRunner`](runner::PatchRunner) applies
//! every pending patch of that stage in registry order, recording each success
//! in the [`AppliedPatchStore`] before moving on. A patch that fails is not
//! recorded and is retried from scratch on the next start.
//!
//! The [`Registry`](registry::Registry) is append-only: a patch name, once
//! released, is never removed, renamed or moved relative to other names.

use std::fmt;

use serde::Serialize;

pub mod barrier;
pub mod cluster;
pub mod context;
pub mod error;
pub mod gate;
pub mod registry;
pub mod runner;
pub mod store;

pub use crate::barrier::{Barrier, BarrierError, LeaderDecision, NodeRole};
pub use crate::cluster::{ClusterView, ClusterViewError, Member};
pub use crate::context::{PatchContext, Shutdown, ShutdownSignal};
pub use crate::error::PatchError;
pub use crate::gate::StageGate;
pub use crate::registry::{Patch, PatchDescriptor, PatchFn, Registry};
pub use crate::runner::{PatchRunner, PatchStatus};
pub use crate::store::AppliedPatchStore;

/// The phase of daemon startup in which a patch runs.
///
/// Stages are totally ordered by declaration: all patches of an earlier stage
/// complete before any patch of a later stage begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// No stage was set. A patch carrying this value is defined incorrectly
    /// and aborts startup.
    NoStage,
    /// Before the storage subsystem is initialized.
    PreStorageInit,
    /// After the storage subsystem is initialized.
    PostStorageInit,
    /// After the network subsystem is initialized.
    PostNetworkInit,
}

impl Stage {
    /// The stages a patch may run in, in execution order.
    pub const ALL: [Stage; 3] = [
        Stage::PreStorageInit,
        Stage::PostStorageInit,
        Stage::PostNetworkInit,
    ];

    /// Reports whether this is a stage a patch may run in.
    pub fn is_set(&self) -> bool {
        !matches!(self, Stage::NoStage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::NoStage => "no-stage",
            Stage::PreStorageInit => "pre-storage-init",
            Stage::PostStorageInit => "post-storage-init",
            Stage::PostNetworkInit => "post-network-init",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
