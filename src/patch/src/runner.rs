// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Applies the pending patches of a stage.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info};

use crate::barrier::Barrier;
use crate::cluster::ClusterView;
use crate::context::{PatchContext, ShutdownSignal};
use crate::error::PatchError;
use crate::registry::{PatchDescriptor, Registry};
use crate::store::AppliedPatchStore;
use crate::Stage;

/// The node-local lifecycle of a patch within the current process.
///
/// `Applied` is terminal and persisted. `Failed` is terminal for the current
/// process only; the next start sees the patch as `Pending` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchStatus {
    Pending,
    Running,
    Applied,
    Failed,
}

/// Runs patches from a [`Registry`] against durable state `S`.
///
/// Pending patches are identified by name, never by position: whatever names
/// the [`AppliedPatchStore`] holds are skipped, so a registry that gained
/// entries between restarts is handled the same as one that did not.
pub struct PatchRunner<'a, S> {
    registry: &'a Registry<S>,
    state: &'a S,
    store: &'a dyn AppliedPatchStore,
    cluster: &'a dyn ClusterView,
    barrier: Barrier,
    shutdown: ShutdownSignal,
    statuses: Mutex<BTreeMap<&'static str, PatchStatus>>,
}

impl<S> fmt::Debug for PatchRunner<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchRunner")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .field("cluster", &self.cluster)
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

impl<'a, S: Sync> PatchRunner<'a, S> {
    pub fn new(
        registry: &'a Registry<S>,
        state: &'a S,
        store: &'a dyn AppliedPatchStore,
        cluster: &'a dyn ClusterView,
    ) -> Self {
        PatchRunner {
            registry,
            state,
            store,
            cluster,
            barrier: Barrier::default(),
            shutdown: ShutdownSignal::never(),
            statuses: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sets the barrier patch bodies use for cluster coordination.
    pub fn with_barrier(mut self, barrier: Barrier) -> Self {
        self.barrier = barrier;
        self
    }

    /// Sets the shutdown signal handed to patch bodies.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn registry(&self) -> &'a Registry<S> {
        self.registry
    }

    /// Applies every pending patch of `stage`, in registry order.
    ///
    /// Returns the names of the patches applied by this call. On error, the
    /// patches applied before the failing one stay recorded, and no later
    /// patch runs.
    #[tracing::instrument(level = "info", skip_all, fields(stage = %stage))]
    pub async fn apply_stage(&self, stage: Stage) -> Result<Vec<String>, PatchError> {
        if !stage.is_set() {
            return Err(PatchError::InvalidStage(stage));
        }
        // A patch without a stage is a programming defect; refuse to run
        // anything rather than discover it halfway through.
        self.registry.validate()?;

        let applied = self
            .store
            .list_applied()
            .await
            .map_err(|source| PatchError::ListApplied { source })?;

        let mut newly_applied = Vec::new();
        for patch in self.registry.iter() {
            if patch.stage() != stage {
                continue;
            }
            if applied.contains(patch.name()) {
                self.set_status(patch.name(), PatchStatus::Applied);
                continue;
            }
            self.apply(patch).await?;
            newly_applied.push(patch.name().to_owned());
        }

        info!(applied = newly_applied.len(), "patch stage complete");
        Ok(newly_applied)
    }

    async fn apply(&self, patch: &PatchDescriptor<S>) -> Result<(), PatchError> {
        let name = patch.name();
        info!(patch = name, "applying patch");
        self.set_status(name, PatchStatus::Running);

        let ctx = PatchContext {
            state: self.state,
            applied: self.store,
            cluster: self.cluster,
            barrier: &self.barrier,
            shutdown: self.shutdown.clone(),
        };
        if let Err(source) = patch.body().run(name, &ctx).await {
            self.set_status(name, PatchStatus::Failed);
            return Err(PatchError::Apply {
                name: name.to_owned(),
                stage: patch.stage(),
                source,
            });
        }

        if let Err(source) = self.store.mark_applied(name).await {
            self.set_status(name, PatchStatus::Failed);
            return Err(PatchError::MarkApplied {
                name: name.to_owned(),
                source,
            });
        }
        self.set_status(name, PatchStatus::Applied);
        debug!(patch = name, "patch applied");
        Ok(())
    }

    /// The status of the patch `name` as observed by this runner.
    ///
    /// Patches this runner has not reached yet report `Pending`, even if they
    /// are recorded as applied on disk.
    pub fn status(&self, name: &str) -> Option<PatchStatus> {
        let patch = self.registry.get(name)?;
        let statuses = self.statuses.lock().expect("poisoned");
        Some(
            statuses
                .get(patch.name())
                .copied()
                .unwrap_or(PatchStatus::Pending),
        )
    }

    /// The status of every staged patch, in registry order.
    pub fn statuses(&self) -> Vec<(&'static str, PatchStatus)> {
        let statuses = self.statuses.lock().expect("poisoned");
        self.registry
            .patch_names()
            .into_iter()
            .map(|name| {
                let status = statuses.get(name).copied().unwrap_or(PatchStatus::Pending);
                (name, status)
            })
            .collect()
    }

    fn set_status(&self, name: &'static str, status: PatchStatus) {
        self.statuses.lock().expect("poisoned").insert(name, status);
    }
}
