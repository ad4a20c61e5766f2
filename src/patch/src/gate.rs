// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The entry points the bootstrap sequence calls between subsystems.

use std::fmt;
use std::sync::Mutex;

use tracing::info;

use crate::error::PatchError;
use crate::runner::PatchRunner;
use crate::Stage;

/// Enforces that patch stages are entered in increasing order.
///
/// Stages may be skipped, but never revisited: once a stage has completed,
/// entering it or any earlier stage fails with
/// [`PatchError::StageOutOfOrder`]. A stage that fails is not considered
/// completed.
pub struct StageGate<'a, S> {
    runner: PatchRunner<'a, S>,
    completed: Mutex<Option<Stage>>,
}

impl<S> fmt::Debug for StageGate<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageGate")
            .field("runner", &self.runner)
            .field("completed", &self.completed)
            .finish()
    }
}

impl<'a, S: Sync> StageGate<'a, S> {
    pub fn new(runner: PatchRunner<'a, S>) -> Self {
        StageGate {
            runner,
            completed: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &PatchRunner<'a, S> {
        &self.runner
    }

    /// The latest stage that completed successfully.
    pub fn completed(&self) -> Option<Stage> {
        *self.completed.lock().expect("poisoned")
    }

    /// Applies the pending patches of `stage`.
    pub async fn enter(&self, stage: Stage) -> Result<Vec<String>, PatchError> {
        if let Some(completed) = self.completed() {
            if stage <= completed {
                return Err(PatchError::StageOutOfOrder {
                    requested: stage,
                    completed,
                });
            }
        }
        let applied = self.runner.apply_stage(stage).await?;
        *self.completed.lock().expect("poisoned") = Some(stage);
        info!(%stage, "entered patch stage");
        Ok(applied)
    }

    pub async fn pre_storage_init(&self) -> Result<Vec<String>, PatchError> {
        self.enter(Stage::PreStorageInit).await
    }

    pub async fn post_storage_init(&self) -> Result<Vec<String>, PatchError> {
        self.enter(Stage::PostStorageInit).await
    }

    pub async fn post_network_init(&self) -> Result<Vec<String>, PatchError> {
        self.enter(Stage::PostNetworkInit).await
    }
}
