// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The fixed, ordered list of known patches.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::PatchContext;
use crate::error::PatchError;
use crate::Stage;

/// The body of a patch.
///
/// A body must be safe to re-run to completion given its own prior partial
/// effects: the process can crash after the body succeeds but before the
/// patch is recorded as applied, in which case the body runs again on the next
/// start.
#[async_trait]
pub trait Patch<S>: Send + Sync {
    /// Runs the patch. `name` is the name the patch is registered under.
    async fn run(&self, name: &str, ctx: &PatchContext<'_, S>) -> Result<(), anyhow::Error>;
}

/// The signature of a patch body written as a plain function.
pub type PatchFnPtr<S> =
    for<'a> fn(&'a str, &'a PatchContext<'a, S>) -> BoxFuture<'a, Result<(), anyhow::Error>>;

/// A [`Patch`] whose body is a plain function.
pub struct PatchFn<S>(pub PatchFnPtr<S>);

#[async_trait]
impl<S: Sync> Patch<S> for PatchFn<S> {
    async fn run(&self, name: &str, ctx: &PatchContext<'_, S>) -> Result<(), anyhow::Error> {
        (self.0)(name, ctx).await
    }
}

/// A named patch and the stage it runs in.
pub struct PatchDescriptor<S> {
    name: &'static str,
    stage: Stage,
    body: Box<dyn Patch<S>>,
}

impl<S> PatchDescriptor<S> {
    pub fn new(name: &'static str, stage: Stage, body: impl Patch<S> + 'static) -> Self {
        PatchDescriptor {
            name,
            stage,
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn body(&self) -> &dyn Patch<S> {
        &*self.body
    }
}

impl<S> fmt::Debug for PatchDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchDescriptor")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// The ordered sequence of every known patch.
///
/// The registry is built once and never mutated. Only ever append to the list
/// it is built from: never remove entries and never re-order them, since
/// partially upgraded clusters rely on the recorded names of earlier patches.
pub struct Registry<S> {
    patches: Vec<PatchDescriptor<S>>,
}

impl<S> fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.patches).finish()
    }
}

impl<S> Registry<S> {
    /// Creates a registry from `patches`, in order.
    ///
    /// The registry is not validated here; see [`Registry::validate`].
    pub fn new(patches: Vec<PatchDescriptor<S>>) -> Registry<S> {
        Registry { patches }
    }

    /// Checks the registry for configuration defects: a name registered more
    /// than once, or a patch without a stage.
    pub fn validate(&self) -> Result<(), PatchError> {
        let mut seen = BTreeSet::new();
        for patch in &self.patches {
            if !patch.stage.is_set() {
                return Err(PatchError::NoStage {
                    name: patch.name.to_owned(),
                });
            }
            if !seen.insert(patch.name) {
                return Err(PatchError::DuplicatePatch {
                    name: patch.name.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Returns the names of all patches, in registry order.
    ///
    /// Patches without a stage are defined incorrectly and are left out.
    pub fn patch_names(&self) -> Vec<&'static str> {
        self.patches
            .iter()
            .filter(|patch| patch.stage.is_set())
            .map(|patch| patch.name)
            .collect()
    }

    /// Returns the names of the patches that run in `stage`, in registry
    /// order.
    pub fn stage_names(&self, stage: Stage) -> Vec<&'static str> {
        self.patches
            .iter()
            .filter(|patch| patch.stage == stage)
            .map(|patch| patch.name)
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&PatchDescriptor<S>> {
        self.patches.iter().find(|patch| patch.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchDescriptor<S>> {
        self.patches.iter()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}
