// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

/// Durable record of the patches that completed on this node.
///
/// A record is written once per patch name, after the patch body returned
/// successfully, and is never updated or deleted.
#[async_trait]
pub trait AppliedPatchStore: Debug + Send + Sync {
    /// Returns the names of every patch recorded as applied.
    async fn list_applied(&self) -> Result<BTreeSet<String>, anyhow::Error>;

    /// Records that the patch `name` completed on this node.
    ///
    /// If this method returns `Ok`, the record is durable.
    async fn mark_applied(&self, name: &str) -> Result<(), anyhow::Error>;
}

#[async_trait]
impl<T: AppliedPatchStore + ?Sized> AppliedPatchStore for Arc<T> {
    async fn list_applied(&self) -> Result<BTreeSet<String>, anyhow::Error> {
        (**self).list_applied().await
    }

    async fn mark_applied(&self, name: &str) -> Result<(), anyhow::Error> {
        (**self).mark_applied(name).await
    }
}

/// An [`AppliedPatchStore`] that keeps its records in memory.
///
/// Useful for tests and for tools that simulate a startup without touching
/// the node database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    applied: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Returns a store that already records `names` as applied.
    pub fn with_applied<I, N>(names: I) -> MemoryStore
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let applied = names.into_iter().map(Into::into).collect();
        MemoryStore {
            applied: Arc::new(Mutex::new(applied)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.applied.lock().expect("poisoned").contains(name)
    }
}

#[async_trait]
impl AppliedPatchStore for MemoryStore {
    async fn list_applied(&self) -> Result<BTreeSet<String>, anyhow::Error> {
        Ok(self.applied.lock().expect("poisoned").clone())
    }

    async fn mark_applied(&self, name: &str) -> Result<(), anyhow::Error> {
        if !self.applied.lock().expect("poisoned").insert(name.to_owned()) {
            anyhow::bail!("patch {name:?} is already marked applied");
        }
        Ok(())
    }
}
