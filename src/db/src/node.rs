// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The node-local database.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use fleet_patch::AppliedPatchStore;

use crate::error::{is_constraint_violation, Error, ErrorKind};
use crate::migrate::{self, Migration};

const APPLICATION_ID: i32 = 0x464c_4e44;

/// The config key holding the address this node uses for cluster traffic.
pub const CLUSTER_ADDRESS_KEY: &str = "cluster.https_address";

/// Schema migrations for the node database.
const MIGRATIONS: &[&dyn Migration] = &[
    // Creates initial schema.
    &"CREATE TABLE config (
         key   text PRIMARY KEY,
         value text NOT NULL
     );

     CREATE TABLE patches (
         id         integer PRIMARY KEY AUTOINCREMENT,
         name       text NOT NULL UNIQUE,
         applied_at integer NOT NULL DEFAULT (strftime('%s', 'now'))
     );",
    // Add new migrations here. Migrations must never be removed or edited
    // once released, only followed by new ones.
];

/// A patch recorded as applied on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedPatch {
    pub name: String,
    /// Seconds since the Unix epoch.
    pub applied_at: i64,
}

/// The database holding state that belongs to this node only.
///
/// The connection is shared behind a mutex; every operation holds it for the
/// duration of one transaction.
#[derive(Debug)]
pub struct NodeDb {
    path: PathBuf,
    fresh: bool,
    conn: Mutex<rusqlite::Connection>,
}

impl NodeDb {
    /// The file name of the node database within the database directory.
    pub const FILE_NAME: &'static str = "local.db";

    /// Opens the node database in `dir`, creating it if needed.
    pub fn open(dir: &Path) -> Result<NodeDb, Error> {
        std::fs::create_dir_all(dir).map_err(|source| {
            Error::new(ErrorKind::CreateDir {
                path: dir.to_owned(),
                source,
            })
        })?;
        let path = dir.join(Self::FILE_NAME);
        let (conn, fresh) = migrate::open(&path, APPLICATION_ID, MIGRATIONS)?;
        debug!(path = %path.display(), fresh, "opened node database");
        Ok(NodeDb {
            path,
            fresh,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reports whether the database file was created by this process.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Runs `f` within a transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise,
    /// including when `f` panics.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&NodeTx<'_>) -> Result<T, E>,
        E: From<Error>,
    {
        let mut conn = self.conn.lock().expect("poisoned");
        let tx = NodeTx {
            inner: conn.transaction().map_err(Error::from)?,
        };
        let value = f(&tx)?;
        tx.inner.commit().map_err(Error::from)?;
        Ok(value)
    }

    /// The address this node uses for cluster traffic, or the empty string if
    /// it is not clustered.
    pub fn cluster_address(&self) -> Result<String, Error> {
        self.transaction(|tx| Ok(tx.config_get(CLUSTER_ADDRESS_KEY)?.unwrap_or_default()))
    }

    pub fn set_cluster_address(&self, address: &str) -> Result<(), Error> {
        self.transaction(|tx| {
            tx.update_config(&BTreeMap::from([(
                CLUSTER_ADDRESS_KEY.to_owned(),
                address.to_owned(),
            )]))
        })
    }

    /// Returns every applied patch, in the order the patches were applied.
    pub fn applied_patches(&self) -> Result<Vec<AppliedPatch>, Error> {
        self.transaction(|tx| tx.applied_patches())
    }

    pub fn mark_patch_applied(&self, name: &str) -> Result<(), Error> {
        self.transaction(|tx| tx.mark_patch_applied(name))
    }
}

#[async_trait]
impl AppliedPatchStore for NodeDb {
    async fn list_applied(&self) -> Result<BTreeSet<String>, anyhow::Error> {
        Ok(self
            .applied_patches()?
            .into_iter()
            .map(|patch| patch.name)
            .collect())
    }

    async fn mark_applied(&self, name: &str) -> Result<(), anyhow::Error> {
        self.mark_patch_applied(name)?;
        Ok(())
    }
}

/// A transaction against the node database.
pub struct NodeTx<'a> {
    inner: rusqlite::Transaction<'a>,
}

impl NodeTx<'_> {
    pub fn config(&self) -> Result<BTreeMap<String, String>, Error> {
        self.inner
            .prepare("SELECT key, value FROM config")?
            .query_and_then(params![], |row| -> Result<_, Error> {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect()
    }

    pub fn config_get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self
            .inner
            .query_row(
                "SELECT value FROM config WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Sets each key in `changes` to its value. An empty value deletes the
    /// key.
    pub fn update_config(&self, changes: &BTreeMap<String, String>) -> Result<(), Error> {
        for (key, value) in changes {
            if value.is_empty() {
                self.inner
                    .execute("DELETE FROM config WHERE key = ?", params![key])?;
            } else {
                self.inner.execute(
                    "INSERT INTO config (key, value) VALUES (?, ?)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
        }
        Ok(())
    }

    pub fn applied_patches(&self) -> Result<Vec<AppliedPatch>, Error> {
        self.inner
            .prepare("SELECT name, applied_at FROM patches ORDER BY id")?
            .query_and_then(params![], |row| -> Result<_, Error> {
                Ok(AppliedPatch {
                    name: row.get(0)?,
                    applied_at: row.get(1)?,
                })
            })?
            .collect()
    }

    /// Records the patch `name` as applied. Each name can be recorded once.
    pub fn mark_patch_applied(&self, name: &str) -> Result<(), Error> {
        match self
            .inner
            .execute("INSERT INTO patches (name) VALUES (?)", params![name])
        {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(Error::new(
                ErrorKind::PatchAlreadyApplied(name.to_owned()),
            )),
            Err(err) => Err(err.into()),
        }
    }
}
