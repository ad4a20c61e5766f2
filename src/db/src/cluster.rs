// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cluster-wide database.
//!
//! Every member of a cluster sees the same contents. Writes to tables that
//! other members read concurrently are made by the leader only; see
//! [`fleet_patch::Barrier::wait_for_leader`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use fleet_patch::Member;

use crate::error::{Error, ErrorKind};
use crate::migrate::{self, Migration};

const APPLICATION_ID: i32 = 0x464c_4347;

/// The project networks and instances belong to unless stated otherwise.
pub const DEFAULT_PROJECT: &str = "default";

/// Schema migrations for the cluster database.
const MIGRATIONS: &[&dyn Migration] = &[
    // Creates initial schema.
    //
    // The id column of `nodes` is made AUTOINCREMENT later by the
    // `db_nodes_autoinc` startup patch, which must disable foreign keys
    // outside of a transaction.
    &"CREATE TABLE nodes (
         id             integer PRIMARY KEY NOT NULL,
         name           text NOT NULL,
         description    text DEFAULT '',
         address        text NOT NULL,
         schema         integer NOT NULL DEFAULT 0,
         api_extensions integer NOT NULL DEFAULT 0,
         heartbeat      datetime DEFAULT CURRENT_TIMESTAMP,
         state          integer NOT NULL DEFAULT 0,
         arch           integer NOT NULL DEFAULT 1 CHECK (arch > 0),
         UNIQUE (name),
         UNIQUE (address)
     );

     CREATE TABLE nodes_roles (
         node_id integer NOT NULL REFERENCES nodes (id) ON DELETE CASCADE,
         role    integer NOT NULL,
         UNIQUE (node_id, role)
     );

     CREATE TABLE certificates (
         id          integer PRIMARY KEY AUTOINCREMENT NOT NULL,
         fingerprint text NOT NULL,
         type        integer NOT NULL,
         name        text NOT NULL,
         certificate text NOT NULL,
         UNIQUE (fingerprint)
     );

     CREATE TABLE config (
         key   text PRIMARY KEY,
         value text NOT NULL
     );

     CREATE TABLE warnings (
         id           integer PRIMARY KEY AUTOINCREMENT NOT NULL,
         node         text NOT NULL DEFAULT '',
         uuid         text NOT NULL,
         type_code    integer NOT NULL,
         last_message text NOT NULL,
         count        integer NOT NULL DEFAULT 1,
         UNIQUE (uuid)
     );

     CREATE TABLE networks (
         id          integer PRIMARY KEY AUTOINCREMENT NOT NULL,
         project     text NOT NULL,
         name        text NOT NULL,
         description text NOT NULL DEFAULT '',
         type        text NOT NULL,
         state       integer NOT NULL DEFAULT 0,
         UNIQUE (project, name)
     );

     CREATE TABLE networks_config (
         network_id integer NOT NULL REFERENCES networks (id) ON DELETE CASCADE,
         key        text NOT NULL,
         value      text NOT NULL,
         UNIQUE (network_id, key)
     );",
    // Adds instances, their snapshots, and their configuration.
    &"CREATE TABLE instances (
         id      integer PRIMARY KEY AUTOINCREMENT NOT NULL,
         project text NOT NULL,
         name    text NOT NULL,
         type    integer NOT NULL,
         UNIQUE (project, name)
     );

     CREATE TABLE instances_config (
         instance_id integer NOT NULL REFERENCES instances (id) ON DELETE CASCADE,
         key         text NOT NULL,
         value       text NOT NULL,
         UNIQUE (instance_id, key)
     );

     CREATE TABLE instances_snapshots (
         id          integer PRIMARY KEY AUTOINCREMENT NOT NULL,
         instance_id integer NOT NULL REFERENCES instances (id) ON DELETE CASCADE,
         name        text NOT NULL,
         UNIQUE (instance_id, name)
     );

     CREATE TABLE instances_snapshots_config (
         instance_snapshot_id integer NOT NULL
             REFERENCES instances_snapshots (id) ON DELETE CASCADE,
         key                  text NOT NULL,
         value                text NOT NULL,
         UNIQUE (instance_snapshot_id, key)
     );",
    // Add new migrations here. Migrations must never be removed or edited
    // once released, only followed by new ones.
];

/// A cluster member as recorded in the `nodes` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub address: String,
}

impl From<NodeInfo> for Member {
    fn from(node: NodeInfo) -> Member {
        Member {
            id: node.id,
            name: node.name,
            address: node.address,
        }
    }
}

// Codes for the integer-valued enums stored in the cluster database.
macro_rules! db_code {
    ($what:literal, $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        impl $name {
            pub fn code(&self) -> i64 {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            pub fn from_code(code: i64) -> Result<$name, Error> {
                match code {
                    $($code => Ok($name::$variant),)+
                    _ => Err(Error::new(ErrorKind::UnknownCode { what: $what, code })),
                }
            }
        }
    };
}

/// A role a cluster member can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterRole {
    /// Retired; members no longer record it.
    Database,
    EventHub,
    OvnChassis,
}

db_code!("cluster role", ClusterRole {
    Database = 0,
    EventHub = 1,
    OvnChassis = 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateType {
    Client,
    Server,
}

db_code!("certificate type", CertificateType {
    Client = 1,
    Server = 2,
});

/// A certificate in the cluster trust store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Certificate {
    pub id: i64,
    pub fingerprint: String,
    pub kind: CertificateType,
    pub name: String,
    pub certificate: String,
}

/// A warning raised by a cluster member, or by the cluster as a whole if
/// `node` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub id: i64,
    pub node: String,
    pub uuid: String,
    pub type_code: i64,
    pub last_message: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkState {
    Pending,
    Created,
    Errored,
}

db_code!("network state", NetworkState {
    Pending = 0,
    Created = 1,
    Errored = 2,
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub description: String,
    /// The network driver, such as `bridge` or `ovn`.
    pub kind: String,
    pub state: NetworkState,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    Container,
    VirtualMachine,
}

db_code!("instance type", InstanceType {
    Container = 0,
    VirtualMachine = 1,
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub kind: InstanceType,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: i64,
    pub instance_id: i64,
    pub name: String,
    pub config: BTreeMap<String, String>,
}

/// The database shared by all cluster members.
#[derive(Debug)]
pub struct ClusterDb {
    path: PathBuf,
    conn: Mutex<rusqlite::Connection>,
}

impl ClusterDb {
    /// The file name of the cluster database within the database directory.
    pub const FILE_NAME: &'static str = "global.db";

    /// Opens the cluster database in `dir`, creating it if needed.
    pub fn open(dir: &Path) -> Result<ClusterDb, Error> {
        std::fs::create_dir_all(dir).map_err(|source| {
            Error::new(ErrorKind::CreateDir {
                path: dir.to_owned(),
                source,
            })
        })?;
        let path = dir.join(Self::FILE_NAME);
        let (conn, fresh) = migrate::open(&path, APPLICATION_ID, MIGRATIONS)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        debug!(path = %path.display(), fresh, "opened cluster database");
        Ok(ClusterDb {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` within a transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back otherwise,
    /// including when `f` panics.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ClusterTx<'_>) -> Result<T, E>,
        E: From<Error>,
    {
        let mut conn = self.conn.lock().expect("poisoned");
        let tx = ClusterTx {
            inner: conn.transaction().map_err(Error::from)?,
        };
        let value = f(&tx)?;
        tx.inner.commit().map_err(Error::from)?;
        Ok(value)
    }

    /// Runs `f` against the raw connection, outside of any transaction.
    ///
    /// Only for changes SQLite refuses to make within a transaction, such as
    /// toggling `PRAGMA foreign_keys`.
    pub fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, E>,
    {
        let conn = self.conn.lock().expect("poisoned");
        f(&conn)
    }

    /// Returns the `CREATE` statement of the table `name`, if it exists.
    pub fn table_schema(&self, name: &str) -> Result<Option<String>, Error> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.transaction(|tx| tx.nodes())
    }
}

/// A transaction against the cluster database.
pub struct ClusterTx<'a> {
    inner: rusqlite::Transaction<'a>,
}

impl ClusterTx<'_> {
    /// Returns all cluster members, ordered by id.
    pub fn nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.inner
            .prepare("SELECT id, name, description, address FROM nodes ORDER BY id")?
            .query_and_then(params![], |row| -> Result<_, Error> {
                Ok(NodeInfo {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    address: row.get(3)?,
                })
            })?
            .collect()
    }

    /// Returns the member with cluster address `address`, if any.
    pub fn node_by_address(&self, address: &str) -> Result<Option<NodeInfo>, Error> {
        Ok(self
            .nodes()?
            .into_iter()
            .find(|node| node.address == address))
    }

    /// Adds a cluster member and returns its id.
    pub fn create_node(&self, name: &str, address: &str) -> Result<i64, Error> {
        self.inner.execute(
            "INSERT INTO nodes (name, address) VALUES (?, ?)",
            params![name, address],
        )?;
        Ok(self.inner.last_insert_rowid())
    }

    pub fn node_roles(&self, node_id: i64) -> Result<Vec<ClusterRole>, Error> {
        self.inner
            .prepare("SELECT role FROM nodes_roles WHERE node_id = ? ORDER BY role")?
            .query_and_then(params![node_id], |row| ClusterRole::from_code(row.get(0)?))?
            .collect()
    }

    /// Replaces the roles of the member `node_id` with `roles`.
    pub fn update_node_roles(&self, node_id: i64, roles: &[ClusterRole]) -> Result<(), Error> {
        let exists = self
            .inner
            .query_row(
                "SELECT 1 FROM nodes WHERE id = ?",
                params![node_id],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(Error::new(ErrorKind::NodeNotFound(node_id)));
        }
        self.inner
            .execute("DELETE FROM nodes_roles WHERE node_id = ?", params![node_id])?;
        for role in roles {
            self.inner.execute(
                "INSERT INTO nodes_roles (node_id, role) VALUES (?, ?)",
                params![node_id, role.code()],
            )?;
        }
        Ok(())
    }

    pub fn certificates(&self) -> Result<Vec<Certificate>, Error> {
        self.inner
            .prepare(
                "SELECT id, fingerprint, type, name, certificate FROM certificates ORDER BY id",
            )?
            .query_and_then(params![], |row| -> Result<_, Error> {
                Ok(Certificate {
                    id: row.get(0)?,
                    fingerprint: row.get(1)?,
                    kind: CertificateType::from_code(row.get(2)?)?,
                    name: row.get(3)?,
                    certificate: row.get(4)?,
                })
            })?
            .collect()
    }

    /// Adds a certificate to the trust store and returns its id.
    pub fn create_certificate(
        &self,
        kind: CertificateType,
        name: &str,
        fingerprint: &str,
        certificate: &str,
    ) -> Result<i64, Error> {
        self.inner.execute(
            "INSERT INTO certificates (fingerprint, type, name, certificate)
             VALUES (?, ?, ?, ?)",
            params![fingerprint, kind.code(), name, certificate],
        )?;
        Ok(self.inner.last_insert_rowid())
    }

    /// Ensures the server certificate of the member `name` is trusted.
    ///
    /// Any other server certificate recorded under the same name is replaced.
    /// Does nothing if the certificate is already trusted under that name.
    pub fn ensure_server_certificate_trusted(
        &self,
        name: &str,
        fingerprint: &str,
        certificate: &str,
    ) -> Result<(), Error> {
        let trusted = self.certificates()?.into_iter().any(|c| {
            c.kind == CertificateType::Server && c.name == name && c.fingerprint == fingerprint
        });
        if trusted {
            return Ok(());
        }
        self.inner.execute(
            "DELETE FROM certificates WHERE (type = ? AND name = ?) OR fingerprint = ?",
            params![CertificateType::Server.code(), name, fingerprint],
        )?;
        self.create_certificate(CertificateType::Server, name, fingerprint, certificate)?;
        Ok(())
    }

    pub fn warnings(&self) -> Result<Vec<Warning>, Error> {
        self.inner
            .prepare(
                "SELECT id, node, uuid, type_code, last_message, count
                 FROM warnings ORDER BY id",
            )?
            .query_and_then(params![], |row| -> Result<_, Error> {
                Ok(Warning {
                    id: row.get(0)?,
                    node: row.get(1)?,
                    uuid: row.get(2)?,
                    type_code: row.get(3)?,
                    last_message: row.get(4)?,
                    count: row.get(5)?,
                })
            })?
            .collect()
    }

    /// Records a warning and returns its UUID.
    pub fn create_warning(
        &self,
        node: &str,
        type_code: i64,
        message: &str,
    ) -> Result<String, Error> {
        let uuid = Uuid::new_v4().to_string();
        self.inner.execute(
            "INSERT INTO warnings (node, uuid, type_code, last_message) VALUES (?, ?, ?, ?)",
            params![node, uuid, type_code, message],
        )?;
        Ok(uuid)
    }

    pub fn delete_warning(&self, uuid: &str) -> Result<(), Error> {
        self.inner
            .execute("DELETE FROM warnings WHERE uuid = ?", params![uuid])?;
        Ok(())
    }

    pub fn config(&self) -> Result<BTreeMap<String, String>, Error> {
        self.inner
            .prepare("SELECT key, value FROM config")?
            .query_and_then(params![], |row| -> Result<_, Error> {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect()
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

    /// Creates a network and returns its id.
    pub fn create_network(
        &self,
        project: &str,
        name: &str,
        kind: &str,
        state: NetworkState,
        config: &BTreeMap<String, String>,
    ) -> Result<i64, Error> {
        self.inner.execute(
            "INSERT INTO networks (project, name, type, state) VALUES (?, ?, ?, ?)",
            params![project, name, kind, state.code()],
        )?;
        let id = self.inner.last_insert_rowid();
        self.insert_config("networks_config", "network_id", id, config)?;
        Ok(id)
    }

    /// Returns the names of the networks in `project`, in any state.
    pub fn network_names(&self, project: &str) -> Result<Vec<String>, Error> {
        self.inner
            .prepare("SELECT name FROM networks WHERE project = ? ORDER BY id")?
            .query_and_then(params![project], |row| -> Result<_, Error> { Ok(row.get(0)?) })?
            .collect()
    }

    /// Returns the network `name` of `project`, in any state.
    pub fn network(&self, project: &str, name: &str) -> Result<Network, Error> {
        self.networks_where("project = ? AND name = ?", params![project, name])?
            .pop()
            .ok_or_else(|| {
                Error::new(ErrorKind::NetworkNotFound {
                    project: project.to_owned(),
                    name: name.to_owned(),
                })
            })
    }

    /// Returns every network that was successfully created, in all projects.
    pub fn created_networks(&self) -> Result<Vec<Network>, Error> {
        self.networks_where("state = ?", params![NetworkState::Created.code()])
    }

    fn networks_where(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Network>, Error> {
        let networks = self
            .inner
            .prepare(&format!(
                "SELECT id, project, name, description, type, state FROM networks
                 WHERE {filter} ORDER BY id"
            ))?
            .query_and_then(args, |row| -> Result<_, Error> {
                Ok(Network {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    kind: row.get(4)?,
                    state: NetworkState::from_code(row.get(5)?)?,
                    config: BTreeMap::new(),
                })
            })?
            .collect::<Result<Vec<_>, Error>>()?;
        networks
            .into_iter()
            .map(|mut network| {
                network.config = self.load_config("networks_config", "network_id", network.id)?;
                Ok(network)
            })
            .collect()
    }

    /// Replaces the description and configuration of the network `name`.
    pub fn update_network(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let id = self.network(project, name)?.id;
        self.inner.execute(
            "UPDATE networks SET description = ? WHERE id = ?",
            params![description, id],
        )?;
        self.inner
            .execute("DELETE FROM networks_config WHERE network_id = ?", params![id])?;
        self.insert_config("networks_config", "network_id", id, config)
    }

    /// Creates an instance and returns its id.
    pub fn create_instance(
        &self,
        project: &str,
        name: &str,
        kind: InstanceType,
        config: &BTreeMap<String, String>,
    ) -> Result<i64, Error> {
        self.inner.execute(
            "INSERT INTO instances (project, name, type) VALUES (?, ?, ?)",
            params![project, name, kind.code()],
        )?;
        let id = self.inner.last_insert_rowid();
        self.insert_config("instances_config", "instance_id", id, config)?;
        Ok(id)
    }

    /// Returns every instance, in all projects.
    pub fn instances(&self) -> Result<Vec<Instance>, Error> {
        let instances = self
            .inner
            .prepare("SELECT id, project, name, type FROM instances ORDER BY id")?
            .query_and_then(params![], |row| -> Result<_, Error> {
                Ok(Instance {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    name: row.get(2)?,
                    kind: InstanceType::from_code(row.get(3)?)?,
                    config: BTreeMap::new(),
                })
            })?
            .collect::<Result<Vec<_>, Error>>()?;
        instances
            .into_iter()
            .map(|mut instance| {
                instance.config =
                    self.load_config("instances_config", "instance_id", instance.id)?;
                Ok(instance)
            })
            .collect()
    }

    /// Applies `changes` to the configuration of the instance `id`. An empty
    /// value deletes the key.
    pub fn update_instance_config(
        &self,
        id: i64,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.change_config("instances_config", "instance_id", id, changes)
    }

    /// Creates a snapshot of the instance `instance_id` and returns its id.
    pub fn create_snapshot(
        &self,
        instance_id: i64,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<i64, Error> {
        self.inner.execute(
            "INSERT INTO instances_snapshots (instance_id, name) VALUES (?, ?)",
            params![instance_id, name],
        )?;
        let id = self.inner.last_insert_rowid();
        self.insert_config(
            "instances_snapshots_config",
            "instance_snapshot_id",
            id,
            config,
        )?;
        Ok(id)
    }

    pub fn snapshots(&self, instance_id: i64) -> Result<Vec<Snapshot>, Error> {
        let snapshots = self
            .inner
            .prepare(
                "SELECT id, instance_id, name FROM instances_snapshots
                 WHERE instance_id = ? ORDER BY id",
            )?
            .query_and_then(params![instance_id], |row| -> Result<_, Error> {
                Ok(Snapshot {
                    id: row.get(0)?,
                    instance_id: row.get(1)?,
                    name: row.get(2)?,
                    config: BTreeMap::new(),
                })
            })?
            .collect::<Result<Vec<_>, Error>>()?;
        snapshots
            .into_iter()
            .map(|mut snapshot| {
                snapshot.config = self.load_config(
                    "instances_snapshots_config",
                    "instance_snapshot_id",
                    snapshot.id,
                )?;
                Ok(snapshot)
            })
            .collect()
    }

    /// Applies `changes` to the configuration of the snapshot `id`. An empty
    /// value deletes the key.
    pub fn update_snapshot_config(
        &self,
        id: i64,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.change_config(
            "instances_snapshots_config",
            "instance_snapshot_id",
            id,
            changes,
        )
    }

    fn load_config(
        &self,
        table: &str,
        column: &str,
        id: i64,
    ) -> Result<BTreeMap<String, String>, Error> {
        self.inner
            .prepare(&format!("SELECT key, value FROM {table} WHERE {column} = ?"))?
            .query_and_then(params![id], |row| -> Result<_, Error> {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect()
    }

    fn insert_config(
        &self,
        table: &str,
        column: &str,
        id: i64,
        config: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let mut stmt = self.inner.prepare(&format!(
            "INSERT INTO {table} ({column}, key, value) VALUES (?, ?, ?)"
        ))?;
        for (key, value) in config {
            stmt.execute(params![id, key, value])?;
        }
        Ok(())
    }

    fn change_config(
        &self,
        table: &str,
        column: &str,
        id: i64,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        for (key, value) in changes {
            self.inner.execute(
                &format!("DELETE FROM {table} WHERE {column} = ? AND key = ?"),
                params![id, key],
            )?;
            if !value.is_empty() {
                self.inner.execute(
                    &format!("INSERT INTO {table} ({column}, key, value) VALUES (?, ?, ?)"),
                    params![id, key, value],
                )?;
            }
        }
        Ok(())
    }
}
