// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fleet_db::cluster::CertificateType;
use fleet_patch::{LeaderDecision, PatchContext};

use crate::patches::PatchState;

/// Clears the roles of every cluster member. The database role is no longer
/// recorded.
pub(super) fn drop_database_role<'a>(
    _name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        ctx.state.cluster.transaction(|tx| -> Result<(), anyhow::Error> {
            let members = tx.nodes().context("failed getting cluster members")?;
            for member in members {
                tx.update_node_roles(member.id, &[])?;
            }
            Ok(())
        })
    }
    .boxed()
}

const FOREIGN_KEYS_OFF: &str = "
PRAGMA foreign_keys = OFF;
PRAGMA legacy_alter_table = ON;
";

const FOREIGN_KEYS_ON: &str = "
PRAGMA foreign_keys = ON;
PRAGMA legacy_alter_table = OFF;
";

const NODES_AUTOINC: &str = "
BEGIN;

DROP TABLE IF EXISTS nodes_new;
CREATE TABLE nodes_new (
    id             integer PRIMARY KEY AUTOINCREMENT NOT NULL,
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

INSERT INTO nodes_new (id, name, description, address, schema, api_extensions, heartbeat, state, arch)
    SELECT id, name, description, address, schema, api_extensions, heartbeat, state, arch FROM nodes;

DROP TABLE nodes;
ALTER TABLE nodes_new RENAME TO nodes;

COMMIT;
";

/// Finishes a rebuild that was interrupted after the old table was dropped.
const NODES_AUTOINC_RENAME: &str = "
BEGIN;
ALTER TABLE nodes_new RENAME TO nodes;
COMMIT;
";

/// The state of the `nodes` table with respect to `db_nodes_autoinc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodesTable {
    Plain,
    Autoincrement,
    /// Only the rebuilt `nodes_new` table is left.
    Renaming,
}

fn nodes_table(state: &PatchState) -> Result<NodesTable, anyhow::Error> {
    match state.cluster.table_schema("nodes")? {
        Some(schema) if schema.contains("AUTOINCREMENT") => Ok(NodesTable::Autoincrement),
        Some(_) => Ok(NodesTable::Plain),
        None if state.cluster.table_schema("nodes_new")?.is_some() => Ok(NodesTable::Renaming),
        None => anyhow::bail!("cluster database has no nodes table"),
    }
}

fn nodes_autoincrement(state: &PatchState) -> Result<bool, anyhow::Error> {
    Ok(nodes_table(state)? == NodesTable::Autoincrement)
}

/// Re-creates the id column of the `nodes` table as AUTOINCREMENT.
///
/// Only the leader makes the change; the other members wait until they see
/// it. This is a patch rather than a schema migration because it needs
/// foreign keys disabled, which SQLite only allows outside a transaction.
/// The table statements themselves run in one transaction, and foreign keys
/// are re-enabled whether or not they succeed.
pub(super) fn db_nodes_autoinc<'a>(
    name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        let state = ctx.state;
        let decision = ctx
            .barrier
            .wait_for_leader(name, ctx, move || async move { nodes_autoincrement(state) })
            .await?;
        if decision == LeaderDecision::AlreadyDone {
            debug!("skipping {name:?} patch as nodes table id column is already AUTOINCREMENT");
            return Ok(());
        }
        let rebuild = match nodes_table(state)? {
            NodesTable::Renaming => {
                info!("resuming interrupted nodes table rebuild for {name:?} patch");
                NODES_AUTOINC_RENAME
            }
            NodesTable::Plain | NodesTable::Autoincrement => NODES_AUTOINC,
        };
        state
            .cluster
            .with_connection(|conn| {
                conn.execute_batch(FOREIGN_KEYS_OFF)?;
                let res = conn.execute_batch(rebuild);
                if res.is_err() && !conn.is_autocommit() {
                    if let Err(err) = conn.execute_batch("ROLLBACK") {
                        warn!("failed rolling back nodes table rebuild: {err}");
                    }
                }
                let restored = conn.execute_batch(FOREIGN_KEYS_ON);
                res.and(restored)
            })
            .context("failed recreating nodes table")?;
        Ok(())
    }
    .boxed()
}

/// The fingerprint of a PEM-encoded certificate.
pub(crate) fn fingerprint(certificate: &str) -> String {
    format!("{:x}", Sha256::digest(certificate.as_bytes()))
}

/// Adds this member's server certificate to the cluster trust store, then
/// waits until every member has done the same.
pub(super) fn server_cert_trust<'a>(
    name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        if !ctx.cluster.is_clustered().await? {
            return Ok(());
        }
        let state = ctx.state;

        let address = ctx.cluster.local_cluster_address().await?;
        let server_name = state
            .cluster
            .transaction(|tx| tx.node_by_address(&address))?
            .with_context(|| format!("no cluster member has address {address:?}"))?
            .name;

        let cert_path = state.config.server_cert_path();
        let certificate = tokio::fs::read_to_string(&cert_path)
            .await
            .with_context(|| format!("failed loading server certificate {}", cert_path.display()))?;
        let fingerprint = fingerprint(&certificate);

        info!("adding local server certificate to global trust store for {name:?} patch");
        state.cluster.transaction(|tx| {
            tx.ensure_server_certificate_trusted(&server_name, &fingerprint, &certificate)
        })?;
        info!("added local server certificate to global trust store for {name:?} patch");

        ctx.barrier
            .wait_for_members(name, ctx, move |members| async move {
                let trusted: BTreeSet<String> = state
                    .cluster
                    .transaction(|tx| tx.certificates())?
                    .into_iter()
                    .filter(|cert| cert.kind == CertificateType::Server)
                    .map(|cert| cert.name)
                    .collect();
                Ok(members
                    .into_iter()
                    .filter(|member| !trusted.contains(&member.name))
                    .collect())
            })
            .await?;

        info!(%fingerprint, "using server certificate for intra-cluster communication");
        Ok(())
    }
    .boxed()
}

/// Deletes warnings that are not tied to any member.
pub(super) fn remove_warnings_with_empty_node<'a>(
    _name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        ctx.state.cluster.transaction(|tx| -> Result<(), anyhow::Error> {
            for warning in tx.warnings()? {
                if warning.node.is_empty() {
                    tx.delete_warning(&warning.uuid)?;
                }
            }
            Ok(())
        })
    }
    .boxed()
}

const CANDID_RBAC_KEYS: &[&str] = &[
    "candid.api.url",
    "candid.api.key",
    "candid.expiry",
    "candid.domains",
    "rbac.api.url",
    "rbac.api.key",
    "rbac.expiry",
    "rbac.agent.url",
    "rbac.agent.username",
    "rbac.agent.private_key",
    "rbac.agent.public_key",
];

/// Removes the configuration of the retired Candid and RBAC integrations.
pub(super) fn remove_candid_rbac_config_keys<'a>(
    _name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        let changes: BTreeMap<String, String> = CANDID_RBAC_KEYS
            .iter()
            .map(|key| ((*key).to_owned(), String::new()))
            .collect();
        ctx.state
            .cluster
            .transaction(|tx| tx.update_config(&changes))
            .context("failed removing RBAC and Candid configuration keys")
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fleet_db::{ClusterDb, NodeDb};
    use fleet_patch::cluster::StaticClusterView;
    use fleet_patch::store::MemoryStore;
    use fleet_patch::{Barrier, ClusterView, Member, Shutdown, ShutdownSignal};

    use super::*;
    use crate::config::DaemonConfig;

    fn state(dir: &std::path::Path) -> Result<PatchState, anyhow::Error> {
        let config = DaemonConfig::new(dir);
        let node = Arc::new(NodeDb::open(&config.database_dir())?);
        let cluster = Arc::new(ClusterDb::open(&config.database_dir())?);
        Ok(PatchState::new(config, node, cluster))
    }

    fn context<'a>(
        state: &'a PatchState,
        store: &'a MemoryStore,
        cluster: &'a dyn ClusterView,
        barrier: &'a Barrier,
        shutdown: ShutdownSignal,
    ) -> PatchContext<'a, PatchState> {
        PatchContext {
            state,
            applied: store,
            cluster,
            barrier,
            shutdown,
        }
    }

    fn two_members() -> StaticClusterView {
        StaticClusterView {
            local_address: "10.0.0.1:8443".into(),
            leader_address: Some("10.0.0.1:8443".into()),
            members: vec![
                Member {
                    id: 1,
                    name: "node1".into(),
                    address: "10.0.0.1:8443".into(),
                },
                Member {
                    id: 2,
                    name: "node2".into(),
                    address: "10.0.0.2:8443".into(),
                },
            ],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nodes_autoinc_on_leader() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let state = state(dir.path())?;
        let (one, _) = state.cluster.transaction(|tx| -> Result<_, fleet_db::Error> {
            let one = tx.create_node("node1", "10.0.0.1:8443")?;
            let two = tx.create_node("node2", "10.0.0.2:8443")?;
            tx.update_node_roles(one, &[fleet_db::cluster::ClusterRole::EventHub])?;
            Ok((one, two))
        })?;

        let store = MemoryStore::new();
        let barrier = Barrier::default();
        let cluster = two_members();
        let ctx = context(&state, &store, &cluster, &barrier, ShutdownSignal::never());

        assert!(!nodes_autoincrement(&state)?);
        db_nodes_autoinc("db_nodes_autoinc", &ctx).await?;
        assert!(nodes_autoincrement(&state)?);
        // Running again is a no-op.
        db_nodes_autoinc("db_nodes_autoinc", &ctx).await?;

        let nodes = state.cluster.nodes()?;
        assert_eq!(nodes.len(), 2);
        let roles = state.cluster.transaction(|tx| tx.node_roles(one))?;
        assert_eq!(roles, vec![fleet_db::cluster::ClusterRole::EventHub]);

        // New members get fresh ids.
        let three = state
            .cluster
            .transaction(|tx| tx.create_node("node3", "10.0.0.3:8443"))?;
        assert_eq!(three, 3);
        Ok(())
    }

    #[tokio::test]
    async fn nodes_autoinc_resumes_interrupted_rebuild() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let state = state(dir.path())?;
        let one = state.cluster.transaction(|tx| -> Result<_, fleet_db::Error> {
            let one = tx.create_node("node1", "10.0.0.1:8443")?;
            tx.create_node("node2", "10.0.0.2:8443")?;
            tx.update_node_roles(one, &[fleet_db::cluster::ClusterRole::EventHub])?;
            Ok(one)
        })?;

        // A rebuild that stopped after dropping the old table.
        state.cluster.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = OFF;
                 CREATE TABLE nodes_new (
                     id             integer PRIMARY KEY AUTOINCREMENT NOT NULL,
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
                 INSERT INTO nodes_new SELECT * FROM nodes;
                 DROP TABLE nodes;
                 PRAGMA foreign_keys = ON;",
            )
        })?;
        assert!(state.cluster.table_schema("nodes")?.is_none());

        let store = MemoryStore::new();
        let barrier = Barrier::default();
        let cluster = two_members();
        let ctx = context(&state, &store, &cluster, &barrier, ShutdownSignal::never());
        db_nodes_autoinc("db_nodes_autoinc", &ctx).await?;

        assert!(nodes_autoincrement(&state)?);
        assert!(state.cluster.table_schema("nodes_new")?.is_none());
        assert_eq!(state.cluster.nodes()?.len(), 2);
        let roles = state.cluster.transaction(|tx| tx.node_roles(one))?;
        assert_eq!(roles, vec![fleet_db::cluster::ClusterRole::EventHub]);
        Ok(())
    }

    #[tokio::test]
    async fn nodes_autoinc_failure_keeps_table_and_foreign_keys() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let state = state(dir.path())?;
        state
            .cluster
            .transaction(|tx| tx.create_node("node1", "10.0.0.1:8443"))?;
        // `DROP TABLE` refuses to drop a view, failing the rebuild midway.
        state
            .cluster
            .with_connection(|conn| conn.execute_batch("CREATE VIEW nodes_new AS SELECT 1"))?;

        let store = MemoryStore::new();
        let barrier = Barrier::default();
        let cluster = two_members();
        let ctx = context(&state, &store, &cluster, &barrier, ShutdownSignal::never());
        let err = db_nodes_autoinc("db_nodes_autoinc", &ctx)
            .await
            .expect_err("rebuild fails");
        assert!(format!("{err:#}").contains("failed recreating nodes table"));

        assert!(!nodes_autoincrement(&state)?);
        assert_eq!(state.cluster.nodes()?.len(), 1);
        let (foreign_keys, autocommit) = state.cluster.with_connection(|conn| {
            let foreign_keys: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            Ok::<_, anyhow::Error>((foreign_keys, conn.is_autocommit()))
        })?;
        assert_eq!(foreign_keys, 1);
        assert!(autocommit);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn nodes_autoinc_follower_waits() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let state = state(dir.path())?;
        let store = MemoryStore::new();
        let barrier = Barrier::default();
        let follower = StaticClusterView {
            local_address: "10.0.0.2:8443".into(),
            ..two_members()
        };
        let shutdown = Shutdown::new();
        let ctx = context(&state, &store, &follower, &barrier, shutdown.signal());

        let wait = db_nodes_autoinc("db_nodes_autoinc", &ctx);
        let trigger = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            shutdown.trigger();
        };
        let (res, ()) = tokio::join!(wait, trigger);
        let err = res.expect_err("follower never sees the change");
        assert!(format!("{err:#}").contains("shutdown requested"));
        assert!(!nodes_autoincrement(&state)?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn server_cert_trust() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let state = state(dir.path())?;
        state.cluster.transaction(|tx| -> Result<(), fleet_db::Error> {
            tx.create_node("node1", "10.0.0.1:8443")?;
            tx.create_node("node2", "10.0.0.2:8443")?;
            Ok(())
        })?;
        tokio::fs::write(state.config.server_cert_path(), "node1 cert").await?;

        let store = MemoryStore::new();
        let barrier = Barrier::default().with_timeout(Some(Duration::from_secs(5)));
        let cluster = two_members();
        let ctx = context(&state, &store, &cluster, &barrier, ShutdownSignal::never());

        // node2 has not trusted its certificate yet.
        let err = super::server_cert_trust("clustering_server_cert_trust", &ctx)
            .await
            .expect_err("node2 never converges");
        assert!(format!("{err:#}").contains("timed out"));

        state.cluster.transaction(|tx| {
            tx.ensure_server_certificate_trusted("node2", &fingerprint("node2 cert"), "node2 cert")
        })?;
        super::server_cert_trust("clustering_server_cert_trust", &ctx).await?;

        let certs = state.cluster.transaction(|tx| tx.certificates())?;
        assert_eq!(certs.len(), 2);
        assert!(certs
            .iter()
            .any(|c| c.name == "node1" && c.fingerprint == fingerprint("node1 cert")));
        Ok(())
    }

    #[tokio::test]
    async fn server_cert_trust_standalone() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let state = state(dir.path())?;
        let store = MemoryStore::new();
        let barrier = Barrier::default();
        let cluster = StaticClusterView::standalone();
        let ctx = context(&state, &store, &cluster, &barrier, ShutdownSignal::never());

        // No certificate on disk is fine when not clustered.
        super::server_cert_trust("clustering_server_cert_trust", &ctx).await?;
        assert!(state.cluster.transaction(|tx| tx.certificates())?.is_empty());
        Ok(())
    }
}
