// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::path::Path;

use fleet_daemon::{patches, Daemon, DaemonConfig};
use fleet_db::cluster::{
    CertificateType, ClusterRole, InstanceType, NetworkState, DEFAULT_PROJECT,
};
use fleet_db::{ClusterDb, NodeDb};
use fleet_patch::ShutdownSignal;

fn kv(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn applied_names(node: &NodeDb) -> Result<Vec<String>, anyhow::Error> {
    Ok(node
        .applied_patches()?
        .into_iter()
        .map(|patch| patch.name)
        .collect())
}

/// Creates the node database of a node that predates every patch.
fn upgrading_node(config: &DaemonConfig) -> Result<(), anyhow::Error> {
    let node = NodeDb::open(&config.database_dir())?;
    assert!(node.is_fresh());
    Ok(())
}

/// Fills the cluster database with state every shipped patch changes.
fn seed_cluster(dir: &Path) -> Result<(), anyhow::Error> {
    let cluster = ClusterDb::open(dir)?;
    cluster.transaction(|tx| -> Result<(), anyhow::Error> {
        let node = tx.create_node("node1", "10.0.0.1:8443")?;
        tx.update_node_roles(node, &[ClusterRole::Database, ClusterRole::EventHub])?;

        tx.create_warning("", 1, "cluster wide")?;
        tx.create_warning("node1", 2, "node specific")?;

        tx.update_config(&kv(&[
            ("candid.api.url", "https://candid.example.com"),
            ("rbac.api.key", "secret"),
            ("core.https_address", ":8443"),
        ]))?;

        tx.create_network(
            DEFAULT_PROJECT,
            "br0",
            "bridge",
            NetworkState::Created,
            &kv(&[
                ("volatile.bridge.hwaddr", "00:16:3e:00:00:01"),
                ("ipv4.address", "10.1.0.1/24"),
            ]),
        )?;
        tx.create_network(
            DEFAULT_PROJECT,
            "fan0",
            "bridge",
            NetworkState::Created,
            &kv(&[("bridge.mode", "fan")]),
        )?;
        tx.create_network(
            DEFAULT_PROJECT,
            "ovn0",
            "ovn",
            NetworkState::Created,
            &kv(&[
                ("ipv4.routes.external", "192.0.2.0/24"),
                ("ipv6.routes.external", "2001:db8::/64"),
                ("bridge.mtu", "1442"),
            ]),
        )?;

        let vm = tx.create_instance(
            DEFAULT_PROJECT,
            "vm1",
            InstanceType::VirtualMachine,
            &kv(&[("volatile.vm.uuid", "vm1-uuid")]),
        )?;
        tx.create_snapshot(vm, "snap0", &kv(&[("volatile.vm.uuid", "snap0-uuid")]))?;
        tx.create_instance(
            DEFAULT_PROJECT,
            "c1",
            InstanceType::Container,
            &kv(&[("volatile.vm.uuid", "c1-uuid")]),
        )?;
        Ok(())
    })
}

#[tokio::test]
async fn test_fresh_install() -> Result<(), anyhow::Error> {
    let dir = tempfile::tempdir()?;
    let config = DaemonConfig::new(dir.path());
    std::fs::create_dir_all(config.backups_dir())?;
    std::fs::write(config.backups_dir().join("c1.tar.gz"), "backup")?;

    let daemon = Daemon::start(config.clone(), ShutdownSignal::never()).await?;

    // Nothing to upgrade on a new node: every patch is recorded without its
    // body running.
    assert!(daemon.applied().is_empty());
    assert_eq!(
        applied_names(daemon.node_db())?,
        patches::registry().patch_names()
    );
    assert!(config.backups_dir().join("c1.tar.gz").exists());
    assert!(config.storage_pools_dir().is_dir());
    assert!(config.networks_dir().is_dir());
    Ok(())
}

#[tokio::test]
async fn test_upgrade_applies_every_patch() -> Result<(), anyhow::Error> {
    let dir = tempfile::tempdir()?;
    let config = DaemonConfig::new(dir.path());
    upgrading_node(&config)?;
    seed_cluster(&config.database_dir())?;
    let backups = config.backups_dir();
    std::fs::create_dir_all(backups.join("fleet_backup_1234"))?;
    std::fs::write(backups.join("vm1.tar.gz"), "backup")?;

    let daemon = Daemon::start(config.clone(), ShutdownSignal::never()).await?;

    // Patches run stage by stage, in registry order within a stage.
    assert_eq!(
        daemon.applied(),
        [
            "db_nodes_autoinc",
            "clustering_server_cert_trust",
            "candid_rbac_remove_config_keys",
            "clustering_drop_database_role",
            "network_clear_bridge_volatile_hwaddr",
            "move_backups_instances",
            "network_fan_enable_nat",
            "vm_rename_uuid_key",
            "warnings_remove_empty_node",
            "network_ovn_remove_routes",
        ]
    );
    assert_eq!(applied_names(daemon.node_db())?, daemon.applied());

    let cluster = daemon.cluster_db();
    let schema = cluster.table_schema("nodes")?.expect("nodes table exists");
    assert!(schema.contains("AUTOINCREMENT"));

    cluster.transaction(|tx| -> Result<(), anyhow::Error> {
        let nodes = tx.nodes()?;
        assert_eq!(nodes.len(), 1);
        assert!(tx.node_roles(nodes[0].id)?.is_empty());

        let warnings = tx.warnings()?;
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].node, "node1");

        assert_eq!(tx.config()?, kv(&[("core.https_address", ":8443")]));

        let br0 = tx.network(DEFAULT_PROJECT, "br0")?;
        assert_eq!(br0.config, kv(&[("ipv4.address", "10.1.0.1/24")]));
        let fan0 = tx.network(DEFAULT_PROJECT, "fan0")?;
        assert_eq!(
            fan0.config,
            kv(&[("bridge.mode", "fan"), ("ipv4.nat", "true")])
        );
        let ovn0 = tx.network(DEFAULT_PROJECT, "ovn0")?;
        assert_eq!(ovn0.config, kv(&[("bridge.mtu", "1442")]));

        let instances = tx.instances()?;
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].config, kv(&[("volatile.uuid", "vm1-uuid")]));
        let snapshots = tx.snapshots(instances[0].id)?;
        assert_eq!(
            snapshots[0].config,
            kv(&[("volatile.uuid", "snap0-uuid")])
        );
        // Only virtual machines are renamed.
        assert_eq!(instances[1].config, kv(&[("volatile.vm.uuid", "c1-uuid")]));
        Ok(())
    })?;

    assert!(backups.join("instances").join("vm1.tar.gz").exists());
    assert!(!backups.join("vm1.tar.gz").exists());
    assert!(backups.join("fleet_backup_1234").is_dir());
    assert!(config.networks_dir().join("ovn0").is_dir());
    drop(daemon);

    // A second start has nothing left to do.
    let daemon = Daemon::start(config, ShutdownSignal::never()).await?;
    assert!(daemon.applied().is_empty());
    assert_eq!(applied_names(daemon.node_db())?.len(), patches::registry().len());
    Ok(())
}

#[tokio::test]
async fn test_failed_patch_aborts_startup() -> Result<(), anyhow::Error> {
    let dir = tempfile::tempdir()?;
    let config = DaemonConfig::new(dir.path());
    upgrading_node(&config)?;
    // The backups can't be moved into a file.
    std::fs::create_dir_all(config.backups_dir())?;
    std::fs::write(config.backups_dir().join("instances"), "not a directory")?;

    let err = Daemon::start(config.clone(), ShutdownSignal::never())
        .await
        .expect_err("startup fails");
    let message = format!("{err:#}");
    assert!(
        message.contains("failed applying patch \"move_backups_instances\" during post-storage-init"),
        "{message}"
    );

    // The patches before the failing one stay applied; the ones after it
    // never ran.
    let node = NodeDb::open(&config.database_dir())?;
    assert_eq!(
        applied_names(&node)?,
        [
            "db_nodes_autoinc",
            "clustering_server_cert_trust",
            "candid_rbac_remove_config_keys",
            "clustering_drop_database_role",
            "network_clear_bridge_volatile_hwaddr",
        ]
    );
    drop(node);

    // Once the cause is fixed, startup resumes with the failed patch.
    std::fs::remove_file(config.backups_dir().join("instances"))?;
    let daemon = Daemon::start(config, ShutdownSignal::never()).await?;
    assert_eq!(
        daemon.applied(),
        [
            "move_backups_instances",
            "network_fan_enable_nat",
            "vm_rename_uuid_key",
            "warnings_remove_empty_node",
            "network_ovn_remove_routes",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_unavailable_network_blocks_network_patches() -> Result<(), anyhow::Error> {
    let dir = tempfile::tempdir()?;
    let config = DaemonConfig::new(dir.path());
    upgrading_node(&config)?;
    seed_cluster(&config.database_dir())?;
    std::fs::create_dir_all(config.networks_dir())?;
    std::fs::write(config.networks_dir().join("ovn0"), "not a directory")?;

    let err = Daemon::start(config.clone(), ShutdownSignal::never())
        .await
        .expect_err("startup fails");
    let message = format!("{err:#}");
    assert!(message.contains("\"network_ovn_remove_routes\""), "{message}");
    assert!(message.contains("unavailable networks: ovn0"), "{message}");

    let node = NodeDb::open(&config.database_dir())?;
    let applied = applied_names(&node)?;
    assert_eq!(applied.len(), patches::registry().len() - 1);
    assert!(!applied.iter().any(|name| name == "network_ovn_remove_routes"));
    // Network patches of post-storage-init run before networks come up, so
    // the unavailable network does not hold them back.
    for name in ["network_clear_bridge_volatile_hwaddr", "network_fan_enable_nat"] {
        assert!(applied.iter().any(|applied| applied == name), "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_clustered_leader() -> Result<(), anyhow::Error> {
    let dir = tempfile::tempdir()?;
    let mut config = DaemonConfig::new(dir.path());
    config.server_name = "node1".into();
    config.cluster_address = Some("10.0.0.1:8443".into());
    config.cluster_leader = Some("10.0.0.1:8443".into());
    upgrading_node(&config)?;
    std::fs::write(config.server_cert_path(), "-----BEGIN CERTIFICATE-----\n")?;

    let daemon = Daemon::start(config, ShutdownSignal::never()).await?;
    assert_eq!(daemon.applied().len(), patches::registry().len());
    assert_eq!(daemon.node_db().cluster_address()?, "10.0.0.1:8443");

    let certificates = daemon.cluster_db().transaction(|tx| tx.certificates())?;
    assert_eq!(certificates.len(), 1);
    assert_eq!(certificates[0].kind, CertificateType::Server);
    assert_eq!(certificates[0].name, "node1");
    Ok(())
}
