// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use fleet_db::cluster::InstanceType;
use fleet_patch::PatchContext;

use crate::patches::PatchState;

/// The prefix of the temporary directories backups are assembled in.
pub const BACKUP_WORKING_DIR_PREFIX: &str = "fleet_backup_";

/// Moves instance backups from `<var>/backups` into `<var>/backups/instances`.
pub(super) fn move_backups_instances<'a>(
    _name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        let backups = ctx.state.config.backups_dir();
        if !tokio::fs::try_exists(&backups).await? {
            return Ok(());
        }

        let instances = backups.join("instances");
        tokio::fs::create_dir_all(&instances)
            .await
            .with_context(|| {
                format!(
                    "failed creating instances backup directory {}",
                    instances.display()
                )
            })?;

        let mut entries = tokio::fs::read_dir(&backups).await.with_context(|| {
            format!("failed listing backup directory {}", backups.display())
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name == "instances" || name.starts_with(BACKUP_WORKING_DIR_PREFIX) {
                continue;
            }
            let old_path = entry.path();
            let new_path = instances.join(&file_name);
            debug!(from = %old_path.display(), to = %new_path.display(), "moving backup");
            tokio::fs::rename(&old_path, &new_path)
                .await
                .with_context(|| {
                    format!(
                        "failed moving backup from {} to {}",
                        old_path.display(),
                        new_path.display()
                    )
                })?;
        }
        Ok(())
    }
    .boxed()
}

const OLD_UUID_KEY: &str = "volatile.vm.uuid";
const NEW_UUID_KEY: &str = "volatile.uuid";

/// The config changes renaming the VM UUID key, if `config` has it set.
fn uuid_key_changes(config: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    let uuid = config.get(OLD_UUID_KEY).filter(|uuid| !uuid.is_empty())?;
    Some(BTreeMap::from([
        (OLD_UUID_KEY.to_owned(), String::new()),
        (NEW_UUID_KEY.to_owned(), uuid.clone()),
    ]))
}

/// Renames `volatile.vm.uuid` to `volatile.uuid` on virtual machines and their
/// snapshots.
pub(super) fn vm_rename_uuid_key<'a>(
    _name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        ctx.state.cluster.transaction(|tx| -> Result<(), anyhow::Error> {
            for instance in tx.instances()? {
                if instance.kind != InstanceType::VirtualMachine {
                    continue;
                }
                if let Some(changes) = uuid_key_changes(&instance.config) {
                    debug!(
                        instance = %instance.name,
                        project = %instance.project,
                        "renaming config key {OLD_UUID_KEY:?} to {NEW_UUID_KEY:?}"
                    );
                    tx.update_instance_config(instance.id, &changes)
                        .with_context(|| {
                            format!(
                                "failed renaming config key {OLD_UUID_KEY:?} to {NEW_UUID_KEY:?} \
                                 for VM {:?} (project {:?})",
                                instance.name, instance.project
                            )
                        })?;
                }

                for snapshot in tx.snapshots(instance.id)? {
                    let Some(changes) = uuid_key_changes(&snapshot.config) else {
                        continue;
                    };
                    debug!(
                        instance = %instance.name,
                        snapshot = %snapshot.name,
                        "renaming config key {OLD_UUID_KEY:?} to {NEW_UUID_KEY:?}"
                    );
                    tx.update_snapshot_config(snapshot.id, &changes)
                        .with_context(|| {
                            format!(
                                "failed renaming config key {OLD_UUID_KEY:?} to {NEW_UUID_KEY:?} \
                                 for snapshot {:?} of VM {:?}",
                                snapshot.name, instance.name
                            )
                        })?;
                }
            }
            Ok(())
        })
    }
    .boxed()
}
