// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use fleet_db::cluster::DEFAULT_PROJECT;
use fleet_patch::PatchContext;

use crate::patches::PatchState;

/// Removes the unsupported `volatile.bridge.hwaddr` key from networks.
///
/// Bridge networks do not support projects, so only the default project is
/// considered. Networks in any state are updated.
pub(super) fn clear_bridge_volatile_hwaddr<'a>(
    name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        ctx.state.cluster.transaction(|tx| -> Result<(), anyhow::Error> {
            let networks = tx
                .network_names(DEFAULT_PROJECT)
                .with_context(|| format!("failed loading networks for {name} patch"))?;
            for network_name in networks {
                let mut network = tx
                    .network(DEFAULT_PROJECT, &network_name)
                    .with_context(|| {
                        format!("failed loading network {network_name:?} for {name} patch")
                    })?;
                if network
                    .config
                    .get("volatile.bridge.hwaddr")
                    .map_or(true, |v| v.is_empty())
                {
                    continue;
                }
                network.config.remove("volatile.bridge.hwaddr");
                tx.update_network(
                    DEFAULT_PROJECT,
                    &network.name,
                    &network.description,
                    &network.config,
                )
                .with_context(|| {
                    format!("failed updating network {network_name:?} for {name} patch")
                })?;
            }
            Ok(())
        })
    }
    .boxed()
}

/// Sets `ipv4.nat=true` on fan bridges that do not specify it, keeping the
/// behavior they had before NAT became configurable.
pub(super) fn fan_enable_nat<'a>(
    _name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        ctx.state.cluster.transaction(|tx| -> Result<(), anyhow::Error> {
            for mut network in tx.created_networks()? {
                if network.kind != "bridge"
                    || network.config.get("bridge.mode").map(String::as_str) != Some("fan")
                    || network.config.contains_key("ipv4.nat")
                {
                    continue;
                }
                network.config.insert("ipv4.nat".into(), "true".into());
                tx.update_network(
                    &network.project,
                    &network.name,
                    &network.description,
                    &network.config,
                )
                .with_context(|| {
                    format!(
                        "failed setting ipv4.nat=true for fan network {:?} ({})",
                        network.name, network.id
                    )
                })?;
                debug!(
                    network = %network.name,
                    id = network.id,
                    "set ipv4.nat=true for fan network"
                );
            }
            Ok(())
        })
    }
    .boxed()
}

/// Removes `ipv4.routes.external` and `ipv6.routes.external` from OVN
/// networks. The equivalent per-NIC settings replace them.
pub(super) fn ovn_remove_routes<'a>(
    _name: &'a str,
    ctx: &'a PatchContext<'a, PatchState>,
) -> BoxFuture<'a, Result<(), anyhow::Error>> {
    async move {
        ctx.state.cluster.transaction(|tx| -> Result<(), anyhow::Error> {
            for mut network in tx.created_networks()? {
                if network.kind != "ovn" {
                    continue;
                }
                let v4 = network.config.remove("ipv4.routes.external").is_some();
                let v6 = network.config.remove("ipv6.routes.external").is_some();
                if !v4 && !v6 {
                    continue;
                }
                tx.update_network(
                    &network.project,
                    &network.name,
                    &network.description,
                    &network.config,
                )
                .with_context(|| {
                    format!(
                        "failed removing OVN external route settings for {:?} ({})",
                        network.name, network.id
                    )
                })?;
                debug!(
                    network = %network.name,
                    id = network.id,
                    "removed external route settings for OVN network"
                );
            }
            Ok(())
        })
    }
    .boxed()
}
