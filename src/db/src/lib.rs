// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable state for fleetd.
//!
//! Two SQLite databases live in the daemon's database directory: the
//! [`NodeDb`], which holds state private to this node (including the record
//! of applied startup patches), and the [`ClusterDb`], which holds state
//! shared by every member of the cluster. Both are brought up to date with
//! their schema migrations when opened.

mod migrate;

pub mod cluster;
pub mod error;
pub mod node;

pub use crate::cluster::{ClusterDb, ClusterTx};
pub use crate::error::{Error, ErrorKind};
pub use crate::node::{NodeDb, NodeTx};
