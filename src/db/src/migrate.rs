// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Schema migrations.
//!
//! Schema changes are applied when a database is opened, before anything
//! else reads it. This is the mechanism for changing table layouts; startup
//! patches run later and must not be used for it.

use std::path::Path;

use rusqlite::params;
use tracing::debug;

use crate::error::{Error, ErrorKind};

/// A schema migration.
pub(crate) trait Migration {
    /// Applies the migration within an active transaction.
    fn apply(&self, tx: &rusqlite::Transaction) -> Result<(), Error>;
}

impl<'a> Migration for &'a str {
    fn apply(&self, tx: &rusqlite::Transaction) -> Result<(), Error> {
        tx.execute_batch(self)?;
        Ok(())
    }
}

impl<F: Fn(&rusqlite::Transaction) -> Result<(), Error>> Migration for F {
    fn apply(&self, tx: &rusqlite::Transaction) -> Result<(), Error> {
        (self)(tx)
    }
}

/// Opens the database at `path` and brings its schema up to date.
///
/// A fresh file is stamped with `application_id` and receives the zeroth
/// migration. The `user_version` field stores the index of the last migration
/// that ran. Returns the connection and whether the file was fresh.
pub(crate) fn open(
    path: &Path,
    application_id: i32,
    migrations: &[&dyn Migration],
) -> Result<(rusqlite::Connection, bool), Error> {
    let mut sqlite = rusqlite::Connection::open(path)?;

    let tx = sqlite.transaction()?;
    let app_id: i32 = tx.query_row("PRAGMA application_id", params![], |row| row.get(0))?;
    let fresh = app_id == 0;
    if fresh {
        tx.execute_batch(&format!("PRAGMA application_id = {}", application_id))?;
        migrations[0].apply(&tx)?;
    } else if app_id != application_id {
        return Err(Error::new(ErrorKind::Corruption {
            path: path.to_owned(),
            detail: "database file has incorrect application_id".into(),
        }));
    }
    tx.commit()?;

    let version = schema_version(&sqlite)?;
    if version >= migrations.len() {
        return Err(Error::new(ErrorKind::Corruption {
            path: path.to_owned(),
            detail: format!(
                "schema version {} is newer than this binary supports ({})",
                version,
                migrations.len() - 1
            ),
        }));
    }
    for (i, migration) in migrations.iter().enumerate().skip(version + 1) {
        debug!(path = %path.display(), version = i, "applying schema migration");
        let tx = sqlite.transaction()?;
        migration.apply(&tx)?;
        tx.execute_batch(&format!("PRAGMA user_version = {}", i))?;
        tx.commit()?;
    }

    Ok((sqlite, fresh))
}

/// Reports the schema version of an open database.
pub(crate) fn schema_version(conn: &rusqlite::Connection) -> Result<usize, Error> {
    let version: u32 = conn.query_row("PRAGMA user_version", params![], |row| row.get(0))?;
    Ok(usize::try_from(version).unwrap_or(usize::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIGRATIONS: &[&dyn Migration] = &[
        &"CREATE TABLE t (id integer PRIMARY KEY, v text);",
        &"ALTER TABLE t ADD COLUMN w text;",
        &|tx: &rusqlite::Transaction| -> Result<(), Error> {
            tx.execute("INSERT INTO t (v, w) VALUES ('a', 'b')", params![])?;
            Ok(())
        },
    ];

    #[test]
    fn migrations_run_once() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.db");

        let (conn, fresh) = open(&path, 0x1234, MIGRATIONS)?;
        assert!(fresh);
        assert_eq!(schema_version(&conn)?, 2);
        drop(conn);

        let (conn, fresh) = open(&path, 0x1234, MIGRATIONS)?;
        assert!(!fresh);
        let rows: i64 = conn.query_row("SELECT count(*) FROM t", params![], |row| row.get(0))?;
        assert_eq!(rows, 1);
        drop(conn);

        let err = open(&path, 0x4321, MIGRATIONS).expect_err("wrong application id");
        assert!(matches!(err.kind(), ErrorKind::Corruption { .. }));

        let err = open(&path, 0x1234, &MIGRATIONS[..2]).expect_err("schema too new");
        assert!(matches!(err.kind(), ErrorKind::Corruption { .. }));
        Ok(())
    }
}
