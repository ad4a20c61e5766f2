// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error {
    #[from]
    pub(crate) kind: ErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("corrupt database {}: {detail}", path.display())]
    Corruption { path: PathBuf, detail: String },
    #[error("patch {0:?} is already marked applied")]
    PatchAlreadyApplied(String),
    #[error("cluster member {0} not found")]
    NodeNotFound(i64),
    #[error("network {name:?} not found in project {project:?}")]
    NetworkNotFound { project: String, name: String },
    #[error("unknown {what} code {code}")]
    UnknownCode { what: &'static str, code: i64 },
    #[error("failed creating database directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sqlite error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Reports whether the error was caused by a uniqueness or foreign key
    /// constraint.
    pub fn is_constraint_violation(&self) -> bool {
        match &self.kind {
            ErrorKind::Storage(e) => is_constraint_violation(e),
            ErrorKind::PatchAlreadyApplied(_) => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Error {
        Error::new(ErrorKind::from(e))
    }
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.code == rusqlite::ErrorCode::ConstraintViolation
        }
        _ => false,
    }
}
