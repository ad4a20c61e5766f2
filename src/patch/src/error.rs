// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::Stage;

/// An error applying startup patches.
///
/// Every variant is fatal for the current startup attempt. Recovery is to fix
/// the underlying condition and restart the daemon, at which point the stage
/// re-runs from its first unapplied patch.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("patch {name:?} has no stage set")]
    NoStage { name: String },
    #[error("patch {name:?} is registered more than once")]
    DuplicatePatch { name: String },
    #[error("cannot apply patches for stage {0}")]
    InvalidStage(Stage),
    #[error("cannot enter stage {requested} after stage {completed} has completed")]
    StageOutOfOrder { requested: Stage, completed: Stage },
    #[error("failed loading applied patches")]
    ListApplied { source: anyhow::Error },
    #[error("failed applying patch {name:?} during {stage}")]
    Apply {
        name: String,
        stage: Stage,
        source: anyhow::Error,
    },
    #[error("failed marking patch {name:?} applied")]
    MarkApplied { name: String, source: anyhow::Error },
}

impl PatchError {
    /// Reports whether the error is a defect in how patches are defined or
    /// driven, as opposed to a failure while running them.
    pub fn is_configuration_defect(&self) -> bool {
        matches!(
            self,
            PatchError::NoStage { .. }
                | PatchError::DuplicatePatch { .. }
                | PatchError::InvalidStage(_)
                | PatchError::StageOutOfOrder { .. }
        )
    }

    /// The name of the patch the error concerns, if any.
    pub fn patch_name(&self) -> Option<&str> {
        match self {
            PatchError::NoStage { name }
            | PatchError::DuplicatePatch { name }
            | PatchError::Apply { name, .. }
            | PatchError::MarkApplied { name, .. } => Some(name),
            PatchError::InvalidStage(_)
            | PatchError::StageOutOfOrder { .. }
            | PatchError::ListApplied { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn apply_error_names_patch_and_cause() {
        let err = PatchError::Apply {
            name: "vm_rename_uuid_key".into(),
            stage: Stage::PostStorageInit,
            source: anyhow!("disk full").context("updating instance config"),
        };
        assert_eq!(err.patch_name(), Some("vm_rename_uuid_key"));
        assert!(!err.is_configuration_defect());
        assert_eq!(
            format!("{:#}", anyhow::Error::from(err)),
            "failed applying patch \"vm_rename_uuid_key\" during post-storage-init: \
             updating instance config: disk full"
        );
    }

    #[test]
    fn configuration_defects() {
        assert!(PatchError::NoStage { name: "x".into() }.is_configuration_defect());
        assert!(PatchError::InvalidStage(Stage::NoStage).is_configuration_defect());
        assert!(!PatchError::MarkApplied {
            name: "x".into(),
            source: anyhow!("locked"),
        }
        .is_configuration_defect());
    }
}
