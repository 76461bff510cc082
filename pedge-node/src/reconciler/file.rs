//! File enforcer.

use std::path::Path;

use pedge_state::FileConfig;

use super::{ReconcileMode, ReconcileResult, outcome};
use crate::apply::{Applier, FileApplier, FileStatus};
use crate::error::ApplyError;

#[derive(Default)]
pub struct FileEnforcer {
    applier: FileApplier,
}

impl FileEnforcer {
    pub fn new() -> Self {
        Self {
            applier: FileApplier::new(),
        }
    }

    pub async fn reconcile(&self, file: &FileConfig, mode: ReconcileMode) -> ReconcileResult {
        let applied = self
            .applier
            .apply(file, mode != ReconcileMode::Enforce)
            .await;
        outcome(
            "file",
            file.path.display().to_string(),
            mode,
            applied,
            " + ",
        )
    }

    pub async fn check(&self, path: &Path) -> Result<FileStatus, ApplyError> {
        self.applier.check(path).await
    }
}
