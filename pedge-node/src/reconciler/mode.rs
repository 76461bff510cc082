//! Process-wide reconcile mode.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileMode {
    /// Detection only; passes are skipped entirely.
    #[default]
    Disabled,
    /// Compute and log actions, never mutate.
    DryRun,
    Enforce,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileMode::Disabled => "disabled",
            ReconcileMode::DryRun => "dry-run",
            ReconcileMode::Enforce => "enforce",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ReconcileMode::Disabled => 0,
            ReconcileMode::DryRun => 1,
            ReconcileMode::Enforce => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ReconcileMode::DryRun,
            2 => ReconcileMode::Enforce,
            _ => ReconcileMode::Disabled,
        }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "disabled" => Ok(ReconcileMode::Disabled),
            "dry-run" => Ok(ReconcileMode::DryRun),
            "enforce" => Ok(ReconcileMode::Enforce),
            other => Err(format!(
                "invalid reconcile mode {other:?} (expected disabled, dry-run or enforce)"
            )),
        }
    }
}

/// Atomic holder for the current mode. Every enforcer call reads it afresh,
/// so a change lands on the next resource rather than the next pass.
#[derive(Debug, Default)]
pub struct ModeCell(AtomicU8);

impl ModeCell {
    pub fn new(mode: ReconcileMode) -> Self {
        Self(AtomicU8::new(mode.to_u8()))
    }

    pub fn get(&self) -> ReconcileMode {
        ReconcileMode::from_u8(self.0.load(Ordering::Relaxed))
    }

    /// Store `mode` and return the previous value.
    pub fn set(&self, mode: ReconcileMode) -> ReconcileMode {
        ReconcileMode::from_u8(self.0.swap(mode.to_u8(), Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!("enforce".parse::<ReconcileMode>(), Ok(ReconcileMode::Enforce));
        assert_eq!("dry-run".parse::<ReconcileMode>(), Ok(ReconcileMode::DryRun));
        assert_eq!(" disabled ".parse::<ReconcileMode>(), Ok(ReconcileMode::Disabled));
        assert!("dryrun".parse::<ReconcileMode>().is_err());
    }

    #[test]
    fn serde_names_match_display() {
        for mode in [ReconcileMode::Disabled, ReconcileMode::DryRun, ReconcileMode::Enforce] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{mode}\""));
        }
    }

    #[test]
    fn cell_swaps() {
        let cell = ModeCell::new(ReconcileMode::DryRun);
        assert_eq!(cell.get(), ReconcileMode::DryRun);
        assert_eq!(cell.set(ReconcileMode::Enforce), ReconcileMode::DryRun);
        assert_eq!(cell.get(), ReconcileMode::Enforce);
    }
}
