//! Events observed on the host.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FileModified,
    ServiceLog,
    CommandExecuted,
    #[serde(rename = "unit_state_change")]
    UnitStateChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FileModified => "file_modified",
            EventKind::ServiceLog => "service_log",
            EventKind::CommandExecuted => "command_executed",
            EventKind::UnitStateChanged => "unit_state_change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host occurrence. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Listener that produced the event (`inotify`, `journald`, ...).
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

impl Event {
    fn new(kind: EventKind, source: &'static str) -> Self {
        Self {
            kind,
            source,
            path: None,
            unit: None,
            command: None,
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    pub fn file_modified(source: &'static str, path: &Path) -> Self {
        Self {
            path: Some(path.display().to_string()),
            ..Self::new(EventKind::FileModified, source)
        }
    }

    pub fn unit_state_changed(source: &'static str, unit: impl Into<String>) -> Self {
        Self {
            unit: Some(unit.into()),
            ..Self::new(EventKind::UnitStateChanged, source)
        }
    }

    pub fn service_log(source: &'static str, unit: impl Into<String>) -> Self {
        Self {
            unit: Some(unit.into()),
            ..Self::new(EventKind::ServiceLog, source)
        }
    }

    pub fn command_executed(source: &'static str, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::new(EventKind::CommandExecuted, source)
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// The identifier the event is about: path, unit or command.
    pub fn subject(&self) -> &str {
        self.path
            .as_deref()
            .or(self.unit.as_deref())
            .or(self.command.as_deref())
            .unwrap_or("")
    }
}

/// Tools whose execution can change state we manage.
const STATE_CHANGING_TOOLS: &[&str] = &[
    "systemctl",
    "sysctl",
    "ufw",
    "firewall-cmd",
    "apt",
    "yum",
    "dnf",
];

pub fn affects_managed_state(command: &str) -> bool {
    STATE_CHANGING_TOOLS.iter().any(|tool| command.contains(tool))
}

/// Parse journald's `__REALTIME_TIMESTAMP` (microseconds since the epoch).
pub fn journal_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_micros)
        .unwrap_or_else(Utc::now)
}
