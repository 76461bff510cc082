//! Watcher configuration document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StateError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub watchers: Watchers,
}

/// Master switch plus one section per listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watchers {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub inotify: InotifyConfig,
    #[serde(default)]
    pub journald: JournaldConfig,
    #[serde(default)]
    pub auditd: AuditdConfig,
    #[serde(default)]
    pub dbus: DbusConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InotifyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournaldConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Unit names without the `.service` suffix.
    #[serde(default)]
    pub units: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditdConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Subscribes to all systemd manager signals; no parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbusConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl WatcherConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, StateError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_sections() {
        let yaml = r#"
watchers:
  enabled: true
  inotify:
    enabled: true
    paths: [/etc/nginx, /etc/sysctl.d]
  journald:
    enabled: true
    units: [nginx, sshd]
  auditd:
    enabled: false
    commands: [systemctl, ufw]
  dbus:
    enabled: true
"#;
        let cfg = WatcherConfig::from_yaml(yaml).unwrap();
        assert!(cfg.watchers.enabled);
        assert_eq!(cfg.watchers.inotify.paths.len(), 2);
        assert_eq!(cfg.watchers.journald.units, vec!["nginx", "sshd"]);
        assert!(!cfg.watchers.auditd.enabled);
        assert_eq!(cfg.watchers.auditd.commands.len(), 2);
        assert!(cfg.watchers.dbus.enabled);
    }

    #[test]
    fn missing_sections_default_to_disabled() {
        let cfg = WatcherConfig::from_yaml("watchers:\n  enabled: true\n").unwrap();
        assert!(cfg.watchers.enabled);
        assert!(!cfg.watchers.inotify.enabled);
        assert!(cfg.watchers.journald.units.is_empty());
        assert!(!cfg.watchers.dbus.enabled);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(WatcherConfig::from_yaml("watchers: [1, 2]").is_err());
    }
}
