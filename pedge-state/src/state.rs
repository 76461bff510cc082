//! Desired-state document.
//!
//! A `State` is a versioned snapshot of everything a node should look like.
//! Resource identity is the natural key of each kind (service name, sysctl
//! key, package name, file path); there are no surrogate ids.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StateError;

/// Desired state for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub version: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// Kernel parameters. Iteration order is unspecified.
    #[serde(default)]
    pub sysctl: HashMap<String, String>,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub environment: String,
}

/// Desired run state of a systemd unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub state: ServiceState,
    #[serde(default)]
    pub enabled: bool,
}

/// Host firewall (ufw). Reconciliation only ever adds rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<FirewallRule>,
    /// Named services / application profiles (e.g. `ssh`, `OpenSSH`).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_services: BTreeSet<String>,
}

impl FirewallConfig {
    /// Whether the document asks for any firewall management at all.
    pub fn is_configured(&self) -> bool {
        self.enabled || !self.allowed_services.is_empty() || !self.rules.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A single allow rule. `port` accepts a number or a `lo:hi` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Source address or CIDR; `None` means anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl FirewallRule {
    /// The rule in the form ufw uses for `ufw show added`, minus the `ufw ` prefix.
    pub fn ufw_form(&self) -> String {
        match (&self.from, self.protocol) {
            (None, None) => format!("allow {}", self.port),
            (None, Some(proto)) => format!("allow {}/{}", self.port, proto.as_str()),
            (Some(from), None) => format!("allow from {} to any port {}", from, self.port),
            (Some(from), Some(proto)) => format!(
                "allow from {} to any port {} proto {}",
                from,
                self.port,
                proto.as_str()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    Present,
    Absent,
    Latest,
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageState::Present => "present",
            PackageState::Absent => "absent",
            PackageState::Latest => "latest",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    pub state: PackageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Hex SHA-256 of the expected content. Takes precedence over a byte compare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Octal permission string, e.g. `0644`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl FileConfig {
    /// False when both `content` and `sha256` are set and the digest is not
    /// the digest of `content`. Such a file can never converge.
    pub fn digest_matches_content(&self) -> bool {
        match (self.content.as_deref(), self.sha256.as_deref()) {
            (Some(content), Some(expected)) => {
                sha256_hex(content.as_bytes()).eq_ignore_ascii_case(expected.trim())
            }
            _ => true,
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Parse an octal permission string (`"0644"`, `"755"`) into permission bits.
pub fn parse_mode(mode: &str) -> Option<u32> {
    let mode = mode.trim();
    if mode.is_empty() {
        return None;
    }
    u32::from_str_radix(mode, 8).ok().filter(|m| *m <= 0o7777)
}

impl State {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, StateError> {
        let state: State = serde_yaml::from_str(yaml)?;
        state.validate()?;
        Ok(state)
    }

    pub fn to_yaml(&self) -> Result<String, StateError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load and validate a state document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Write the document to disk (used to cache remotely fetched state).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StateError> {
        let path = path.as_ref();
        let yaml = self.to_yaml()?;
        std::fs::write(path, yaml).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Total number of resources a reconciliation pass would visit.
    pub fn resource_count(&self) -> usize {
        self.services.len()
            + self.sysctl.len()
            + usize::from(self.firewall.is_configured())
            + self.packages.len()
            + self.files.len()
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.version.trim().is_empty() {
            return Err(StateError::Invalid("version is required".into()));
        }

        let mut seen = HashSet::new();
        for svc in &self.services {
            if svc.name.trim().is_empty() {
                return Err(StateError::Invalid("service with empty name".into()));
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(StateError::Invalid(format!("duplicate service {}", svc.name)));
            }
        }

        for key in self.sysctl.keys() {
            if key.trim().is_empty() {
                return Err(StateError::Invalid("sysctl parameter with empty key".into()));
            }
        }

        for rule in &self.firewall.rules {
            if rule.port.trim().is_empty() {
                return Err(StateError::Invalid("firewall rule with empty port".into()));
            }
        }

        let mut seen = HashSet::new();
        for pkg in &self.packages {
            if pkg.name.trim().is_empty() {
                return Err(StateError::Invalid("package with empty name".into()));
            }
            if !seen.insert(pkg.name.as_str()) {
                return Err(StateError::Invalid(format!("duplicate package {}", pkg.name)));
            }
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            if !file.path.is_absolute() {
                return Err(StateError::Invalid(format!(
                    "file path must be absolute: {}",
                    file.path.display()
                )));
            }
            if !seen.insert(file.path.as_path()) {
                return Err(StateError::Invalid(format!(
                    "duplicate file {}",
                    file.path.display()
                )));
            }
            if !file.digest_matches_content() {
                return Err(StateError::Invalid(format!(
                    "sha256 does not match content for {}",
                    file.path.display()
                )));
            }
            if let Some(mode) = &file.mode {
                if parse_mode(mode).is_none() {
                    return Err(StateError::Invalid(format!(
                        "invalid mode {:?} for {}",
                        mode,
                        file.path.display()
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
metadata:
  site: lab-01
  environment: staging
services:
  - name: nginx
    state: running
    enabled: true
  - name: telnet
    state: stopped
sysctl:
  net.ipv4.ip_forward: "1"
  vm.swappiness: "10"
firewall:
  enabled: true
  allowed_services: [ssh]
  rules:
    - port: "443"
      protocol: tcp
    - port: "9100"
      protocol: tcp
      from: 10.0.0.0/8
packages:
  - name: curl
    state: present
  - name: openssl
    state: latest
  - name: nginx
    state: present
    version: 1.24.0-1
files:
  - path: /etc/motd
    content: "welcome\n"
    mode: "0644"
    owner: root
"#;

    #[test]
    fn parses_full_document() {
        let state = State::from_yaml(SAMPLE).unwrap();
        assert_eq!(state.version, "1.0");
        assert_eq!(state.metadata.site, "lab-01");
        assert_eq!(state.services.len(), 2);
        assert_eq!(state.services[1].state, ServiceState::Stopped);
        assert!(!state.services[1].enabled);
        assert_eq!(state.sysctl["vm.swappiness"], "10");
        assert!(state.firewall.allowed_services.contains("ssh"));
        assert_eq!(state.packages[2].version.as_deref(), Some("1.24.0-1"));
        assert_eq!(state.files[0].owner.as_deref(), Some("root"));
        assert_eq!(state.files[0].group, None);
        assert_eq!(state.resource_count(), 2 + 2 + 1 + 3 + 1);
    }

    #[test]
    fn minimal_document_defaults_collections() {
        let state = State::from_yaml("version: v1\n").unwrap();
        assert!(state.services.is_empty());
        assert!(state.sysctl.is_empty());
        assert!(!state.firewall.is_configured());
        assert_eq!(state.resource_count(), 0);
    }

    #[test]
    fn yaml_roundtrip_preserves_document() {
        let state = State::from_yaml(SAMPLE).unwrap();
        let again = State::from_yaml(&state.to_yaml().unwrap()).unwrap();
        assert_eq!(state, again);
    }

    #[test]
    fn missing_version_is_rejected() {
        let err = State::from_yaml("services: []\nversion: \"\"\n").unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn unknown_service_state_is_a_parse_error() {
        let yaml = "version: v1\nservices:\n  - name: a\n    state: paused\n";
        assert!(matches!(State::from_yaml(yaml), Err(StateError::Parse(_))));
    }

    #[test]
    fn relative_file_path_is_rejected() {
        let yaml = "version: v1\nfiles:\n  - path: etc/motd\n    content: hi\n";
        assert!(matches!(State::from_yaml(yaml), Err(StateError::Invalid(_))));
    }

    #[test]
    fn duplicate_services_are_rejected() {
        let yaml = "version: v1\nservices:\n  - {name: a, state: running}\n  - {name: a, state: stopped}\n";
        let err = State::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate service a"));
    }

    #[test]
    fn bad_mode_is_rejected() {
        let yaml = "version: v1\nfiles:\n  - path: /tmp/x\n    mode: \"0899\"\n";
        assert!(matches!(State::from_yaml(yaml), Err(StateError::Invalid(_))));
    }

    #[test]
    fn content_and_digest_must_agree() {
        let yaml = format!(
            "version: v1\nfiles:\n  - path: /tmp/x\n    content: hello\n    sha256: {}\n",
            sha256_hex(b"something else")
        );
        let err = State::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("sha256 does not match content"));

        let yaml = format!(
            "version: v1\nfiles:\n  - path: /tmp/x\n    content: hello\n    sha256: {}\n",
            sha256_hex(b"hello").to_uppercase()
        );
        assert!(State::from_yaml(&yaml).is_ok());
    }

    #[test]
    fn parse_mode_accepts_octal_forms() {
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("755"), Some(0o755));
        assert_eq!(parse_mode("4755"), Some(0o4755));
        assert_eq!(parse_mode(""), None);
        assert_eq!(parse_mode("rw-r--r--"), None);
        assert_eq!(parse_mode("17777"), None);
    }

    #[test]
    fn firewall_rule_ufw_form() {
        let simple = FirewallRule {
            port: "22".into(),
            protocol: Some(Protocol::Tcp),
            from: None,
        };
        assert_eq!(simple.ufw_form(), "allow 22/tcp");

        let sourced = FirewallRule {
            port: "9100".into(),
            protocol: Some(Protocol::Tcp),
            from: Some("10.0.0.0/8".into()),
        };
        assert_eq!(
            sourced.ufw_form(),
            "allow from 10.0.0.0/8 to any port 9100 proto tcp"
        );

        let any = FirewallRule {
            port: "53".into(),
            protocol: None,
            from: None,
        };
        assert_eq!(any.ufw_form(), "allow 53");
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yaml");
        let state = State::from_yaml(SAMPLE).unwrap();
        state.save(&path).unwrap();
        assert_eq!(State::load(&path).unwrap(), state);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = State::load(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
    }
}
