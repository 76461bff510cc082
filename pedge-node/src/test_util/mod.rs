//! Scripted in-memory host for tests.
//!
//! [`FakeHost`] answers the handful of commands the appliers issue
//! (`systemctl`, `sysctl`, `ufw`, `dpkg-query`, `apt-get`, `apt-cache`)
//! from an in-memory model and records every call, so reconciliation can be
//! exercised without root, systemd or a package manager.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::ApplyError;
use crate::host::{CommandOutput, CommandRunner, display_command};

#[derive(Debug, Clone, Copy, Default)]
struct Unit {
    active: bool,
    enabled: bool,
}

#[derive(Debug, Clone, Default)]
struct Ufw {
    active: bool,
    rules: Vec<String>,
}

#[derive(Debug, Clone)]
struct Package {
    installed: Option<String>,
    candidate: String,
}

#[derive(Debug, Default)]
struct Model {
    programs: BTreeSet<String>,
    units: BTreeMap<String, Unit>,
    sysctl: HashMap<String, String>,
    ufw: Option<Ufw>,
    packages: BTreeMap<String, Package>,
    fail_prefixes: Vec<String>,
    exit_overrides: HashMap<String, i32>,
    calls: Vec<String>,
}

/// Verbs that change host state.
const MUTATING: &[&str] = &[
    "systemctl start",
    "systemctl stop",
    "systemctl enable",
    "systemctl disable",
    "sysctl -w",
    "ufw --force",
    "ufw disable",
    "ufw allow",
    "apt-get ",
];

/// Cloneable handle; all clones share one host model.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    model: Arc<Mutex<Model>>,
}

impl FakeHost {
    /// A host with `systemctl` and `sysctl` on PATH and nothing else.
    pub fn new() -> Self {
        let host = Self::default();
        host.add_program("systemctl");
        host.add_program("sysctl");
        host
    }

    fn lock(&self) -> MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::new(self.clone())
    }

    pub fn add_program(&self, name: &str) {
        self.lock().programs.insert(name.to_string());
    }

    pub fn remove_program(&self, name: &str) {
        self.lock().programs.remove(name);
    }

    pub fn with_service(self, name: &str, active: bool, enabled: bool) -> Self {
        self.lock()
            .units
            .insert(name.to_string(), Unit { active, enabled });
        self
    }

    pub fn with_sysctl(self, key: &str, value: &str) -> Self {
        self.lock().sysctl.insert(key.to_string(), value.to_string());
        self
    }

    /// Install ufw with the given state and `allow ...` rules.
    pub fn with_ufw(self, active: bool, rules: &[&str]) -> Self {
        {
            let mut m = self.lock();
            m.programs.insert("ufw".into());
            m.ufw = Some(Ufw {
                active,
                rules: rules.iter().map(|r| r.to_string()).collect(),
            });
        }
        self
    }

    /// Put the apt toolchain on PATH.
    pub fn with_apt(self) -> Self {
        for program in ["apt", "apt-get", "apt-cache", "dpkg-query"] {
            self.add_program(program);
        }
        self
    }

    /// Register a package. `installed` is the current version; `candidate`
    /// is what an install or upgrade would bring in (defaults to `installed`).
    pub fn with_package(self, name: &str, installed: &str, candidate: Option<&str>) -> Self {
        self.lock().packages.insert(
            name.to_string(),
            Package {
                installed: Some(installed.to_string()),
                candidate: candidate.unwrap_or(installed).to_string(),
            },
        );
        self
    }

    /// Every command whose rendered form starts with `prefix` exits 1.
    pub fn fail_on(self, prefix: &str) -> Self {
        self.lock().fail_prefixes.push(prefix.to_string());
        self
    }

    /// Force an exact command to exit with `code` and empty output.
    pub fn override_exit(&self, command: &str, code: i32) {
        self.lock()
            .exit_overrides
            .insert(command.to_string(), code);
    }

    pub fn service(&self, name: &str) -> Option<(bool, bool)> {
        self.lock().units.get(name).map(|u| (u.active, u.enabled))
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.lock().sysctl.get(key).cloned()
    }

    /// Every command run so far, rendered as `program arg...`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// The subset of [`calls`](Self::calls) that changed host state.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| MUTATING.iter().any(|m| c.starts_with(m)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

fn not_found(msg: impl Into<String>, code: i32) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::new(),
        stderr: msg.into(),
    }
}

impl Model {
    fn systemctl(&mut self, args: &[&str]) -> CommandOutput {
        let [verb, name] = args else {
            return not_found("usage: systemctl VERB UNIT", 1);
        };
        let unit = self.units.get_mut(*name);
        match (*verb, unit) {
            ("is-active", Some(u)) if u.active => CommandOutput::ok("active\n"),
            ("is-active", _) => CommandOutput::exit(3, "inactive\n"),
            ("is-enabled", Some(u)) if u.enabled => CommandOutput::ok("enabled\n"),
            ("is-enabled", Some(_)) => CommandOutput::exit(1, "disabled\n"),
            ("is-enabled", None) => not_found(format!("Failed to get unit file state for {name}.service"), 1),
            ("start", Some(u)) => {
                u.active = true;
                CommandOutput::ok("")
            }
            ("stop", Some(u)) => {
                u.active = false;
                CommandOutput::ok("")
            }
            ("enable", Some(u)) => {
                u.enabled = true;
                CommandOutput::ok("")
            }
            ("disable", Some(u)) => {
                u.enabled = false;
                CommandOutput::ok("")
            }
            (_, None) => not_found(format!("Unit {name}.service not found."), 5),
            _ => not_found(format!("Unknown command verb {verb}."), 1),
        }
    }

    fn sysctl(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["-n", key] => match self.sysctl.get(*key) {
                Some(v) => CommandOutput::ok(format!("{v}\n")),
                None => not_found(
                    format!("sysctl: cannot stat /proc/sys/{}: No such file or directory", key.replace('.', "/")),
                    255,
                ),
            },
            ["-w", assignment] => match assignment.split_once('=') {
                Some((key, value)) if self.sysctl.contains_key(key) => {
                    self.sysctl.insert(key.to_string(), value.to_string());
                    CommandOutput::ok(format!("{key} = {value}\n"))
                }
                _ => not_found(format!("sysctl: cannot set {assignment}"), 255),
            },
            _ => not_found("sysctl: usage", 1),
        }
    }

    fn ufw(&mut self, args: &[&str]) -> CommandOutput {
        let Some(ufw) = self.ufw.as_mut() else {
            return not_found("ufw: not installed", 127);
        };
        match args {
            ["status"] => CommandOutput::ok(if ufw.active {
                "Status: active\n"
            } else {
                "Status: inactive\n"
            }),
            ["show", "added"] => {
                let mut out =
                    String::from("Added user rules (see 'ufw status' for running firewall):\n");
                if ufw.rules.is_empty() {
                    out.push_str("(None)\n");
                }
                for rule in &ufw.rules {
                    out.push_str(&format!("ufw {rule}\n"));
                }
                CommandOutput::ok(out)
            }
            ["--force", "enable"] => {
                ufw.active = true;
                CommandOutput::ok("Firewall is active and enabled on system startup\n")
            }
            ["disable"] => {
                ufw.active = false;
                CommandOutput::ok("Firewall stopped and disabled on system startup\n")
            }
            ["allow", ..] => {
                let rule = args.join(" ");
                if !ufw.rules.contains(&rule) {
                    ufw.rules.push(rule);
                }
                CommandOutput::ok("Rule added\n")
            }
            _ => not_found("ufw: unsupported", 1),
        }
    }

    fn dpkg_query(&self, args: &[&str]) -> CommandOutput {
        let Some(name) = args.last() else {
            return not_found("dpkg-query: need a package", 2);
        };
        match self.packages.get(*name).and_then(|p| p.installed.as_ref()) {
            Some(v) => CommandOutput::ok(format!("install ok installed {v}")),
            None => not_found(format!("dpkg-query: no packages found matching {name}"), 1),
        }
    }

    fn apt_cache(&self, args: &[&str]) -> CommandOutput {
        let ["policy", name] = args else {
            return not_found("apt-cache: usage", 100);
        };
        let (installed, candidate) = match self.packages.get(*name) {
            Some(p) => (
                p.installed.clone().unwrap_or_else(|| "(none)".into()),
                p.candidate.clone(),
            ),
            None => ("(none)".into(), "1.0-1".into()),
        };
        CommandOutput::ok(format!(
            "{name}:\n  Installed: {installed}\n  Candidate: {candidate}\n"
        ))
    }

    fn apt_get(&mut self, args: &[&str]) -> CommandOutput {
        let Some(target) = args.last() else {
            return not_found("apt-get: usage", 100);
        };
        let (name, pin) = match target.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (*target, None),
        };
        let pkg = self
            .packages
            .entry(name.to_string())
            .or_insert_with(|| Package {
                installed: None,
                candidate: "1.0-1".into(),
            });
        match args.first() {
            Some(&"install") => {
                pkg.installed = Some(pin.map(str::to_string).unwrap_or_else(|| pkg.candidate.clone()));
                CommandOutput::ok("")
            }
            Some(&"remove") => {
                pkg.installed = None;
                CommandOutput::ok("")
            }
            _ => not_found("apt-get: unsupported", 100),
        }
    }

    fn dispatch(&mut self, program: &str, args: &[&str]) -> Result<CommandOutput, ApplyError> {
        if !self.programs.contains(program) {
            return Err(ApplyError::Spawn {
                program: program.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(match program {
            "systemctl" => self.systemctl(args),
            "sysctl" => self.sysctl(args),
            "ufw" => self.ufw(args),
            "dpkg-query" => self.dpkg_query(args),
            "apt-cache" => self.apt_cache(args),
            "apt-get" => self.apt_get(args),
            other => not_found(format!("{other}: not scripted"), 127),
        })
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ApplyError> {
        let rendered = display_command(program, args);
        let mut m = self.lock();
        m.calls.push(rendered.clone());

        if let Some(code) = m.exit_overrides.get(&rendered) {
            return Ok(CommandOutput::exit(*code, ""));
        }
        if m.fail_prefixes.iter().any(|p| rendered.starts_with(p)) {
            return Ok(not_found(format!("{rendered}: injected failure"), 1));
        }
        m.dispatch(program, args)
    }

    fn has_program(&self, name: &str) -> bool {
        self.lock().programs.contains(name)
    }
}
