use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::event::journal_timestamp;
use super::{Event, EventSender, Listener, follow};
use crate::shutdown::Shutdown;

pub const AUDIT_LOG: &str = "/var/log/audit/audit.log";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Executions of the configured commands, read from the audit log or,
/// when there is none, from audit records in the journal.
pub struct AuditdListener {
    commands: Vec<String>,
    log_path: PathBuf,
}

impl AuditdListener {
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            commands,
            log_path: PathBuf::from(AUDIT_LOG),
        }
    }

    #[cfg(test)]
    fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }
}

/// Events for an audit log line: one per configured command it mentions,
/// and only for `EXECVE` records.
pub(crate) fn match_audit_line(line: &str, commands: &[String]) -> Vec<Event> {
    if !line.contains("EXECVE") {
        return Vec::new();
    }
    commands
        .iter()
        .filter(|cmd| line.contains(cmd.as_str()))
        .map(|cmd| Event::command_executed("auditd", cmd.as_str()).with("audit_line", line))
        .collect()
}

/// Same as [`match_audit_line`] for a `journalctl --output=json` audit entry.
pub(crate) fn match_journal_entry(line: &str, commands: &[String]) -> Vec<Event> {
    let Ok(entry) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };
    let Some(message) = entry.get("MESSAGE").and_then(Value::as_str) else {
        return Vec::new();
    };
    let timestamp = journal_timestamp(entry.get("__REALTIME_TIMESTAMP").and_then(Value::as_str));
    commands
        .iter()
        .filter(|cmd| message.contains(cmd.as_str()))
        .map(|cmd| {
            Event::command_executed("auditd-fallback", cmd.as_str())
                .at(timestamp)
                .with("message", message)
        })
        .collect()
}

/// Split complete lines off the front of `buf`, leaving any partial tail.
fn drain_lines(buf: &mut String) -> Vec<String> {
    let Some(end) = buf.rfind('\n') else {
        return Vec::new();
    };
    let rest = buf.split_off(end + 1);
    let complete = std::mem::replace(buf, rest);
    complete.lines().map(str::to_string).collect()
}

/// Follows a log by path across truncation and rotation.
struct LogTail {
    path: PathBuf,
    file: File,
    ino: u64,
    pos: u64,
    pending: String,
}

impl LogTail {
    /// Open `path` positioned at its end; existing records are skipped.
    async fn open_at_end(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let ino = file.metadata().await?.ino();
        let pos = file.seek(SeekFrom::End(0)).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            ino,
            pos,
            pending: String::new(),
        })
    }

    /// Complete lines written since the last poll.
    async fn poll(&mut self) -> Result<Vec<String>> {
        if self.file.metadata().await?.len() < self.pos {
            debug!("[auditd] Audit log truncated, rereading from start");
            self.pos = self.file.seek(SeekFrom::Start(0)).await?;
            self.pending.clear();
        }
        let mut lines = self.read_new().await?;

        // After rotation the path names a new file; finish the old one first.
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.ino() != self.ino => {
                debug!("[auditd] Audit log rotated, following new file");
                self.file = File::open(&self.path).await?;
                self.ino = self.file.metadata().await?.ino();
                self.pos = 0;
                self.pending.clear();
                lines.extend(self.read_new().await?);
            }
            _ => {}
        }
        Ok(lines)
    }

    async fn read_new(&mut self) -> Result<Vec<String>> {
        let mut chunk = Vec::new();
        self.pos += self.file.read_to_end(&mut chunk).await? as u64;
        self.pending.push_str(&String::from_utf8_lossy(&chunk));
        Ok(drain_lines(&mut self.pending))
    }
}

impl AuditdListener {
    async fn tail_log(&self, events: &mut EventSender, shutdown: &mut Shutdown) -> Result<()> {
        let mut tail = LogTail::open_at_end(&self.log_path).await?;
        info!(
            "[auditd] Monitoring {} for: {}",
            self.log_path.display(),
            self.commands.join(", ")
        );

        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for line in tail.poll().await? {
                        for event in match_audit_line(&line, &self.commands) {
                            if !events.send(event).await {
                                return Ok(());
                            }
                        }
                    }
                }
                _ = shutdown.wait() => return Ok(()),
            }
        }
    }

    async fn follow_journal(&self, events: &mut EventSender, shutdown: &mut Shutdown) -> Result<()> {
        let (_child, mut lines) = follow(
            "journalctl",
            &["--follow", "--output=json", "--lines=0", "_TRANSPORT=audit"],
        )?;
        info!("[auditd-fallback] Monitoring audit records in the journal");

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        for event in match_journal_entry(&line, &self.commands) {
                            if !events.send(event).await {
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(e)) => warn!("[auditd-fallback] Read error: {}", e),
                    None => return Ok(()),
                },
                _ = shutdown.wait() => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Listener for AuditdListener {
    fn name(&self) -> &'static str {
        "auditd"
    }

    async fn run(self: Box<Self>, mut events: EventSender, mut shutdown: Shutdown) -> Result<()> {
        if self.commands.is_empty() {
            info!("[auditd] No commands configured, skipping");
            return Ok(());
        }
        if self.log_path.exists() {
            self.tail_log(&mut events, &mut shutdown).await
        } else {
            info!(
                "[auditd] {} not found, falling back to the journal",
                self.log_path.display()
            );
            self.follow_journal(&mut events, &mut shutdown).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::sync::mpsc;

    use super::*;
    use crate::shutdown::ShutdownTrigger;

    fn commands() -> Vec<String> {
        vec!["systemctl".into(), "ufw".into()]
    }

    #[test]
    fn only_execve_records_match() {
        let execve = r#"type=EXECVE msg=audit(1700000000.123:42): argc=3 a0="systemctl" a1="stop" a2="nginx""#;
        let events = match_audit_line(execve, &commands());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command.as_deref(), Some("systemctl"));
        assert_eq!(events[0].source, "auditd");
        assert_eq!(
            events[0].data.get("audit_line").map(String::as_str),
            Some(execve)
        );

        let syscall = r#"type=SYSCALL msg=audit(1700000000.123:42): comm="systemctl""#;
        assert!(match_audit_line(syscall, &commands()).is_empty());
    }

    #[test]
    fn journal_fallback_matches_messages() {
        let line = r#"{"MESSAGE":"EXECVE argc=3 a0=\"ufw\" a1=\"allow\" a2=\"22\"","__REALTIME_TIMESTAMP":"1700000000000000"}"#;
        let events = match_journal_entry(line, &commands());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "auditd-fallback");
        assert_eq!(events[0].command.as_deref(), Some("ufw"));
        assert!(match_journal_entry("{}", &commands()).is_empty());
    }

    #[test]
    fn partial_lines_wait_for_their_newline() {
        let mut buf = String::from("one\ntwo\nthr");
        assert_eq!(drain_lines(&mut buf), vec!["one", "two"]);
        assert_eq!(buf, "thr");
        buf.push_str("ee\n");
        assert_eq!(drain_lines(&mut buf), vec!["three"]);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn tail_survives_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("audit.log");
        std::fs::write(&log, "first record\nsecond record\n").unwrap();

        let mut tail = LogTail::open_at_end(&log).await.unwrap();
        assert!(tail.poll().await.unwrap().is_empty());

        std::fs::write(&log, "fresh\n").unwrap();
        assert_eq!(tail.poll().await.unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn tail_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("audit.log");
        std::fs::write(&log, "old\n").unwrap();
        let mut tail = LogTail::open_at_end(&log).await.unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "last in old file").unwrap();
        drop(f);
        std::fs::rename(&log, dir.path().join("audit.log.1")).unwrap();
        std::fs::write(&log, "first in new file\n").unwrap();

        assert_eq!(
            tail.poll().await.unwrap(),
            vec!["last in old file", "first in new file"]
        );
        assert!(tail.poll().await.unwrap().is_empty());
    }

    async fn start(
        log: &Path,
    ) -> (
        mpsc::Receiver<Event>,
        ShutdownTrigger,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let (trigger, shutdown) = crate::shutdown::channel();
        let sender = EventSender {
            tx,
            shutdown: shutdown.clone(),
        };
        let listener = Box::new(AuditdListener::new(commands()).with_log(log));
        let task = tokio::spawn(listener.run(sender, shutdown));
        tokio::time::sleep(Duration::from_millis(200)).await;
        (rx, trigger, task)
    }

    #[tokio::test]
    async fn rotated_log_keeps_producing_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("audit.log");
        std::fs::write(&log, "").unwrap();
        let (mut rx, trigger, task) = start(&log).await;

        std::fs::rename(&log, dir.path().join("audit.log.1")).unwrap();
        std::fs::write(&log, "type=EXECVE argc=2 a0=\"ufw\" a1=\"disable\"\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.command.as_deref(), Some("ufw"));

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tails_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("audit.log");
        std::fs::write(&log, "type=EXECVE a0=\"systemctl\" old record\n").unwrap();
        let (mut rx, trigger, task) = start(&log).await;

        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "type=EXECVE argc=2 a0=\"ufw\" a1=\"disable\"").unwrap();
        drop(f);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.command.as_deref(), Some("ufw"));

        trigger.trigger();
        task.await.unwrap().unwrap();
    }
}
