use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::event::journal_timestamp;
use super::{Event, EventSender, Listener, follow};
use crate::shutdown::Shutdown;

const STATE_MARKERS: &[&str] = &["Started", "Stopped", "Failed", "Reloaded"];

/// syslog `err`; anything at or above this severity is worth a log event.
const ERROR_PRIORITY: u8 = 3;

/// Journal entries of the configured units.
pub struct JournaldListener {
    units: Vec<String>,
}

impl JournaldListener {
    pub fn new(units: Vec<String>) -> Self {
        Self { units }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--output=json".to_string(),
            "--follow".to_string(),
            "--lines=0".to_string(),
        ];
        for unit in &self.units {
            args.push("-u".to_string());
            args.push(format!("{unit}.service"));
        }
        args
    }
}

/// Turn one `journalctl --output=json` line into an event.
///
/// Lifecycle messages become unit state changes; other messages at error
/// priority or worse become service log events; everything else is ignored.
pub(crate) fn parse_entry(line: &str) -> Option<Event> {
    let entry: Value = serde_json::from_str(line).ok()?;
    let field = |name: &str| entry.get(name).and_then(Value::as_str);

    let message = field("MESSAGE")?;
    let unit = field("UNIT").or_else(|| field("_SYSTEMD_UNIT"))?;
    let timestamp = journal_timestamp(field("__REALTIME_TIMESTAMP"));

    if STATE_MARKERS.iter().any(|m| message.contains(m)) {
        return Some(
            Event::unit_state_changed("journald", unit)
                .at(timestamp)
                .with("message", message),
        );
    }

    let priority = field("PRIORITY").and_then(|p| p.parse::<u8>().ok())?;
    (priority <= ERROR_PRIORITY).then(|| {
        Event::service_log("journald", unit)
            .at(timestamp)
            .with("message", message)
            .with("priority", priority.to_string())
    })
}

#[async_trait]
impl Listener for JournaldListener {
    fn name(&self) -> &'static str {
        "journald"
    }

    async fn run(self: Box<Self>, mut events: EventSender, mut shutdown: Shutdown) -> Result<()> {
        if self.units.is_empty() {
            info!("[journald] No units configured, skipping");
            return Ok(());
        }

        let args = self.args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let (_child, mut lines) = follow("journalctl", &args)?;
        info!("[journald] Watching units: {}", self.units.join(", "));

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        if let Some(event) = parse_entry(&line)
                            && !events.send(event).await
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("[journald] Read error: {}", e),
                    None => {
                        debug!("[journald] journalctl exited");
                        break;
                    }
                },
                _ = shutdown.wait() => break,
            }
        }
        Ok(())
    }
}
