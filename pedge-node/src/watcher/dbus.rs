use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{Event, EventSender, Listener, follow};
use crate::shutdown::Shutdown;

const MANAGER_MATCH: &str = "type='signal',path='/org/freedesktop/systemd1',interface='org.freedesktop.systemd1.Manager'";

/// systemd manager signals, read from `busctl monitor`.
pub struct DbusListener;

/// One message as printed by `busctl --json=short monitor`.
#[derive(Debug, Deserialize)]
struct BusMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    member: String,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    data: Vec<Value>,
}

/// Map a manager signal to an event.
///
/// `UnitNew` and `UnitRemoved` always produce one. `JobRemoved` only does
/// when the job did not finish with `done`; `JobNew` is only logged.
pub(crate) fn parse_signal(line: &str) -> Option<Event> {
    let msg: BusMessage = serde_json::from_str(line).ok()?;
    if msg.kind != "signal" {
        return None;
    }
    let data = msg.payload.map(|p| p.data).unwrap_or_default();
    let arg = |i: usize| data.get(i).and_then(Value::as_str);

    match msg.member.as_str() {
        "UnitNew" | "UnitRemoved" => {
            let unit = arg(0)?;
            debug!("[dbus] {} {}", msg.member, unit);
            Some(Event::unit_state_changed("dbus", unit).with("signal", msg.member.as_str()))
        }
        "JobNew" => {
            if let Some(unit) = arg(2) {
                debug!("[dbus] Job started for unit {}", unit);
            }
            None
        }
        "JobRemoved" => {
            let unit = arg(2)?;
            let result = arg(3)?;
            debug!("[dbus] Job completed for unit {} (result: {})", unit, result);
            (result != "done").then(|| {
                Event::unit_state_changed("dbus", unit)
                    .with("signal", "JobRemoved")
                    .with("result", result)
            })
        }
        _ => None,
    }
}

#[async_trait]
impl Listener for DbusListener {
    fn name(&self) -> &'static str {
        "dbus"
    }

    async fn run(self: Box<Self>, mut events: EventSender, mut shutdown: Shutdown) -> Result<()> {
        let (_child, mut lines) = follow(
            "busctl",
            &["--system", "--json=short", "monitor", "--match", MANAGER_MATCH],
        )?;
        info!("[dbus] Monitoring systemd manager signals");

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        if let Some(event) = parse_signal(&line)
                            && !events.send(event).await
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("[dbus] Read error: {}", e),
                    None => {
                        debug!("[dbus] busctl exited");
                        break;
                    }
                },
                _ = shutdown.wait() => break,
            }
        }
        Ok(())
    }
}
