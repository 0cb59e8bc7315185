/*
[INPUT]:  Order events delivered by the notification client
[OUTPUT]: Log lines, or one JSON document per event on stdout
[POS]:    Presentation layer - what the watcher does with each event
[UPDATE]: When adding output formats
*/

use std::io::Write;

use order_notify_client::{ListenerResult, OrderEvent, OrderListener};
use tracing::info;

/// How the watcher reports events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Structured `tracing` log line
    #[default]
    Log,
    /// Newline-delimited JSON on stdout
    Json,
}

/// Listener shared by every watched order
#[derive(Debug, Clone, Copy, Default)]
pub struct EventPrinter {
    format: OutputFormat,
}

impl EventPrinter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }
}

/// Render an event as a single JSON line
pub fn render_json(event: &OrderEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

impl OrderListener for EventPrinter {
    fn handle_event(&self, event: &OrderEvent) -> ListenerResult {
        match self.format {
            OutputFormat::Log => {
                info!(
                    order_id = %event.order_id,
                    kind = %event.kind,
                    received_at = %event.received_at,
                    payload = %serde_json::Value::Object(event.payload.clone()),
                    "order event"
                );
            }
            OutputFormat::Json => {
                let line = render_json(event)?;
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{line}")?;
            }
        }
        Ok(())
    }
}
