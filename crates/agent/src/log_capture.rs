//! Copies WARN and ERROR log events into the journal.
//!
//! The layer is installed with the subscriber, long before a journal
//! exists, so events go through a bounded channel and [`forward`] drains
//! it once the journal is open. Entries are global: they carry no
//! conversation and never show up in a conversation's context.

use ouroboros_core::journal::{Journal, JournalEntry, JournalKind};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber, warn};
use tracing_subscriber::layer::{Context, Layer};

/// Events buffered before the forwarder catches up; the rest are dropped.
const BUFFER: usize = 256;

/// Our own events and the journal's would feed back into the journal.
const SKIPPED_TARGETS: &[&str] = &[
    module_path!(),
    "ouroboros_agent::journal",
    "hyper",
    "reqwest",
    "h2",
    "rustls",
    "tokio",
    "mio",
];

pub struct JournalLayer {
    sender: mpsc::Sender<JournalEntry>,
}

/// The receiving end, handed to [`forward`].
pub struct CapturedLogs {
    receiver: mpsc::Receiver<JournalEntry>,
}

/// A layer plus the channel it writes to.
pub fn journal_layer() -> (JournalLayer, CapturedLogs) {
    let (sender, receiver) = mpsc::channel(BUFFER);
    (JournalLayer { sender }, CapturedLogs { receiver })
}

/// Append captured events to `journal` until every layer is dropped.
pub fn forward(logs: CapturedLogs, journal: Arc<dyn Journal>) -> tokio::task::JoinHandle<()> {
    let mut receiver = logs.receiver;
    tokio::spawn(async move {
        while let Some(entry) = receiver.recv().await {
            if let Err(e) = journal.append(entry).await {
                warn!(error = %e, "Captured log event not journaled");
            }
        }
    })
}

fn skipped(target: &str) -> bool {
    SKIPPED_TARGETS
        .iter()
        .any(|prefix| target == *prefix || target.starts_with(&format!("{prefix}::")))
}

impl<S: Subscriber> Layer<S> for JournalLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if level > Level::WARN || skipped(metadata.target()) {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        let summary = if fields.extra.is_empty() {
            fields.message
        } else {
            format!("{} ({})", fields.message, fields.extra.join(", "))
        };
        let entry = JournalEntry::new(
            None,
            JournalKind::Error,
            serde_json::json!({
                "summary": summary,
                "level": level.as_str().to_ascii_lowercase(),
                "target": metadata.target(),
            }),
        );
        // Full or closed: the event is still on stderr.
        let _ = self.sender.try_send(entry);
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    extra: Vec<String>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.extra.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.extra.push(format!("{}={value:?}", field.name()));
        }
    }
}
