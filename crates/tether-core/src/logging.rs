//! Tracing integration and the in-process log buffer.
//!
//! Operator-facing log lines carry a bracketed module tag (`[系统]`,
//! `[连接]`, `[执行]`, `[浏览器]`, `[心跳]`, `[管理]`, `[Web]`). Every
//! event is mirrored into a ring buffer so the management panel can dump
//! recent history and stream new entries live; subscriber channels are
//! bounded and silently drop entries when full so logging never blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::constants::{LOG_BUFFER_SIZE, LOG_SUBSCRIBER_CAPACITY};
use crate::error::{Error, Result};

/// Log severity, taken from the tracing level at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub module: String,
    pub message: String,
}

/// Ring buffer of recent log entries with bounded fan-out.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<LogEntry>)>>,
    next_subscriber: AtomicU64,
}

impl LogBuffer {
    /// Create a buffer retaining `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
        }
    }

    /// Buffer with the standard capacity.
    pub fn standard() -> Arc<Self> {
        Arc::new(Self::new(LOG_BUFFER_SIZE))
    }

    /// Append an entry, evicting the oldest when full, and fan it out to
    /// subscribers. Subscribers with a full channel miss the entry.
    pub fn push(&self, entry: LogEntry) {
        {
            let mut entries = self.entries.lock().expect("log lock poisoned");
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        let subs = self.subscribers.lock().expect("log lock poisoned");
        for (_, tx) in subs.iter() {
            let _ = tx.try_send(entry.clone());
        }
    }

    /// All retained entries, oldest first.
    pub fn all(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .expect("log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Register a live subscriber. Returns its id and the receiving end.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(LOG_SUBSCRIBER_CAPACITY);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("log lock poisoned")
            .push((id, tx));
        (id, rx)
    }

    /// Remove a subscriber, closing its channel.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("log lock poisoned")
            .retain(|(sub_id, _)| *sub_id != id);
    }
}

/// Split a `[模块] message` line into module and message.
///
/// Lines without a tag fall under `系统`.
fn split_module(text: &str) -> (String, String) {
    if let Some(rest) = text.strip_prefix('[') {
        if let Some(idx) = rest.find("] ") {
            return (rest[..idx].to_string(), rest[idx + 2..].to_string());
        }
    }
    ("系统".to_string(), text.to_string())
}

/// Tracing layer mirroring every event into a [`LogBuffer`].
struct BufferLayer {
    buffer: Arc<LogBuffer>,
}

impl<S> Layer<S> for BufferLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let (module, message) = split_module(&visitor.message);
        self.buffer.push(LogEntry {
            time: Utc::now(),
            level: event.metadata().level().into(),
            module,
            message,
        });
    }
}

/// Visitor capturing the event's `message` field.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `verbosity` maps 0=error, 1=warn, 2=info, 3=debug, 4+=trace;
/// `RUST_LOG` overrides it. When `buffer` is given, every event is also
/// mirrored into it for the management panel.
pub fn init_logging(verbosity: u8, buffer: Option<Arc<LogBuffer>>) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tether_core={level},tether_agent={level}"))
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(verbosity >= 3)
        .with_line_number(verbosity >= 3);

    let buffer_layer = buffer.map(|buffer| BufferLayer { buffer });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(buffer_layer)
        .try_init()
        .map_err(|e| Error::internal(e.to_string()))
}
