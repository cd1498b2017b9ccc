//! Structured diagnostic events
//!
//! Hardware-reported completion errors and queue state errors are emitted
//! as classed events with typed fields. Emission never blocks the data
//! path.

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Completion entry error class
pub const CLASS_CQE_ERR: &str = "nicq.cqe.err";

/// Work queue state error class
pub const CLASS_QSTATE_ERR: &str = "nicq.qstate.err";

/// Typed event field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagValue {
    /// 8-bit value
    U8(u8),
    /// 16-bit value
    U16(u16),
    /// 32-bit value
    U32(u32),
    /// 64-bit value
    U64(u64),
    /// String value
    Str(String),
}

impl fmt::Display for DiagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v:#x}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

/// A classed diagnostic event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEvent {
    /// Event class
    pub class: &'static str,
    /// Named fields in emission order
    pub fields: Vec<(&'static str, DiagValue)>,
}

impl DiagnosticEvent {
    /// Event with no fields
    pub fn new(class: &'static str) -> Self {
        Self {
            class,
            fields: Vec::new(),
        }
    }

    /// Append a field
    pub fn field(mut self, name: &'static str, value: DiagValue) -> Self {
        self.fields.push((name, value));
        self
    }

    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<&DiagValue> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class)?;
        for (name, value) in &self.fields {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

/// Non-blocking event sink
pub trait DiagnosticSink: Send + Sync {
    /// Emit `event`; must not block
    fn emit(&self, event: DiagnosticEvent);
}

/// Logs events through `tracing`
#[derive(Debug, Default)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn emit(&self, event: DiagnosticEvent) {
        tracing::warn!(class = event.class, event = %event, "diagnostic event");
    }
}

/// Queues events on a bounded channel; drops and counts on overflow
pub struct ChannelDiagnostics {
    tx: Sender<DiagnosticEvent>,
    dropped: AtomicU64,
}

impl ChannelDiagnostics {
    /// Sink with room for `capacity` undelivered events, plus its receiver
    pub fn new(capacity: usize) -> (Self, Receiver<DiagnosticEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DiagnosticSink for ChannelDiagnostics {
    fn emit(&self, event: DiagnosticEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("nicq_diag_dropped_total").increment(1);
            }
        }
    }
}
