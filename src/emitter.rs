//! Executor event emission
//!
//! The executor reports progress through an injected [`Emitter`] instead of
//! a global logger. [`TracingEmitter`] forwards to `tracing`;
//! [`MemoryEmitter`] keeps events for inspection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured executor event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorEvent {
    pub level: EventLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl ExecutorEvent {
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }
}

impl fmt::Display for ExecutorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for (k, v) in &self.fields {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

/// Sink for executor events
pub trait Emitter: Send + Sync {
    fn emit(&self, event: ExecutorEvent);

    fn debug(&self, message: &str) {
        self.emit(ExecutorEvent::new(EventLevel::Debug, message));
    }

    fn info(&self, message: &str) {
        self.emit(ExecutorEvent::new(EventLevel::Info, message));
    }

    fn warn(&self, message: &str) {
        self.emit(ExecutorEvent::new(EventLevel::Warn, message));
    }

    fn error(&self, message: &str) {
        self.emit(ExecutorEvent::new(EventLevel::Error, message));
    }
}

pub type SharedEmitter = Arc<dyn Emitter>;

/// Forwards events to `tracing` under the `sshcompose::executor` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl Emitter for TracingEmitter {
    fn emit(&self, event: ExecutorEvent) {
        match event.level {
            EventLevel::Debug => tracing::debug!(target: "sshcompose::executor", "{}", event),
            EventLevel::Info => tracing::info!(target: "sshcompose::executor", "{}", event),
            EventLevel::Warn => tracing::warn!(target: "sshcompose::executor", "{}", event),
            EventLevel::Error => tracing::error!(target: "sshcompose::executor", "{}", event),
        }
    }
}

/// Records events in memory
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    events: Mutex<Vec<ExecutorEvent>>,
}

impl MemoryEmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ExecutorEvent> {
        self.events.lock().clone()
    }

    /// Messages at `level`, in emission order
    pub fn messages(&self, level: EventLevel) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.message.clone())
            .collect()
    }
}

impl Emitter for MemoryEmitter {
    fn emit(&self, event: ExecutorEvent) {
        self.events.lock().push(event);
    }
}
