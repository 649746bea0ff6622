use crate::events::{CallEvent, EventKind, EventLog};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// An incoming call as seen by the filtering pipeline.
///
/// Filters only read the id and the handle. The event trail is the one
/// part that changes while the call is being filtered.
#[derive(Debug)]
pub struct Call {
    id: String,
    handle: Option<String>,
    created_at: Instant,
    events: EventLog,
}

impl Call {
    pub fn new(id: impl Into<String>, handle: Option<String>) -> Self {
        Self {
            id: id.into(),
            handle,
            created_at: Instant::now(),
            events: EventLog::new(),
        }
    }

    /// Create an incoming call for a bare number, with a generated id.
    pub fn incoming(number: &str) -> Self {
        let seq = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("TC@{seq}"), Some(format!("tel:{}", number.trim())))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full address URI, e.g. `tel:+15551234567`.
    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    /// Scheme-specific part of the handle.
    pub fn number(&self) -> Option<&str> {
        self.handle.as_deref().map(|handle| match handle.split_once(':') {
            Some((_, rest)) => rest,
            None => handle,
        })
    }

    pub fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    pub fn add_event(&self, kind: EventKind, detail: Option<String>) {
        match &detail {
            Some(detail) => log::debug!("[{}] {}: {}", self.id, kind, detail),
            None => log::debug!("[{}] {}", self.id, kind),
        }
        self.events.record(kind, detail);
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn event_trail(&self) -> Vec<CallEvent> {
        self.events.snapshot()
    }

    pub fn to_screenable(&self) -> ScreenableCall {
        ScreenableCall {
            call_id: self.id.clone(),
            handle: self.handle.clone(),
            number: self.number().map(str::to_string),
            age_ms: self.age_ms(),
        }
    }
}

/// The view of a call handed to an external screening provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenableCall {
    pub call_id: String,
    pub handle: Option<String>,
    pub number: Option<String>,
    pub age_ms: u64,
}
