use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Milestones recorded on a call while it is being filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    FilteringInitiated,
    FilteringCompleted,
    FilteringTimedOut,
    BlockCheckInitiated,
    BlockCheckFinished,
    DirectToVoicemailInitiated,
    DirectToVoicemailFinished,
    ScreeningSent,
    BindScreening,
    ScreeningBound,
    ScreeningCompleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::FilteringInitiated => "FILTERING_INITIATED",
            EventKind::FilteringCompleted => "FILTERING_COMPLETED",
            EventKind::FilteringTimedOut => "FILTERING_TIMED_OUT",
            EventKind::BlockCheckInitiated => "BLOCK_CHECK_INITIATED",
            EventKind::BlockCheckFinished => "BLOCK_CHECK_FINISHED",
            EventKind::DirectToVoicemailInitiated => "DIRECT_TO_VM_INITIATED",
            EventKind::DirectToVoicemailFinished => "DIRECT_TO_VM_FINISHED",
            EventKind::ScreeningSent => "SCREENING_SENT",
            EventKind::BindScreening => "BIND_SCREENING",
            EventKind::ScreeningBound => "SCREENING_BOUND",
            EventKind::ScreeningCompleted => "SCREENING_COMPLETED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    pub kind: EventKind,
    pub detail: Option<String>,
    pub offset_ms: u64, // Milliseconds since the trail was opened
}

/// Append-only, thread-safe event trail.
#[derive(Debug)]
pub struct EventLog {
    opened: Instant,
    events: Mutex<Vec<CallEvent>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            opened: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> MutexGuard<'_, Vec<CallEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, kind: EventKind, detail: Option<String>) {
        let event = CallEvent {
            kind,
            detail,
            offset_ms: self.opened.elapsed().as_millis() as u64,
        };
        self.events().push(event);
    }

    pub fn snapshot(&self) -> Vec<CallEvent> {
        self.events().clone()
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.events().iter().any(|e| e.kind == kind)
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}
