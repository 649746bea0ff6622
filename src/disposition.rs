//! What the call-processing owner does with a delivered verdict.

use crate::callfiltering::FilterResult;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallAction {
    Ring,
    Reject,
    LogMissed { notify: bool },
    ShowMissedCallNotification,
}

pub const MAXIMUM_RINGING_CALLS: usize = 1;
pub const MAXIMUM_DIALING_CALLS: usize = 1;

/// Calls already occupying the device when a new one finishes filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallLoad {
    pub ringing: usize,
    pub dialing: usize,
}

impl CallLoad {
    pub fn new(ringing: usize, dialing: usize) -> Self {
        Self { ringing, dialing }
    }

    pub fn has_maximum_ringing_calls(&self) -> bool {
        self.ringing >= MAXIMUM_RINGING_CALLS
    }

    pub fn has_maximum_dialing_calls(&self) -> bool {
        self.dialing >= MAXIMUM_DIALING_CALLS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disposition {
    /// False when the call hung up while it was being filtered.
    pub set_ringing: bool,
    pub actions: Vec<CallAction>,
}

impl Disposition {
    pub fn for_result(
        result: &FilterResult,
        already_disconnected: bool,
        load: &CallLoad,
    ) -> Self {
        let mut actions = Vec::new();

        if result.allow {
            let over_limit = if load.has_maximum_ringing_calls() {
                Some("ringing")
            } else if load.has_maximum_dialing_calls() {
                Some("dialing")
            } else {
                None
            };
            match over_limit {
                Some(kind) => {
                    log::info!("Call rejected, exceeds maximum number of {kind} calls");
                    actions.push(CallAction::Reject);
                    actions.push(CallAction::LogMissed { notify: true });
                }
                None => actions.push(CallAction::Ring),
            }
        } else {
            if result.reject {
                actions.push(CallAction::Reject);
            }
            if result.log_call {
                actions.push(CallAction::LogMissed {
                    notify: result.notify,
                });
            } else if result.notify {
                actions.push(CallAction::ShowMissedCallNotification);
            }
        }

        Disposition {
            set_ringing: !already_disconnected,
            actions,
        }
    }

    pub fn rings(&self) -> bool {
        self.actions.contains(&CallAction::Ring)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<String> = self
            .actions
            .iter()
            .map(|action| match action {
                CallAction::Ring => "ring".to_string(),
                CallAction::Reject => "reject".to_string(),
                CallAction::LogMissed { notify: true } => "log missed + notify".to_string(),
                CallAction::LogMissed { notify: false } => "log missed".to_string(),
                CallAction::ShowMissedCallNotification => "notify missed".to_string(),
            })
            .collect();
        if actions.is_empty() {
            write!(f, "ignore")
        } else {
            write!(f, "{}", actions.join(", "))
        }
    }
}
