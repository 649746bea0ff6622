use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict of one or more call filters.
///
/// The default is the most permissive verdict. Merging only ever makes a
/// verdict more restrictive, so the outcome of merging a set of verdicts
/// does not depend on the order they arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterResult {
    pub allow: bool,
    pub reject: bool,
    pub log_call: bool,
    pub notify: bool,
}

impl Default for FilterResult {
    fn default() -> Self {
        Self {
            allow: true,
            reject: false,
            log_call: true,
            notify: true,
        }
    }
}

impl FilterResult {
    pub fn new(allow: bool, reject: bool, log_call: bool, notify: bool) -> Self {
        Self {
            allow,
            reject,
            log_call,
            notify,
        }
    }

    /// A call on the block list: rejected silently, not logged.
    pub fn blocked() -> Self {
        Self::new(false, true, false, false)
    }

    /// A call that goes straight to voicemail: rejected but still logged
    /// and notified as missed.
    pub fn send_to_voicemail() -> Self {
        Self::new(false, true, true, true)
    }

    pub fn merge(&self, other: &FilterResult) -> FilterResult {
        FilterResult {
            allow: self.allow && other.allow,
            reject: self.reject || other.reject,
            log_call: self.log_call && other.log_call,
            notify: self.notify && other.notify,
        }
    }

    /// Merging with a missing verdict leaves this one unchanged.
    pub fn merge_opt(&self, other: Option<&FilterResult>) -> FilterResult {
        match other {
            Some(other) => self.merge(other),
            None => *self,
        }
    }
}

impl fmt::Display for FilterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allow {
            "Allow"
        } else if self.reject {
            "Reject"
        } else {
            "Ignore"
        };
        write!(f, "[{verdict}")?;
        if self.log_call {
            write!(f, ", logged")?;
        }
        if self.notify {
            write!(f, ", notified")?;
        }
        write!(f, "]")
    }
}
