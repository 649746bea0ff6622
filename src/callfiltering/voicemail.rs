use super::{CallFilter, FilterResult, FilterResultCallback};
use crate::call::Call;
use crate::caller_info::CallerInfoLookup;
use crate::events::EventKind;
use std::sync::Arc;

/// Sends calls straight to voicemail when the caller's contact entry asks
/// for it.
pub struct DirectToVoicemailFilter {
    lookup: Arc<dyn CallerInfoLookup>,
}

impl DirectToVoicemailFilter {
    pub fn new(lookup: Arc<dyn CallerInfoLookup>) -> Self {
        Self { lookup }
    }
}

impl CallFilter for DirectToVoicemailFilter {
    fn name(&self) -> &str {
        "direct_to_voicemail"
    }

    fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback) {
        call.add_event(EventKind::DirectToVoicemailInitiated, None);

        let Some(call_handle) = call.handle().map(str::to_string) else {
            let result = FilterResult::default();
            call.add_event(EventKind::DirectToVoicemailFinished, Some(result.to_string()));
            callback(call, result);
            return;
        };

        let lookup_handle = call_handle.clone();
        self.lookup.start_lookup(
            &lookup_handle,
            Box::new(move |handle, info| {
                // A mismatched answer is dropped; the coordinator's timeout
                // covers the missing verdict.
                if handle != call_handle {
                    log::warn!(
                        "[{}] caller info returned for {handle}, expected {call_handle}",
                        call.id()
                    );
                    return;
                }

                let result = if info.send_to_voicemail {
                    FilterResult::send_to_voicemail()
                } else {
                    FilterResult::default()
                };
                call.add_event(EventKind::DirectToVoicemailFinished, Some(result.to_string()));
                callback(call, result);
            }),
        );
    }
}
