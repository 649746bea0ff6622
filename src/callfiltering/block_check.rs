use super::{CallFilter, FilterResult, FilterResultCallback};
use crate::blocklist::BlockChecker;
use crate::call::Call;
use crate::events::EventKind;
use std::sync::Arc;

/// Looks the caller up in the block list on a blocking worker thread.
pub struct BlockCheckFilter {
    checker: Arc<dyn BlockChecker>,
}

impl BlockCheckFilter {
    pub fn new(checker: Arc<dyn BlockChecker>) -> Self {
        Self { checker }
    }
}

impl CallFilter for BlockCheckFilter {
    fn name(&self) -> &str {
        "block_check"
    }

    fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback) {
        call.add_event(EventKind::BlockCheckInitiated, None);
        let checker = Arc::clone(&self.checker);
        let number = call.number().map(str::to_string);

        tokio::spawn(async move {
            let lookup =
                tokio::task::spawn_blocking(move || checker.is_blocked(number.as_deref()));
            // A failed lookup never blocks the call
            let is_blocked = match lookup.await {
                Ok(Ok(is_blocked)) => is_blocked,
                Ok(Err(e)) => {
                    log::error!("[{}] block check failed: {e:#}", call.id());
                    false
                }
                Err(e) => {
                    log::error!("[{}] block check worker failed: {e}", call.id());
                    false
                }
            };

            let result = if is_blocked {
                FilterResult::blocked()
            } else {
                FilterResult::default()
            };
            call.add_event(EventKind::BlockCheckFinished, Some(result.to_string()));
            callback(call, result);
        });
    }
}
