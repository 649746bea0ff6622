//! Incoming call filtering
//!
//! Every incoming call is run through a set of independent filters. Each
//! filter reports one verdict, the verdicts are merged by
//! [`FilterResult::merge`], and the [`FilterCoordinator`] hands exactly one
//! decision back to its owner, either once every filter has reported or
//! when the filtering timeout expires.

pub mod block_check;
pub mod coordinator;
pub mod result;
pub mod screening;
pub mod voicemail;

pub use block_check::BlockCheckFilter;
pub use coordinator::{CallFilteringListener, FilterCoordinator};
pub use result::FilterResult;
pub use screening::ScreeningServiceFilter;
pub use voicemail::DirectToVoicemailFilter;

use crate::call::Call;
use std::sync::Arc;

/// Receives the verdict of one filter. Being `FnOnce`, it can only ever
/// be invoked once.
pub type FilterResultCallback = Box<dyn FnOnce(Arc<Call>, FilterResult) + Send + 'static>;

/// Something that can evaluate an incoming call asynchronously.
///
/// `start_filter_lookup` must return without blocking and must eventually
/// invoke `callback`, from any thread. Internal failures are reported as
/// [`FilterResult::default`] rather than dropped.
pub trait CallFilter: Send + Sync {
    fn name(&self) -> &str;

    fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback);

    /// Release any external resources held for an unfinished lookup.
    fn cancel(&self) {}
}
