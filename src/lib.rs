pub mod blocklist;
pub mod call;
pub mod caller_info;
pub mod callfiltering;
pub mod config;
pub mod disposition;
pub mod events;
pub mod pipeline;
pub mod provider;
pub mod statistics;

pub use call::Call;
pub use callfiltering::{CallFilter, CallFilteringListener, FilterCoordinator, FilterResult};
pub use config::Config;
pub use disposition::Disposition;
pub use pipeline::{CallFilterPipeline, FilteringOutcome};
pub use statistics::{StatEvent, StatisticsCollector};
