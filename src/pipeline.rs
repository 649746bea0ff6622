use crate::blocklist::{BlockChecker, BlockedNumberStore};
use crate::call::Call;
use crate::caller_info::{CallerInfoLookup, ContactDirectory};
use crate::callfiltering::screening::{
    DefaultDialerResolver, ScreeningServiceDiscovery, ScreeningTransport,
};
use crate::callfiltering::{
    BlockCheckFilter, CallFilter, CallFilteringListener, DirectToVoicemailFilter,
    FilterCoordinator, FilterResult, ScreeningServiceFilter,
};
use crate::config::{Config, Timeouts};
use crate::events::EventKind;
use crate::provider::{LocalScreeningProvider, StaticScreeningDirectory};
use crate::statistics::{StatEvent, StatsRecorder};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// The services the filters consult.
pub struct Collaborators {
    pub caller_info: Arc<dyn CallerInfoLookup>,
    pub block_checker: Arc<dyn BlockChecker>,
    pub dialer: Arc<dyn DefaultDialerResolver>,
    pub discovery: Arc<dyn ScreeningServiceDiscovery>,
    pub transport: Arc<dyn ScreeningTransport>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Result<Self> {
        let directory = Arc::new(StaticScreeningDirectory::from_config(&config.screening));
        Ok(Self {
            caller_info: Arc::new(ContactDirectory::from_config(&config.voicemail)),
            block_checker: Arc::new(BlockedNumberStore::from_config(&config.block_list)?),
            dialer: directory.clone(),
            discovery: directory,
            transport: Arc::new(LocalScreeningProvider::from_config(&config.screening)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FilteringOutcome {
    pub call: Arc<Call>,
    pub result: FilterResult,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Runs every incoming call through the voicemail, block list and
/// screening filters.
pub struct CallFilterPipeline {
    timeouts: Arc<dyn Timeouts>,
    collaborators: Collaborators,
    statistics: Option<StatsRecorder>,
}

impl CallFilterPipeline {
    pub fn new(timeouts: Arc<dyn Timeouts>, collaborators: Collaborators) -> Self {
        Self {
            timeouts,
            collaborators,
            statistics: None,
        }
    }

    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::new(config, collaborators))
    }

    pub fn with_statistics(mut self, statistics: StatsRecorder) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Suspend blocking for the configured window after an emergency call.
    pub fn note_emergency_contact(&self) {
        self.collaborators.block_checker.note_emergency_contact();
    }

    /// Fresh filter instances; each one serves a single call.
    pub fn build_filters(&self) -> Vec<Arc<dyn CallFilter>> {
        let c = &self.collaborators;
        vec![
            Arc::new(DirectToVoicemailFilter::new(Arc::clone(&c.caller_info))),
            Arc::new(BlockCheckFilter::new(Arc::clone(&c.block_checker))),
            Arc::new(ScreeningServiceFilter::new(
                Arc::clone(&c.dialer),
                Arc::clone(&c.discovery),
                Arc::clone(&c.transport),
            )),
        ]
    }

    /// Start filtering `call`; the receiver yields the single decision.
    pub fn filter_incoming_call(&self, call: Arc<Call>) -> Result<oneshot::Receiver<FilteringOutcome>> {
        let (sender, receiver) = oneshot::channel();
        let listener = Arc::new(OutcomeListener {
            started: Instant::now(),
            sender: Mutex::new(Some(sender)),
            statistics: self.statistics.clone(),
        });

        let timeout = self.timeouts.call_screening_timeout();
        log::info!(
            "[{}] filtering incoming call from {}",
            call.id(),
            call.number().unwrap_or("unknown")
        );
        FilterCoordinator::new(call, self.build_filters(), timeout, listener)
            .perform_filtering()?;
        Ok(receiver)
    }

    pub async fn filter(&self, call: Arc<Call>) -> Result<FilteringOutcome> {
        let receiver = self.filter_incoming_call(call)?;
        receiver
            .await
            .context("filtering finished without a decision")
    }
}

struct OutcomeListener {
    started: Instant,
    sender: Mutex<Option<oneshot::Sender<FilteringOutcome>>>,
    statistics: Option<StatsRecorder>,
}

impl CallFilteringListener for OutcomeListener {
    fn on_call_filtering_complete(&self, call: Arc<Call>, result: FilterResult) {
        let outcome = FilteringOutcome {
            timed_out: call.events().contains(EventKind::FilteringTimedOut),
            elapsed: self.started.elapsed(),
            call,
            result,
        };

        if let Some(statistics) = &self.statistics {
            statistics.record_event(StatEvent::CallFiltered {
                result,
                timed_out: outcome.timed_out,
                elapsed_ms: outcome.elapsed.as_millis() as u64,
            });
        }

        let sender = self.sender.lock().ok().and_then(|mut s| s.take());
        match sender {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    log::debug!("Filtering outcome receiver went away");
                }
            }
            None => log::warn!("Filtering outcome delivered more than once"),
        }
    }
}
