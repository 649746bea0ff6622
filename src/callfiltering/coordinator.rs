//! Fan-out/fan-in coordinator for one incoming call.
//!
//! All filters are started at once. Their verdicts are merged into a
//! running result under a single lock, and the merged result is handed to
//! the owner exactly once: when the last filter reports, or when the
//! timeout fires, whichever comes first.

use super::{CallFilter, FilterResult, FilterResultCallback};
use crate::call::Call;
use crate::events::EventKind;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Owner of a filtering session. Called exactly once per session.
pub trait CallFilteringListener: Send + Sync {
    fn on_call_filtering_complete(&self, call: Arc<Call>, result: FilterResult);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilteringPhase {
    Created,
    Filtering,
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryTrigger {
    AllFiltersComplete,
    Timeout,
}

struct FilteringState {
    phase: FilteringPhase,
    pending: usize,
    result: FilterResult,
    home: Option<Handle>,
    timer: Option<JoinHandle<()>>,
    started: Option<Instant>,
}

struct Shared {
    call: Arc<Call>,
    filters: Vec<Arc<dyn CallFilter>>,
    timeout: Duration,
    listener: Arc<dyn CallFilteringListener>,
    state: Mutex<FilteringState>,
}

pub struct FilterCoordinator {
    shared: Arc<Shared>,
}

impl FilterCoordinator {
    pub fn new(
        call: Arc<Call>,
        filters: Vec<Arc<dyn CallFilter>>,
        timeout: Duration,
        listener: Arc<dyn CallFilteringListener>,
    ) -> Self {
        let pending = filters.len();
        Self {
            shared: Arc::new(Shared {
                call,
                filters,
                timeout,
                listener,
                state: Mutex::new(FilteringState {
                    phase: FilteringPhase::Created,
                    pending,
                    result: FilterResult::default(),
                    home: None,
                    timer: None,
                    started: None,
                }),
            }),
        }
    }

    pub fn call(&self) -> &Arc<Call> {
        &self.shared.call
    }

    pub fn phase(&self) -> FilteringPhase {
        self.shared.state().phase
    }

    /// Start every filter and arm the timeout, then return.
    ///
    /// Must be called from inside a tokio runtime; that runtime becomes the
    /// context on which the decision is delivered. Only the first call has
    /// any effect.
    pub fn perform_filtering(&self) -> Result<()> {
        let home = Handle::try_current().context("call filtering needs a tokio runtime")?;
        let shared = &self.shared;

        {
            let mut state = shared.state();
            if state.phase != FilteringPhase::Created {
                log::warn!(
                    "[{}] perform_filtering called again, ignoring",
                    shared.call.id()
                );
                return Ok(());
            }
            state.phase = FilteringPhase::Filtering;
            state.pending = shared.filters.len();
            state.home = Some(home.clone());
            state.started = Some(Instant::now());
        }

        shared.call.add_event(
            EventKind::FilteringInitiated,
            Some(format!("{} filters", shared.filters.len())),
        );
        log::debug!(
            "[{}] filtering with {} filters, timeout {:?}",
            shared.call.id(),
            shared.filters.len(),
            shared.timeout
        );

        let timer = home.spawn({
            let shared = Arc::clone(shared);
            async move {
                tokio::time::sleep(shared.timeout).await;
                shared.deliver(DeliveryTrigger::Timeout);
            }
        });
        {
            let mut state = shared.state();
            if state.phase == FilteringPhase::Delivered {
                timer.abort();
            } else {
                state.timer = Some(timer);
            }
        }

        if shared.filters.is_empty() {
            shared.schedule_delivery(&home);
            return Ok(());
        }

        for filter in &shared.filters {
            let name = filter.name().to_string();
            let callback: FilterResultCallback = Box::new({
                let shared = Arc::clone(shared);
                move |call, result| shared.on_filter_complete(&name, &call, result)
            });
            filter.start_filter_lookup(Arc::clone(&shared.call), callback);
        }

        Ok(())
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, FilteringState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_filter_complete(self: &Arc<Self>, filter: &str, call: &Call, result: FilterResult) {
        if call.id() != self.call.id() {
            log::warn!(
                "[{}] {} reported for a different call {}",
                self.call.id(),
                filter,
                call.id()
            );
        }

        let home = {
            let mut state = self.state();
            if state.phase != FilteringPhase::Filtering {
                log::debug!(
                    "[{}] {} reported {} after delivery, ignoring",
                    self.call.id(),
                    filter,
                    result
                );
                return;
            }
            if state.pending == 0 {
                log::warn!(
                    "[{}] unexpected extra result {} from {}",
                    self.call.id(),
                    result,
                    filter
                );
                return;
            }
            state.pending -= 1;
            state.result = state.result.merge(&result);
            log::debug!(
                "[{}] {} reported {}, {} pending, merged {}",
                self.call.id(),
                filter,
                result,
                state.pending,
                state.result
            );
            if state.pending > 0 {
                return;
            }
            state.home.clone()
        };

        if let Some(home) = home {
            self.schedule_delivery(&home);
        }
    }

    fn schedule_delivery(self: &Arc<Self>, home: &Handle) {
        let shared = Arc::clone(self);
        home.spawn(async move {
            shared.deliver(DeliveryTrigger::AllFiltersComplete);
        });
    }

    fn deliver(&self, trigger: DeliveryTrigger) {
        let (result, timer, pending, elapsed) = {
            let mut state = self.state();
            if state.phase != FilteringPhase::Filtering {
                return;
            }
            state.phase = FilteringPhase::Delivered;
            (
                state.result,
                state.timer.take(),
                state.pending,
                state.started.map(|s| s.elapsed()).unwrap_or_default(),
            )
        };

        // Every filter reported but the timer beat the scheduled delivery
        let trigger = if pending == 0 {
            DeliveryTrigger::AllFiltersComplete
        } else {
            trigger
        };

        match trigger {
            DeliveryTrigger::AllFiltersComplete => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                self.call
                    .add_event(EventKind::FilteringCompleted, Some(result.to_string()));
                log::info!(
                    "[{}] filtering complete in {}ms: {}",
                    self.call.id(),
                    elapsed.as_millis(),
                    result
                );
            }
            DeliveryTrigger::Timeout => {
                self.call.add_event(
                    EventKind::FilteringTimedOut,
                    Some(format!("{result}, {pending} pending")),
                );
                log::warn!(
                    "[{}] filtering timed out after {}ms with {} pending, using {}",
                    self.call.id(),
                    elapsed.as_millis(),
                    pending,
                    result
                );
                for filter in &self.filters {
                    filter.cancel();
                }
            }
        }

        self.listener
            .on_call_filtering_complete(Arc::clone(&self.call), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ImmediateFilter(FilterResult);

    impl CallFilter for ImmediateFilter {
        fn name(&self) -> &str {
            "immediate"
        }

        fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback) {
            callback(call, self.0);
        }
    }

    struct CancellableImmediateFilter {
        result: FilterResult,
        cancelled: AtomicUsize,
    }

    impl CallFilter for CancellableImmediateFilter {
        fn name(&self) -> &str {
            "cancellable_immediate"
        }

        fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback) {
            callback(call, self.result);
        }

        fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct DelayedFilter {
        result: FilterResult,
        delay: Duration,
    }

    impl CallFilter for DelayedFilter {
        fn name(&self) -> &str {
            "delayed"
        }

        fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback) {
            let result = self.result;
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                callback(call, result);
            });
        }
    }

    struct ThreadFilter(FilterResult);

    impl CallFilter for ThreadFilter {
        fn name(&self) -> &str {
            "thread"
        }

        fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback) {
            let result = self.0;
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                callback(call, result);
            });
        }
    }

    #[derive(Default)]
    struct SilentFilter {
        cancelled: AtomicUsize,
    }

    impl CallFilter for SilentFilter {
        fn name(&self) -> &str {
            "silent"
        }

        fn start_filter_lookup(&self, _call: Arc<Call>, _callback: FilterResultCallback) {}

        fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ChannelListener(mpsc::UnboundedSender<(String, FilterResult)>);

    impl CallFilteringListener for ChannelListener {
        fn on_call_filtering_complete(&self, call: Arc<Call>, result: FilterResult) {
            let _ = self.0.send((call.id().to_string(), result));
        }
    }

    fn new_coordinator(
        filters: Vec<Arc<dyn CallFilter>>,
        timeout: Duration,
    ) -> (
        FilterCoordinator,
        mpsc::UnboundedReceiver<(String, FilterResult)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let call = Arc::new(Call::new("test-call", Some("tel:+15550001".to_string())));
        let coordinator =
            FilterCoordinator::new(call, filters, timeout, Arc::new(ChannelListener(tx)));
        (coordinator, rx)
    }

    async fn expect_delivery(
        rx: &mut mpsc::UnboundedReceiver<(String, FilterResult)>,
    ) -> FilterResult {
        let (call_id, result) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no delivery")
            .expect("listener dropped");
        assert_eq!(call_id, "test-call");
        result
    }

    async fn expect_no_second_delivery(rx: &mut mpsc::UnboundedReceiver<(String, FilterResult)>) {
        match tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(second)) => panic!("second delivery: {second:?}"),
        }
    }

    fn delayed(result: FilterResult, ms: u64) -> Arc<dyn CallFilter> {
        Arc::new(DelayedFilter {
            result,
            delay: Duration::from_millis(ms),
        })
    }

    #[tokio::test]
    async fn test_all_permissive_delivers_immediately() {
        let filters = vec![
            delayed(FilterResult::default(), 5),
            delayed(FilterResult::default(), 10),
            delayed(FilterResult::default(), 1),
        ];
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(5000));
        let started = Instant::now();
        coordinator.perform_filtering().unwrap();

        assert_eq!(expect_delivery(&mut rx).await, FilterResult::default());
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(coordinator.phase(), FilteringPhase::Delivered);
        assert!(coordinator.call().events().contains(EventKind::FilteringCompleted));
        assert!(!coordinator.call().events().contains(EventKind::FilteringTimedOut));
        expect_no_second_delivery(&mut rx).await;
    }

    #[tokio::test]
    async fn test_one_reject_rejects_the_call() {
        let filters = vec![
            delayed(FilterResult::default(), 3),
            delayed(FilterResult::new(true, true, true, true), 6),
            delayed(FilterResult::default(), 1),
        ];
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(5000));
        coordinator.perform_filtering().unwrap();

        let result = expect_delivery(&mut rx).await;
        assert!(result.reject);
        assert!(result.allow);
    }

    #[tokio::test]
    async fn test_blocked_result_rejects_and_disallows() {
        let filters = vec![
            delayed(FilterResult::default(), 3),
            delayed(FilterResult::blocked(), 6),
            delayed(FilterResult::default(), 1),
        ];
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(5000));
        coordinator.perform_filtering().unwrap();

        let result = expect_delivery(&mut rx).await;
        assert!(result.reject);
        assert!(!result.allow);
    }

    #[tokio::test]
    async fn test_timeout_delivers_partial_result() {
        let silent = Arc::new(SilentFilter::default());
        let filters: Vec<Arc<dyn CallFilter>> = vec![
            delayed(FilterResult::send_to_voicemail(), 10),
            silent.clone(),
        ];
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(200));
        let started = Instant::now();
        coordinator.perform_filtering().unwrap();

        let result = expect_delivery(&mut rx).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(result, FilterResult::send_to_voicemail());
        assert!(coordinator.call().events().contains(EventKind::FilteringTimedOut));
        assert_eq!(silent.cancelled.load(Ordering::SeqCst), 1);
        expect_no_second_delivery(&mut rx).await;
    }

    #[tokio::test]
    async fn test_late_result_after_timeout_is_ignored() {
        let filters = vec![delayed(FilterResult::blocked(), 150)];
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(30));
        coordinator.perform_filtering().unwrap();

        assert_eq!(expect_delivery(&mut rx).await, FilterResult::default());
        expect_no_second_delivery(&mut rx).await;
    }

    #[tokio::test]
    async fn test_no_filters_delivers_default() {
        let (coordinator, mut rx) = new_coordinator(Vec::new(), Duration::from_millis(5000));
        coordinator.perform_filtering().unwrap();

        assert_eq!(expect_delivery(&mut rx).await, FilterResult::default());
        expect_no_second_delivery(&mut rx).await;
    }

    #[tokio::test]
    async fn test_synchronous_and_foreign_thread_callbacks() {
        let mut filters: Vec<Arc<dyn CallFilter>> =
            vec![Arc::new(ImmediateFilter(FilterResult::new(true, false, false, true)))];
        for _ in 0..8 {
            filters.push(Arc::new(ThreadFilter(FilterResult::default())));
        }
        filters.push(Arc::new(ThreadFilter(FilterResult::new(true, false, true, false))));
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(5000));
        coordinator.perform_filtering().unwrap();

        let result = expect_delivery(&mut rx).await;
        assert_eq!(result, FilterResult::new(true, false, false, false));
        expect_no_second_delivery(&mut rx).await;
    }

    #[tokio::test]
    async fn test_second_perform_filtering_is_ignored() {
        let filters = vec![delayed(FilterResult::default(), 1)];
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(5000));
        coordinator.perform_filtering().unwrap();
        coordinator.perform_filtering().unwrap();

        expect_delivery(&mut rx).await;
        expect_no_second_delivery(&mut rx).await;
        assert_eq!(
            coordinator
                .call()
                .events()
                .count(EventKind::FilteringInitiated),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_racing_timeout_delivers_once() {
        for _ in 0..40 {
            let filters = vec![
                delayed(FilterResult::default(), 5),
                delayed(FilterResult::default(), 5),
            ];
            let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(5));
            coordinator.perform_filtering().unwrap();
            expect_delivery(&mut rx).await;
            match tokio::time::timeout(Duration::from_millis(30), rx.recv()).await {
                Err(_) | Ok(None) => {}
                Ok(Some(second)) => panic!("second delivery: {second:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_timer_after_last_report_counts_as_completion() {
        let eager = Arc::new(CancellableImmediateFilter {
            result: FilterResult::blocked(),
            cancelled: AtomicUsize::new(0),
        });
        let filters: Vec<Arc<dyn CallFilter>> = vec![eager.clone()];
        let (coordinator, mut rx) = new_coordinator(filters, Duration::from_millis(5000));
        coordinator.perform_filtering().unwrap();

        // The report is merged but the delivery task has not run yet
        assert_eq!(coordinator.phase(), FilteringPhase::Filtering);
        coordinator.shared.deliver(DeliveryTrigger::Timeout);

        assert_eq!(expect_delivery(&mut rx).await, FilterResult::blocked());
        let events = coordinator.call().events();
        assert!(events.contains(EventKind::FilteringCompleted));
        assert!(!events.contains(EventKind::FilteringTimedOut));
        assert_eq!(eager.cancelled.load(Ordering::SeqCst), 0);
        expect_no_second_delivery(&mut rx).await;
    }

    #[test]
    fn test_requires_runtime() {
        let (coordinator, _rx) = new_coordinator(Vec::new(), Duration::from_millis(10));
        assert!(coordinator.perform_filtering().is_err());
        assert_eq!(coordinator.phase(), FilteringPhase::Created);
    }
}
