//! Call screening through an external provider.
//!
//! The provider belongs to the default dialer. It is located, bound, handed
//! the call, and then either answers with a verdict or goes away. Whatever
//! happens first finishes the session; a session finishes exactly once and
//! releases its connection when it does.

use super::{CallFilter, FilterResult, FilterResultCallback};
use crate::call::{Call, ScreenableCall};
use crate::events::EventKind;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Permission a screening service must require of whoever binds to it.
pub const BIND_SCREENING_SERVICE_PERMISSION: &str = "permission.BIND_SCREENING_SERVICE";

pub trait DefaultDialerResolver: Send + Sync {
    fn default_dialer_package(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningServiceInfo {
    pub package: String,
    pub component: String,
    pub permission: Option<String>,
}

pub trait ScreeningServiceDiscovery: Send + Sync {
    /// Screening services installed by `package`.
    fn query_screening_services(&self, package: &str) -> Vec<ScreeningServiceInfo>;
}

/// Verdict channel handed to the provider along with the call.
pub trait ScreeningAdapter: Send + Sync {
    fn allow_call(&self, call_id: &str);
    fn disallow_call(&self, call_id: &str, reject: bool, log_call: bool, notify: bool);
}

/// The remote end of a bound connection.
pub trait ScreeningService: Send + Sync {
    fn screen_call(&self, adapter: Arc<dyn ScreeningAdapter>, call: ScreenableCall) -> Result<()>;
}

/// Connection lifecycle notifications from the transport.
pub trait ConnectionEvents: Send + Sync {
    fn on_connected(&self, service: Arc<dyn ScreeningService>);
    fn on_disconnected(&self);
}

/// An accepted bind request. Dropping the connection is explicit.
pub trait ScreeningBinding: Send {
    fn unbind(self: Box<Self>);
}

pub trait ScreeningTransport: Send + Sync {
    /// Request a connection. `Ok` means the request was accepted and
    /// `events` will hear about the outcome later.
    fn bind(
        &self,
        service: &ScreeningServiceInfo,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Box<dyn ScreeningBinding>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Connecting,
    Bound,
    AwaitingResponse,
    Finished,
}

pub struct ScreeningServiceFilter {
    dialer: Arc<dyn DefaultDialerResolver>,
    discovery: Arc<dyn ScreeningServiceDiscovery>,
    transport: Arc<dyn ScreeningTransport>,
    session: Mutex<Option<Arc<ScreeningSession>>>,
}

impl ScreeningServiceFilter {
    pub fn new(
        dialer: Arc<dyn DefaultDialerResolver>,
        discovery: Arc<dyn ScreeningServiceDiscovery>,
        transport: Arc<dyn ScreeningTransport>,
    ) -> Self {
        Self {
            dialer,
            discovery,
            transport,
            session: Mutex::new(None),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        let Some(session) = self.current_session() else {
            return ConnectionState::Unbound;
        };
        let state = session.inner().state;
        state
    }

    fn current_session(&self) -> Option<Arc<ScreeningSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Find the one screening service we are allowed to use, if any.
    fn resolve_service(&self, call: &Call) -> Option<ScreeningServiceInfo> {
        let package = match self.dialer.default_dialer_package() {
            Some(package) if !package.is_empty() => package,
            _ => {
                log::info!(
                    "[{}] default dialer is empty, not performing call screening",
                    call.id()
                );
                return None;
            }
        };

        let Some(service) = self
            .discovery
            .query_screening_services(&package)
            .into_iter()
            .next()
        else {
            log::info!(
                "[{}] no call screening services installed for {package}",
                call.id()
            );
            return None;
        };

        if service.package != package {
            log::warn!(
                "[{}] screening service {} is not part of {package}",
                call.id(),
                service.component
            );
            return None;
        }
        if service.permission.as_deref() != Some(BIND_SCREENING_SERVICE_PERMISSION) {
            log::warn!(
                "[{}] screening service {} must require {}",
                call.id(),
                service.component,
                BIND_SCREENING_SERVICE_PERMISSION
            );
            return None;
        }

        Some(service)
    }
}

impl CallFilter for ScreeningServiceFilter {
    fn name(&self) -> &str {
        "call_screening"
    }

    fn start_filter_lookup(&self, call: Arc<Call>, callback: FilterResultCallback) {
        let session = {
            let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                log::warn!(
                    "[{}] attempted to reuse a call screening filter, ignoring",
                    call.id()
                );
                return;
            }
            let session = ScreeningSession::new(Arc::clone(&call), callback);
            *slot = Some(Arc::clone(&session));
            session
        };

        call.add_event(EventKind::ScreeningSent, None);
        match self.resolve_service(&call) {
            Some(service) => session.connect(self.transport.as_ref(), &service),
            None => session.finish(),
        }
    }

    fn cancel(&self) {
        if let Some(session) = self.current_session() {
            session.finish();
        }
    }
}

struct SessionInner {
    state: ConnectionState,
    result: FilterResult,
    callback: Option<FilterResultCallback>,
    binding: Option<Box<dyn ScreeningBinding>>,
    service: Option<Arc<dyn ScreeningService>>,
}

/// One screening attempt for one call.
struct ScreeningSession {
    me: Weak<ScreeningSession>,
    call: Arc<Call>,
    inner: Mutex<SessionInner>,
}

impl ScreeningSession {
    fn new(call: Arc<Call>, callback: FilterResultCallback) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            call,
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Unbound,
                result: FilterResult::default(),
                callback: Some(callback),
                binding: None,
                service: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self, transport: &dyn ScreeningTransport, service: &ScreeningServiceInfo) {
        {
            let mut inner = self.inner();
            if inner.state != ConnectionState::Unbound {
                return;
            }
            inner.state = ConnectionState::Connecting;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        self.call
            .add_event(EventKind::BindScreening, Some(service.component.clone()));
        match transport.bind(service, me) {
            Ok(binding) => {
                // The session may have finished while the bind was in flight
                let orphan = {
                    let mut inner = self.inner();
                    if inner.state == ConnectionState::Finished {
                        Some(binding)
                    } else {
                        inner.binding = Some(binding);
                        None
                    }
                };
                match orphan {
                    Some(binding) => binding.unbind(),
                    None => log::debug!(
                        "[{}] bound {}, waiting for it to connect",
                        self.call.id(),
                        service.component
                    ),
                }
            }
            Err(e) => {
                log::info!(
                    "[{}] could not bind to call screening service {}: {e:#}",
                    self.call.id(),
                    service.component
                );
                self.finish();
            }
        }
    }

    fn record_verdict(&self, call_id: &str, result: FilterResult) {
        {
            let mut inner = self.inner();
            if call_id != self.call.id() {
                log::warn!(
                    "[{}] screening verdict {} for unknown call id {call_id}, ignoring",
                    self.call.id(),
                    result
                );
                return;
            }
            match inner.state {
                ConnectionState::Bound | ConnectionState::AwaitingResponse => {
                    inner.result = result;
                }
                state => {
                    log::debug!(
                        "[{}] screening verdict {} in state {:?}, ignoring",
                        self.call.id(),
                        result,
                        state
                    );
                    return;
                }
            }
        }
        self.finish();
    }

    fn finish(&self) {
        let (callback, binding, result) = {
            let mut inner = self.inner();
            if inner.state == ConnectionState::Finished {
                return;
            }
            inner.state = ConnectionState::Finished;
            inner.service = None;
            (inner.callback.take(), inner.binding.take(), inner.result)
        };

        self.call
            .add_event(EventKind::ScreeningCompleted, Some(result.to_string()));
        if let Some(callback) = callback {
            callback(Arc::clone(&self.call), result);
        }
        if let Some(binding) = binding {
            binding.unbind();
        }
    }
}

impl ConnectionEvents for ScreeningSession {
    fn on_connected(&self, service: Arc<dyn ScreeningService>) {
        {
            let mut inner = self.inner();
            if inner.state != ConnectionState::Connecting {
                log::debug!(
                    "[{}] screening service connected in state {:?}, ignoring",
                    self.call.id(),
                    inner.state
                );
                return;
            }
            inner.state = ConnectionState::Bound;
            inner.service = Some(Arc::clone(&service));
        }
        self.call.add_event(EventKind::ScreeningBound, None);

        let Some(me) = self.me.upgrade() else {
            return;
        };
        match service.screen_call(me, self.call.to_screenable()) {
            Ok(()) => {
                let mut inner = self.inner();
                if inner.state == ConnectionState::Bound {
                    inner.state = ConnectionState::AwaitingResponse;
                }
            }
            Err(e) => {
                log::error!(
                    "[{}] failed to hand call to screening service: {e:#}",
                    self.call.id()
                );
                self.finish();
            }
        }
    }

    fn on_disconnected(&self) {
        log::debug!("[{}] screening service disconnected", self.call.id());
        self.finish();
    }
}

impl ScreeningAdapter for ScreeningSession {
    fn allow_call(&self, call_id: &str) {
        log::debug!("[{}] allow_call({call_id})", self.call.id());
        self.record_verdict(call_id, FilterResult::new(true, false, true, true));
    }

    fn disallow_call(&self, call_id: &str, reject: bool, log_call: bool, notify: bool) {
        log::debug!(
            "[{}] disallow_call({call_id}, reject={reject}, log={log_call}, notify={notify})",
            self.call.id()
        );
        self.record_verdict(call_id, FilterResult::new(false, reject, log_call, notify));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    const DIALER: &str = "com.example.dialer";

    struct FixedDialer(Option<String>);

    impl DefaultDialerResolver for FixedDialer {
        fn default_dialer_package(&self) -> Option<String> {
            self.0.clone()
        }
    }

    struct FixedDiscovery(Vec<ScreeningServiceInfo>);

    impl ScreeningServiceDiscovery for FixedDiscovery {
        fn query_screening_services(&self, package: &str) -> Vec<ScreeningServiceInfo> {
            self.0
                .iter()
                .filter(|s| s.package == package)
                .cloned()
                .collect()
        }
    }

    struct CountingBinding(Arc<AtomicUsize>);

    impl ScreeningBinding for CountingBinding {
        fn unbind(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        reject_bind: bool,
        binds: AtomicUsize,
        unbinds: Arc<AtomicUsize>,
        events: Mutex<Option<Arc<dyn ConnectionEvents>>>,
    }

    impl FakeTransport {
        fn events(&self) -> Arc<dyn ConnectionEvents> {
            self.events.lock().unwrap().clone().expect("never bound")
        }
    }

    impl ScreeningTransport for FakeTransport {
        fn bind(
            &self,
            _service: &ScreeningServiceInfo,
            events: Arc<dyn ConnectionEvents>,
        ) -> Result<Box<dyn ScreeningBinding>> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            if self.reject_bind {
                anyhow::bail!("bind refused");
            }
            *self.events.lock().unwrap() = Some(events);
            Ok(Box::new(CountingBinding(Arc::clone(&self.unbinds))))
        }
    }

    enum Reply {
        Hold,
        Allow,
        Fail,
    }

    struct FakeService {
        reply: Reply,
        received: Mutex<Vec<ScreenableCall>>,
        adapter: Mutex<Option<Arc<dyn ScreeningAdapter>>>,
    }

    impl FakeService {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                received: Mutex::new(Vec::new()),
                adapter: Mutex::new(None),
            })
        }

        fn adapter(&self) -> Arc<dyn ScreeningAdapter> {
            self.adapter.lock().unwrap().clone().expect("no call received")
        }
    }

    impl ScreeningService for FakeService {
        fn screen_call(
            &self,
            adapter: Arc<dyn ScreeningAdapter>,
            call: ScreenableCall,
        ) -> Result<()> {
            self.received.lock().unwrap().push(call.clone());
            *self.adapter.lock().unwrap() = Some(Arc::clone(&adapter));
            match self.reply {
                Reply::Hold => Ok(()),
                Reply::Allow => {
                    adapter.allow_call(&call.call_id);
                    Ok(())
                }
                Reply::Fail => anyhow::bail!("remote died"),
            }
        }
    }

    fn valid_service() -> ScreeningServiceInfo {
        ScreeningServiceInfo {
            package: DIALER.to_string(),
            component: format!("{DIALER}/.Screener"),
            permission: Some(BIND_SCREENING_SERVICE_PERMISSION.to_string()),
        }
    }

    fn filter_with(
        dialer: Option<&str>,
        services: Vec<ScreeningServiceInfo>,
        transport: Arc<FakeTransport>,
    ) -> ScreeningServiceFilter {
        ScreeningServiceFilter::new(
            Arc::new(FixedDialer(dialer.map(str::to_string))),
            Arc::new(FixedDiscovery(services)),
            transport,
        )
    }

    fn start(
        filter: &ScreeningServiceFilter,
    ) -> (Arc<Call>, oneshot::Receiver<FilterResult>) {
        let call = Arc::new(Call::new("screen-call", Some("tel:+15550001111".to_string())));
        let (tx, rx) = oneshot::channel();
        filter.start_filter_lookup(
            Arc::clone(&call),
            Box::new(move |_call, result| {
                let _ = tx.send(result);
            }),
        );
        (call, rx)
    }

    #[test]
    fn test_no_eligible_provider_allows_without_binding() {
        let wrong_permission = ScreeningServiceInfo {
            permission: Some("permission.SOMETHING_ELSE".to_string()),
            ..valid_service()
        };
        let cases = vec![
            (None, vec![valid_service()]),
            (Some(""), vec![valid_service()]),
            (Some(DIALER), vec![]),
            (Some(DIALER), vec![wrong_permission]),
            (
                Some(DIALER),
                vec![ScreeningServiceInfo {
                    permission: None,
                    ..valid_service()
                }],
            ),
        ];

        for (dialer, services) in cases {
            let transport = Arc::new(FakeTransport::default());
            let filter = filter_with(dialer, services, transport.clone());
            let (call, mut rx) = start(&filter);

            assert_eq!(rx.try_recv().unwrap(), FilterResult::default());
            assert_eq!(transport.binds.load(Ordering::SeqCst), 0);
            assert_eq!(filter.connection_state(), ConnectionState::Finished);
            assert!(!call.events().contains(EventKind::BindScreening));
            assert_eq!(call.events().count(EventKind::ScreeningCompleted), 1);
        }
    }

    #[test]
    fn test_rejected_bind_allows_immediately() {
        let transport = Arc::new(FakeTransport {
            reject_bind: true,
            ..Default::default()
        });
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (_, mut rx) = start(&filter);

        assert_eq!(rx.try_recv().unwrap(), FilterResult::default());
        assert_eq!(transport.binds.load(Ordering::SeqCst), 1);
        assert_eq!(transport.unbinds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disallow_verdict() {
        let transport = Arc::new(FakeTransport::default());
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (call, mut rx) = start(&filter);
        assert_eq!(filter.connection_state(), ConnectionState::Connecting);
        assert!(rx.try_recv().is_err());

        let service = FakeService::new(Reply::Hold);
        transport.events().on_connected(service.clone());
        assert_eq!(filter.connection_state(), ConnectionState::AwaitingResponse);
        let received = service.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].call_id, "screen-call");
        assert_eq!(received[0].number.as_deref(), Some("+15550001111"));

        service
            .adapter()
            .disallow_call("screen-call", true, false, true);
        assert_eq!(
            rx.try_recv().unwrap(),
            FilterResult::new(false, true, false, true)
        );
        assert_eq!(filter.connection_state(), ConnectionState::Finished);
        assert_eq!(transport.unbinds.load(Ordering::SeqCst), 1);
        assert!(call.events().contains(EventKind::ScreeningBound));
    }

    #[test]
    fn test_disconnect_before_verdict_finishes_once() {
        let transport = Arc::new(FakeTransport::default());
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (call, mut rx) = start(&filter);

        let service = FakeService::new(Reply::Hold);
        let events = transport.events();
        events.on_connected(service.clone());
        events.on_disconnected();
        assert_eq!(rx.try_recv().unwrap(), FilterResult::default());

        // Anything after the first finish is a no-op
        events.on_disconnected();
        service.adapter().disallow_call("screen-call", true, false, false);
        filter.cancel();
        assert_eq!(call.events().count(EventKind::ScreeningCompleted), 1);
        assert_eq!(transport.unbinds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_call_id_is_ignored() {
        let transport = Arc::new(FakeTransport::default());
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (_, mut rx) = start(&filter);

        let service = FakeService::new(Reply::Hold);
        transport.events().on_connected(service.clone());
        service.adapter().disallow_call("some-other-call", true, false, false);
        assert!(rx.try_recv().is_err());
        assert_eq!(filter.connection_state(), ConnectionState::AwaitingResponse);

        service.adapter().allow_call("screen-call");
        assert_eq!(rx.try_recv().unwrap(), FilterResult::default());
    }

    #[test]
    fn test_synchronous_answer_during_hand_off() {
        let transport = Arc::new(FakeTransport::default());
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (_, mut rx) = start(&filter);

        transport.events().on_connected(FakeService::new(Reply::Allow));
        assert_eq!(rx.try_recv().unwrap(), FilterResult::default());
        assert_eq!(filter.connection_state(), ConnectionState::Finished);
        assert_eq!(transport.unbinds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hand_off_failure_allows() {
        let transport = Arc::new(FakeTransport::default());
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (_, mut rx) = start(&filter);

        transport.events().on_connected(FakeService::new(Reply::Fail));
        assert_eq!(rx.try_recv().unwrap(), FilterResult::default());
        assert_eq!(transport.unbinds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_releases_connection() {
        let transport = Arc::new(FakeTransport::default());
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (_, mut rx) = start(&filter);

        filter.cancel();
        assert_eq!(rx.try_recv().unwrap(), FilterResult::default());
        assert_eq!(transport.unbinds.load(Ordering::SeqCst), 1);

        // A connection that shows up afterwards is not used
        let service = FakeService::new(Reply::Hold);
        transport.events().on_connected(service.clone());
        assert!(service.received.lock().unwrap().is_empty());
        assert_eq!(filter.connection_state(), ConnectionState::Finished);
    }

    #[test]
    fn test_filter_is_single_use() {
        let transport = Arc::new(FakeTransport::default());
        let filter = filter_with(Some(DIALER), vec![valid_service()], transport.clone());
        let (_, _rx) = start(&filter);
        let (_, rx) = start(&filter);

        assert_eq!(transport.binds.load(Ordering::SeqCst), 1);
        // The second callback is dropped without a verdict
        let mut rx = rx;
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
