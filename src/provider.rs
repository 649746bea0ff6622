//! In-process screening provider driven by configuration.
//!
//! Stands in for the dialer's screening service: it is discovered through
//! [`StaticScreeningDirectory`], bound through [`LocalScreeningProvider`],
//! and answers asynchronously like a remote process would.

use crate::call::ScreenableCall;
use crate::callfiltering::screening::{
    ConnectionEvents, DefaultDialerResolver, ScreeningAdapter, ScreeningBinding,
    ScreeningService, ScreeningServiceDiscovery, ScreeningServiceInfo, ScreeningTransport,
};
use crate::config::ScreeningConfig;
use anyhow::{Context, Result};
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

pub struct StaticScreeningDirectory {
    default_dialer: Option<String>,
    services: Vec<ScreeningServiceInfo>,
}

impl StaticScreeningDirectory {
    pub fn new(default_dialer: Option<String>, services: Vec<ScreeningServiceInfo>) -> Self {
        Self {
            default_dialer,
            services,
        }
    }

    pub fn from_config(config: &ScreeningConfig) -> Self {
        Self::new(config.default_dialer.clone(), config.services.clone())
    }
}

impl DefaultDialerResolver for StaticScreeningDirectory {
    fn default_dialer_package(&self) -> Option<String> {
        self.default_dialer.clone()
    }
}

impl ScreeningServiceDiscovery for StaticScreeningDirectory {
    fn query_screening_services(&self, package: &str) -> Vec<ScreeningServiceInfo> {
        self.services
            .iter()
            .filter(|service| service.package == package)
            .cloned()
            .collect()
    }
}

struct ScreeningRules {
    reject_patterns: Vec<Regex>,
    response_delay: Duration,
    drop_connection: bool,
}

impl ScreeningRules {
    fn should_reject(&self, number: &str) -> bool {
        self.reject_patterns.iter().any(|p| p.is_match(number))
    }
}

pub struct LocalScreeningProvider {
    rules: Arc<ScreeningRules>,
    active: Arc<AtomicUsize>,
}

impl LocalScreeningProvider {
    pub fn from_config(config: &ScreeningConfig) -> Result<Self> {
        let reject_patterns = config
            .reject_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid screening pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules: Arc::new(ScreeningRules {
                reject_patterns,
                response_delay: Duration::from_millis(config.response_delay_ms),
                drop_connection: config.drop_connection,
            }),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Connections bound and not yet released.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl ScreeningTransport for LocalScreeningProvider {
    fn bind(
        &self,
        service: &ScreeningServiceInfo,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Box<dyn ScreeningBinding>> {
        let handle = Handle::try_current().context("screening provider needs a tokio runtime")?;
        log::debug!("Binding to {}", service.component);

        let bound = Arc::new(AtomicBool::new(true));
        self.active.fetch_add(1, Ordering::SeqCst);

        let remote = Arc::new(LocalScreeningService {
            rules: Arc::clone(&self.rules),
            events: Arc::clone(&events),
            bound: Arc::clone(&bound),
            handle: handle.clone(),
        });
        handle.spawn({
            let bound = Arc::clone(&bound);
            async move {
                tokio::task::yield_now().await;
                if bound.load(Ordering::SeqCst) {
                    events.on_connected(remote);
                }
            }
        });

        Ok(Box::new(LocalBinding {
            bound,
            active: Arc::clone(&self.active),
        }))
    }
}

struct LocalBinding {
    bound: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl ScreeningBinding for LocalBinding {
    fn unbind(self: Box<Self>) {
        if self.bound.swap(false, Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct LocalScreeningService {
    rules: Arc<ScreeningRules>,
    events: Arc<dyn ConnectionEvents>,
    bound: Arc<AtomicBool>,
    handle: Handle,
}

impl ScreeningService for LocalScreeningService {
    fn screen_call(&self, adapter: Arc<dyn ScreeningAdapter>, call: ScreenableCall) -> Result<()> {
        let request = serde_json::to_string(&call)?;
        log::debug!("Screening request: {request}");

        let rules = Arc::clone(&self.rules);
        let events = Arc::clone(&self.events);
        let bound = Arc::clone(&self.bound);
        self.handle.spawn(async move {
            tokio::time::sleep(rules.response_delay).await;
            if !bound.load(Ordering::SeqCst) {
                return;
            }
            if rules.drop_connection {
                events.on_disconnected();
                return;
            }

            let number = call.number.as_deref().unwrap_or_default();
            if rules.should_reject(number) {
                adapter.disallow_call(&call.call_id, true, true, false);
            } else {
                adapter.allow_call(&call.call_id);
            }
        });
        Ok(())
    }
}
