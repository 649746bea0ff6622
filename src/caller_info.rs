use crate::blocklist::normalize_number;
use crate::config::VoicemailConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub name: Option<String>,
    pub send_to_voicemail: bool,
}

/// Invoked with the handle the lookup was made for and what was found.
pub type CallerInfoListener = Box<dyn FnOnce(String, CallerInfo) + Send + 'static>;

/// Asynchronous caller-info lookup keyed by call handle.
pub trait CallerInfoLookup: Send + Sync {
    fn start_lookup(&self, handle: &str, listener: CallerInfoListener);
}

/// Contact entries known to the device, keyed by normalized number.
pub struct ContactDirectory {
    contacts: HashMap<String, CallerInfo>,
    lookup_delay: Duration,
}

impl ContactDirectory {
    pub fn new(lookup_delay: Duration) -> Self {
        Self {
            contacts: HashMap::new(),
            lookup_delay,
        }
    }

    pub fn from_config(config: &VoicemailConfig) -> Self {
        let mut directory = Self::new(Duration::from_millis(config.lookup_delay_ms));
        for number in &config.numbers {
            directory.insert(
                number,
                CallerInfo {
                    name: None,
                    send_to_voicemail: true,
                },
            );
        }
        directory
    }

    pub fn insert(&mut self, number: &str, info: CallerInfo) {
        self.contacts.insert(normalize_number(number), info);
    }

    fn lookup(&self, handle: &str) -> CallerInfo {
        let number = handle.split_once(':').map_or(handle, |(_, rest)| rest);
        self.contacts
            .get(&normalize_number(number))
            .cloned()
            .unwrap_or_default()
    }
}

impl CallerInfoLookup for ContactDirectory {
    fn start_lookup(&self, handle: &str, listener: CallerInfoListener) {
        let info = self.lookup(handle);
        let handle = handle.to_string();
        let delay = self.lookup_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            log::debug!("Caller info for {handle}: {info:?}");
            listener(handle, info);
        });
    }
}
