use crate::config::BlockListConfig;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Blocking lookup answering "is this number on the block list?".
pub trait BlockChecker: Send + Sync {
    fn is_blocked(&self, number: Option<&str>) -> Result<bool>;

    /// The device just contacted emergency services.
    fn note_emergency_contact(&self) {}
}

/// Reduce a dialable number to `+` and digits so that formatting
/// differences do not defeat an exact match.
pub fn normalize_number(number: &str) -> String {
    let trimmed = number.trim();
    let mut normalized = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        normalized.push('+');
    }
    normalized.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
    normalized
}

/// In-memory block list: exact numbers plus regex patterns.
///
/// Right after the user contacts emergency services nothing is blocked,
/// so a callback from the emergency operator always gets through.
pub struct BlockedNumberStore {
    numbers: RwLock<HashSet<String>>,
    patterns: Vec<Regex>,
    suppression: Duration,
    last_emergency_contact: RwLock<Option<Instant>>,
}

impl BlockedNumberStore {
    pub fn new(suppression: Duration) -> Self {
        Self {
            numbers: RwLock::new(HashSet::new()),
            patterns: Vec::new(),
            suppression,
            last_emergency_contact: RwLock::new(None),
        }
    }

    pub fn from_config(config: &BlockListConfig) -> Result<Self> {
        let mut store = Self::new(Duration::from_secs(config.emergency_suppression_seconds));
        for number in &config.numbers {
            store.add_number(number);
        }
        for pattern in &config.patterns {
            store.add_pattern(pattern)?;
        }
        Ok(store)
    }

    pub fn add_number(&self, number: &str) {
        let normalized = normalize_number(number);
        if normalized.is_empty() {
            log::warn!("Ignoring block list entry without digits: {number}");
            return;
        }
        self.numbers_mut().insert(normalized);
    }

    pub fn remove_number(&self, number: &str) -> bool {
        self.numbers_mut().remove(&normalize_number(number))
    }

    fn numbers(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.numbers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn numbers_mut(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.numbers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern)
            .with_context(|| format!("Invalid block list pattern: {pattern}"))?;
        self.patterns.push(regex);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.numbers().len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_suppressed(&self) -> bool {
        self.last_emergency_contact
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < self.suppression)
    }
}

impl BlockChecker for BlockedNumberStore {
    fn is_blocked(&self, number: Option<&str>) -> Result<bool> {
        let Some(number) = number else {
            return Ok(false);
        };
        if self.is_suppressed() {
            log::info!("Blocking suppressed after emergency contact");
            return Ok(false);
        }

        let normalized = normalize_number(number);
        if self.numbers().contains(&normalized) {
            log::debug!("{normalized} is on the block list");
            return Ok(true);
        }

        if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(&normalized)) {
            log::debug!("{normalized} matches block pattern '{}'", pattern.as_str());
            return Ok(true);
        }

        Ok(false)
    }

    fn note_emergency_contact(&self) {
        log::info!(
            "Emergency contact noted, blocking suspended for {}s",
            self.suppression.as_secs()
        );
        *self
            .last_emergency_contact
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}
