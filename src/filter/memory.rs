//! In-memory [`Filter`] used for dry runs and tests.
//!
//! Rules live in an ordered list that mirrors chain order: accept-style rules
//! are inserted at the head, deny rules are appended.  Failures can be
//! injected per primitive and address, and every call is counted so callers
//! can observe how many primitives were in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Filter;
use crate::address::RESERVED_RANGES;
use crate::error::FilterError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Rule {
    Accept(String),
    Masquerade(String),
    ForwardFrom(String),
    ForwardTo(String),
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    InstallAccept,
    RemoveAccept,
    InstallMasquerade,
    RemoveMasquerade,
    InstallForward,
    RemoveForward,
    CatchAllDeny,
    ForwardPolicy,
    ReservedRanges,
}

pub struct MemoryFilter {
    rules: Mutex<Vec<Rule>>,
    forwarding: AtomicBool,
    forward_policy_accept: AtomicBool,
    failures: Mutex<HashMap<(Primitive, String), usize>>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            forwarding: AtomicBool::new(true),
            forward_policy_accept: AtomicBool::new(false),
            failures: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every primitive call sleeps for `latency` before touching state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_forwarding(self, enabled: bool) -> Self {
        self.forwarding.store(enabled, Ordering::SeqCst);
        self
    }

    /// Makes the next `times` calls of `primitive` for `address` fail.  Use
    /// an empty address for the baseline primitives.
    pub fn fail(&self, primitive: Primitive, address: &str, times: usize) {
        self.failures
            .lock()
            .insert((primitive, address.to_string()), times);
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.lock().clone()
    }

    pub fn has_rule(&self, rule: &Rule) -> bool {
        self.rules.lock().contains(rule)
    }

    pub fn forward_policy_accepts(&self) -> bool {
        self.forward_policy_accept.load(Ordering::SeqCst)
    }

    /// Highest number of primitive calls observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, primitive: Primitive, address: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(&(primitive, address.to_string())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn call<F>(
        &self,
        primitive: Primitive,
        address: &str,
        apply: F,
    ) -> Result<(), FilterError>
    where
        F: FnOnce(&mut Vec<Rule>),
    {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = if self.take_failure(primitive, address) {
            Err(FilterError::Injected {
                primitive: format!("{:?}", primitive),
                address: address.to_string(),
            })
        } else {
            let mut rules = self.rules.lock();
            apply(&mut *rules);
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Default for MemoryFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_unique(rules: &mut Vec<Rule>, rule: Rule) {
    if !rules.contains(&rule) {
        rules.insert(0, rule);
    }
}

fn append_unique(rules: &mut Vec<Rule>, rule: Rule) {
    if !rules.contains(&rule) {
        rules.push(rule);
    }
}

fn remove(rules: &mut Vec<Rule>, rule: &Rule) {
    rules.retain(|r| r != rule);
}

#[async_trait]
impl Filter for MemoryFilter {
    async fn forwarding_enabled(&self) -> Result<bool, FilterError> {
        Ok(self.forwarding.load(Ordering::SeqCst))
    }

    async fn install_accept_rule(&self, address: &str) -> Result<(), FilterError> {
        self.call(Primitive::InstallAccept, address, |rules| {
            insert_unique(rules, Rule::Accept(address.to_string()))
        })
        .await
    }

    async fn remove_accept_rule(&self, address: &str) -> Result<(), FilterError> {
        self.call(Primitive::RemoveAccept, address, |rules| {
            remove(rules, &Rule::Accept(address.to_string()))
        })
        .await
    }

    async fn install_masquerade_rule(&self, address: &str) -> Result<(), FilterError> {
        self.call(Primitive::InstallMasquerade, address, |rules| {
            insert_unique(rules, Rule::Masquerade(address.to_string()))
        })
        .await
    }

    async fn remove_masquerade_rule(&self, address: &str) -> Result<(), FilterError> {
        self.call(Primitive::RemoveMasquerade, address, |rules| {
            remove(rules, &Rule::Masquerade(address.to_string()))
        })
        .await
    }

    async fn install_forward_rules(&self, address: &str) -> Result<(), FilterError> {
        self.call(Primitive::InstallForward, address, |rules| {
            insert_unique(rules, Rule::ForwardFrom(address.to_string()));
            insert_unique(rules, Rule::ForwardTo(address.to_string()));
        })
        .await
    }

    async fn remove_forward_rules(&self, address: &str) -> Result<(), FilterError> {
        self.call(Primitive::RemoveForward, address, |rules| {
            remove(rules, &Rule::ForwardFrom(address.to_string()));
            remove(rules, &Rule::ForwardTo(address.to_string()));
        })
        .await
    }

    async fn install_catch_all_deny(&self) -> Result<(), FilterError> {
        self.call(Primitive::CatchAllDeny, "", |rules| {
            append_unique(rules, Rule::Deny)
        })
        .await
    }

    async fn ensure_forward_accept_policy(&self) -> Result<(), FilterError> {
        self.call(Primitive::ForwardPolicy, "", |_| {
            self.forward_policy_accept.store(true, Ordering::SeqCst)
        })
        .await
    }

    async fn install_reserved_range_allowlist(&self) -> Result<(), FilterError> {
        self.call(Primitive::ReservedRanges, "", |rules| {
            for range in RESERVED_RANGES {
                insert_unique(rules, Rule::Accept(range.to_string()));
            }
        })
        .await
    }
}
