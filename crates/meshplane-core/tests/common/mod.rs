//! Test doubles and common utilities for contract tests
//!
//! Minimal collaborators that record what the control plane asks of them.

#![allow(dead_code)]

use meshplane_core::error::{Error, Result};
use meshplane_core::provider::authority_host;
use meshplane_core::traits::{AuthorityFactory, Job, JobHandler, PreferenceSet, RemoteAuthority};
use meshplane_core::{BrokerConnection, Collaborators, MemoryBroker, ServerConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// An authority serving a fixed, mutable preference set
pub struct MockAuthority {
    prefs: Mutex<PreferenceSet>,
    pulls: AtomicUsize,
    pushes: Mutex<Vec<(String, serde_json::Value)>>,
    failing: AtomicBool,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self {
            prefs: Mutex::new(BTreeMap::new()),
            pulls: AtomicUsize::new(0),
            pushes: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Replace one user's preferences on the authority side
    pub fn set_preferences(&self, user: &str, value: serde_json::Value) {
        self.prefs.lock().unwrap().insert(user.to_string(), value);
    }

    /// Make every call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of fetch_preferences() calls
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Pushed (user, preferences) pairs
    pub fn pushes(&self) -> Vec<(String, serde_json::Value)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RemoteAuthority for MockAuthority {
    async fn fetch_preferences(&self, _token: &str) -> Result<PreferenceSet> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::http("authority unavailable"));
        }
        Ok(self.prefs.lock().unwrap().clone())
    }

    async fn push_preferences(
        &self,
        _token: &str,
        user: &str,
        preferences: &serde_json::Value,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::http("authority unavailable"));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((user.to_string(), preferences.clone()));
        Ok(())
    }

    async fn exchange_token(&self, code: &str) -> Result<String> {
        if code.is_empty() {
            return Err(Error::auth("empty login code"));
        }
        Ok(format!("token-{}", code))
    }

    fn authority_name(&self) -> &str {
        "mock"
    }
}

/// Hands out one shared [`MockAuthority`] and records the hosts it was asked for
pub struct MockAuthorityFactory {
    pub authority: Arc<MockAuthority>,
    created: Mutex<Vec<String>>,
}

impl MockAuthorityFactory {
    pub fn new() -> Self {
        Self {
            authority: Arc::new(MockAuthority::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Hosts of every authority created so far
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl AuthorityFactory for MockAuthorityFactory {
    fn create(&self, base_url: &Url, _timeout: Duration) -> Result<Arc<dyn RemoteAuthority>> {
        self.created
            .lock()
            .unwrap()
            .push(authority_host(base_url).unwrap_or_default());
        Ok(Arc::clone(&self.authority) as Arc<dyn RemoteAuthority>)
    }
}

/// How [`CountingJobHandler`] treats each job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Succeed,
    Fail,
    Panic,
}

/// A job handler that counts and optionally fails or panics
pub struct CountingJobHandler {
    mode: Mutex<HandlerMode>,
    handled: AtomicUsize,
    payloads: Mutex<Vec<serde_json::Value>>,
    delay: Duration,
}

impl CountingJobHandler {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Sleep `delay` inside every job before recording it
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            mode: Mutex::new(HandlerMode::Succeed),
            handled: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn set_mode(&self, mode: HandlerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of jobs that reached the handler
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    /// Payloads of successfully handled jobs, in order
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl JobHandler for CountingJobHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mode = *self.mode.lock().unwrap();
        match mode {
            HandlerMode::Succeed => {
                self.payloads.lock().unwrap().push(job.payload);
                Ok(())
            }
            HandlerMode::Fail => Err(Error::job_failure(job.name, "handler failed")),
            HandlerMode::Panic => panic!("handler panicked"),
        }
    }
}

/// Everything a control plane test needs to observe its collaborators
pub struct Harness {
    pub broker: Arc<MockBroker>,
    pub factory: Arc<MockAuthorityFactory>,
    pub handler: Arc<CountingJobHandler>,
}

/// The in-memory broker used by every contract test
pub type MockBroker = MemoryBroker;

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new()),
            factory: Arc::new(MockAuthorityFactory::new()),
            handler: Arc::new(CountingJobHandler::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            broker: Arc::clone(&self.broker) as Arc<dyn BrokerConnection>,
            authority_factory: Arc::clone(&self.factory) as Arc<dyn AuthorityFactory>,
            metrics_handler: Arc::clone(&self.handler) as Arc<dyn JobHandler>,
        }
    }
}

/// Configuration rooted at `dir` with short timers
pub fn test_config(dir: &Path, urls: &[&str]) -> ServerConfig {
    let mut config = ServerConfig::new(dir).with_provider_urls(urls.iter().copied());
    config.sync.interval_ms = 50;
    config.sync.authority_timeout_ms = 500;
    config.broker.receive_timeout_ms = 100;
    config.broker.channel_capacity = 16;
    config.queue.capacity = 8;
    config
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
