//! Mock destination for testing
//!
//! A scriptable adapter that records every call it receives. It can succeed,
//! fail, fail only on selected calls, or take a while to answer, which is
//! enough to exercise every path through the driver without a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::destinations::Destination;
use crate::error::DestinationError;
use crate::ledger::now_millis;
use crate::types::Submission;

/// One call the mock received
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub submission_id: String,
    pub content: String,
    /// Wall-clock milliseconds when the call started
    pub at: i64,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub name: String,
    /// Outcome when no scripted outcome is left: `None` succeeds
    pub default_error: Option<String>,
    /// Outcomes consumed one per call before falling back to the default
    pub script: Arc<Mutex<VecDeque<Option<String>>>>,
    /// Simulated latency of each call
    pub delay: Duration,
    /// Mark produced errors as not worth logging
    pub quiet: bool,
    pub calls: Arc<Mutex<Vec<MockCall>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            default_error: None,
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            quiet: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock destination adapter
#[derive(Debug, Clone)]
pub struct MockDestination {
    config: MockConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockDestination {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Always succeeds
    pub fn success(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Always fails with `error`
    pub fn failure(name: &str, error: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            default_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    /// Succeeds after `delay`
    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            delay,
            ..Default::default()
        })
    }

    /// Follow `script` call by call (`Some(error)` fails), then succeed
    pub fn scripted(name: &str, script: Vec<Option<&str>>) -> Self {
        let script = script
            .into_iter()
            .map(|outcome| outcome.map(str::to_string))
            .collect();
        Self::new(MockConfig {
            name: name.to_string(),
            script: Arc::new(Mutex::new(script)),
            ..Default::default()
        })
    }

    pub fn quiet(mut self) -> Self {
        self.config.quiet = true;
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.config.calls).len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.config.calls).clone()
    }
}

#[async_trait]
impl Destination for MockDestination {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn post(&self, submission: &Submission) -> Result<String, DestinationError> {
        let call_number = {
            let mut calls = lock(&self.config.calls);
            calls.push(MockCall {
                submission_id: submission.id.clone(),
                content: submission.content.clone(),
                at: now_millis(),
            });
            calls.len()
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let outcome = lock(&self.config.script)
            .pop_front()
            .unwrap_or_else(|| self.config.default_error.clone());

        match outcome {
            None => Ok(format!("{}-{}", self.config.name, call_number)),
            Some(cause) => {
                let error = DestinationError::new(&self.config.name, cause);
                Err(if self.config.quiet { error.quiet() } else { error })
            }
        }
    }
}
