//! Bounded, FIFO dispatch of provider calls.
//!
//! Provider APIs enforce concurrency and rate limits that are easy to trip
//! when many prompts miss the cache at once. Every outbound call is submitted
//! here; at most `max_concurrency` run at a time and the rest wait in arrival
//! order. An optional post-call delay keeps a slot occupied after the call
//! returns, which spaces out requests regardless of how fast the provider
//! answers.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of calls in flight.
    pub max_concurrency: usize,
    /// Hold each slot this long after the call returns.
    pub post_call_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            post_call_delay_ms: 0,
        }
    }
}

impl DispatchConfig {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Self::default()
        }
    }

    pub fn with_post_call_delay(mut self, delay: Duration) -> Self {
        self.post_call_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::configuration(
                "max_concurrency must be at least 1",
                "dispatch.max_concurrency",
            ));
        }
        Ok(())
    }
}

/// Decrements a gauge when dropped, so counts stay right if a waiting
/// submission is dropped.
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DispatchQueue {
    // tokio's semaphore hands out permits in request order.
    permits: Semaphore,
    max_concurrency: usize,
    post_call_delay: Duration,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl DispatchQueue {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            permits: Semaphore::new(config.max_concurrency),
            max_concurrency: config.max_concurrency,
            post_call_delay: Duration::from_millis(config.post_call_delay_ms),
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        })
    }

    /// Run `task` once a slot is free and return its output.
    ///
    /// Tasks start in submission order. A started task always runs to
    /// completion; there is no priority and no queue limit.
    pub async fn submit<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let permit = {
            let _waiting = GaugeGuard::enter(&self.queued);
            self.permits
                .acquire()
                .await
                .map_err(|_| Error::runtime("dispatch queue closed"))?
        };

        let output = {
            let _running = GaugeGuard::enter(&self.in_flight);
            trace!(in_flight = self.in_flight(), queued = self.queued(), "dispatching task");
            let output = task.await;
            if !self.post_call_delay.is_zero() {
                tokio::time::sleep(self.post_call_delay).await;
            }
            output
        };

        drop(permit);
        Ok(output)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn post_call_delay(&self) -> Duration {
        self.post_call_delay
    }
}
