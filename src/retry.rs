use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::constants::DEFAULT_MAX_RETRIES;
use crate::types::{ObservedError, Result};

/// Decides whether a failed attempt (0-based index) should be retried.
pub type RetryPredicate = Arc<dyn Fn(&ObservedError, u32) -> bool + Send + Sync>;

/// Observes each scheduled retry: the error, the upcoming 1-based retry number and its delay.
pub type RetryObserver = Arc<dyn Fn(&ObservedError, u32, Duration) + Send + Sync>;

/// Default predicate: retry network failures and 5xx-class responses, never 4xx.
pub fn is_retryable(err: &ObservedError, _attempt_index: u32) -> bool {
    err.is_transient()
}

#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub should_retry: Option<RetryPredicate>,
    pub on_retry: Option<RetryObserver>,
}

impl RetryOptions {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
            should_retry: None,
            on_retry: None,
        }
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ObservedError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ObservedError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, BackoffPolicy::default())
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("custom_predicate", &self.should_retry.is_some())
            .field("observer", &self.on_retry.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    options: RetryOptions,
}

impl RetryExecutor {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Runs `operation` at most `max_retries + 1` times, sleeping the backoff delay between
    /// attempts. The last error is returned once the budget or the predicate says stop.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts: u32 = 0;
        loop {
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) => {
                    let attempt_index = attempts;
                    attempts += 1;

                    if attempts > self.options.max_retries || !self.should_retry(&e, attempt_index)
                    {
                        if attempts > 1 {
                            tracing::warn!(
                                attempts,
                                "Giving up after {} attempt(s): {}",
                                attempts,
                                e.inner
                            );
                        }
                        return Err(e);
                    }

                    let delay = self.options.backoff.compute_delay(attempts);
                    if let Some(observer) = &self.options.on_retry {
                        observer(&e, attempts, delay);
                    }
                    tracing::warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Request failed: {}. Retrying in {:?} (jittered)...",
                        e.inner,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn should_retry(&self, err: &ObservedError, attempt_index: u32) -> bool {
        match &self.options.should_retry {
            Some(predicate) => predicate(err, attempt_index),
            None => is_retryable(err, attempt_index),
        }
    }
}
