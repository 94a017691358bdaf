use anyhow::{bail, ensure, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::utils::jittered;

/// Options represents the options for a fetcher and its simulated source
#[derive(Clone, Debug)]
pub struct Options {
    /// Latency is how long one simulated fetch takes. default is 100ms
    pub latency: Duration,
    /// LatencyJitter is the random adjustment for the latency. default is 0
    /// if the latency is set to 100ms, and this value is set to 0.1, then the actual latency will be 90ms - 100ms
    pub latency_jitter: f64,
    /// FailingKey is the key the simulated source fails for. default is "error"
    pub failing_key: Option<String>,
    /// WaitTimeout bounds how long a caller waits on somebody else's fetch. default is no bound
    /// the caller that actually performs the fetch is never bounded by it.
    pub wait_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(100),
            latency_jitter: 0.0,
            failing_key: Some("error".to_owned()),
            wait_timeout: None,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.latency_jitter),
            "options error: latency_jitter should be within [0, 1], got {}",
            self.latency_jitter
        );
        if self.wait_timeout == Some(Duration::ZERO) {
            bail!("options error: wait_timeout should not be 0, leave it unset to wait forever");
        }
        Ok(())
    }
}

/// Data fetched from an external source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchResult {
    pub value: String,
    /// Milliseconds since the Unix epoch.
    pub fetched_at: u64,
}

/// Source performs the expensive call a fetcher deduplicates.
pub trait Source: Send + Sync {
    fn load(&self, key: &str) -> Result<String>;
}

/// Async flavour of [`Source`].
#[async_trait]
pub trait AsyncSource: Send + Sync {
    async fn load(&self, key: &str) -> Result<String>;
}

/// Stands in for a slow remote: sleeps for the configured latency, then
/// answers `data-for-<key>`, or fails for the configured failing key.
#[derive(Clone, Debug)]
pub struct SimulatedSource {
    options: Options,
}

impl SimulatedSource {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    fn latency(&self) -> Duration {
        jittered(self.options.latency, self.options.latency_jitter)
    }

    fn answer(&self, key: &str) -> Result<String> {
        if self.options.failing_key.as_deref() == Some(key) {
            bail!("simulated fetch error for key {key}");
        }
        Ok(format!("data-for-{key}"))
    }
}

impl Source for SimulatedSource {
    fn load(&self, key: &str) -> Result<String> {
        std::thread::sleep(self.latency());
        self.answer(key)
    }
}

#[async_trait]
impl AsyncSource for SimulatedSource {
    async fn load(&self, key: &str) -> Result<String> {
        tokio::time::sleep(self.latency()).await;
        self.answer(key)
    }
}
