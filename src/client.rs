use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::types::{FetchResult, Options, SimulatedSource, Source};
use crate::utils::now;
use singleflight::Group;

/// Fetcher fetches data from a [`Source`], suppressing duplicate concurrent
/// fetches of the same key.
pub struct Fetcher<S> {
    source: Arc<S>,
    options: Options,
    group: Group<FetchResult>,
    fetch_count: Arc<AtomicU64>,
}

impl<S> Clone for Fetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            options: self.options.clone(),
            group: self.group.clone(),
            fetch_count: self.fetch_count.clone(),
        }
    }
}

impl Fetcher<SimulatedSource> {
    /// A fetcher backed by a [`SimulatedSource`] configured from `options`.
    pub fn simulated(options: Options) -> Result<Self> {
        Self::new(SimulatedSource::new(options.clone()), options)
    }
}

impl<S: Source> Fetcher<S> {
    pub fn new(source: S, options: Options) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            source: Arc::new(source),
            options,
            group: Group::new(),
            fetch_count: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Fetch retrieves data for the given key. Concurrent calls with the same key
    /// are deduplicated so that only one actual fetch executes.
    ///
    /// When `wait_timeout` is set, a caller that finds a fetch already running
    /// gives up after that long. The fetch itself carries on for everyone else.
    #[instrument(skip(self))]
    pub fn fetch(&self, key: &str) -> Result<FetchResult> {
        let load = || self.do_fetch(key);
        let outcome = match self.options.wait_timeout {
            Some(timeout) => self.group.work_timeout(key, timeout, load),
            None => self.group.work(key, load),
        };

        let shared = outcome.shared;
        let result = outcome
            .into_result()
            .with_context(|| format!("fetch {key}"))
            .inspect_err(|e| {
                error!(key, shared, error = %format!("{e:#}"), "fetch failed");
            })?;

        info!(key, shared, "fetch completed");
        Ok(result)
    }

    /// Drop the in-flight fetch for `key` so the next call fetches again.
    pub fn forget(&self, key: &str) {
        self.group.forget(key);
    }

    /// The number of actual fetch operations performed.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    fn do_fetch(&self, key: &str) -> Result<FetchResult> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        info!(key, "performing actual fetch");

        let value = self.source.load(key)?;
        Ok(FetchResult {
            value,
            fetched_at: now(),
        })
    }
}
