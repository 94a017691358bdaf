use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::types::{AsyncSource, FetchResult, Options, SimulatedSource};
use crate::utils::now;
use singleflight::Group;

/// AsyncFetcher is the async counterpart of [`Fetcher`](crate::Fetcher).
///
/// Dropping a `fetch` future abandons only that caller's wait, unless it is
/// the one performing the fetch: then every caller that joined it fails with
/// [`singleflight::Error::LeaderDropped`].
pub struct AsyncFetcher<S> {
    source: Arc<S>,
    group: Group<FetchResult>,
    fetch_count: Arc<AtomicU64>,
}

impl<S> Clone for AsyncFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            group: self.group.clone(),
            fetch_count: self.fetch_count.clone(),
        }
    }
}

impl AsyncFetcher<SimulatedSource> {
    /// `options.wait_timeout` does not apply here, bound the `fetch` future
    /// instead.
    pub fn simulated(options: Options) -> Result<Self> {
        options.validate()?;
        Ok(Self::new(SimulatedSource::new(options)))
    }
}

impl<S: AsyncSource> AsyncFetcher<S> {
    pub fn new(source: S) -> Self {
        AsyncFetcher {
            source: Arc::new(source),
            group: Group::new(),
            fetch_count: Arc::new(AtomicU64::new(0)),
        }
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, key: &str) -> Result<FetchResult> {
        let outcome = self.group.async_work(key, || self.do_fetch(key)).await;

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

    pub fn forget(&self, key: &str) {
        self.group.forget(key);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    async fn do_fetch(&self, key: &str) -> Result<FetchResult> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        info!(key, "performing actual fetch");

        let value = self.source.load(key).await?;
        Ok(FetchResult {
            value,
            fetched_at: now(),
        })
    }
}
