//! Fires a burst of concurrent fetches at one key and reports how many actual
//! fetches it took.
//!
//! Log verbosity comes from `FLIGHTCACHE_LOG`, then `RUST_LOG`, default `info`.

use std::time::Duration;

use anyhow::Result;
use flightcache::{Fetcher, Options};
use threadpool::ThreadPool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CALLERS: usize = 10;

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_env("FLIGHTCACHE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    run("user:123")?;
    info!("-----");
    run("error")
}

fn run(key: &str) -> Result<()> {
    let fetcher = Fetcher::simulated(Options {
        latency: Duration::from_secs(2),
        ..Options::default()
    })?;
    let pool = ThreadPool::new(CALLERS);

    for _ in 0..CALLERS {
        let fetcher = fetcher.clone();
        let key = key.to_owned();
        pool.execute(move || match fetcher.fetch(&key) {
            Ok(result) => info!(value = %result.value, "got result"),
            Err(e) => error!(error = %format!("{e:#}"), "fetch failed"),
        });
    }
    pool.join();

    info!(
        callers = CALLERS,
        actual_fetches = fetcher.fetch_count(),
        "done"
    );
    Ok(())
}
