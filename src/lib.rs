//! Deduplicated data fetching.
//!
//! A [`Fetcher`] (or [`AsyncFetcher`]) sits in front of a slow [`Source`] and
//! makes sure concurrent requests for the same key share one fetch. Completed
//! results are not kept: once a fetch finishes, the next request for its key
//! fetches again.

mod async_client;
mod client;
mod types;
mod utils;

pub use async_client::AsyncFetcher;
pub use client::Fetcher;
pub use types::{AsyncSource, FetchResult, Options, SimulatedSource, Source};
pub use utils::now;

pub use singleflight::{Error, Group, Outcome};
