//! Duplicate call suppression.
//!
//! A [`Group`] represents a class of work and creates a space in which units of
//! work can be executed with duplicate suppression: for any key at most one
//! call is in flight at a time, and every caller that arrives while it runs
//! receives the same result once it completes.
//!
//! Nothing is cached. As soon as a call finishes its key is idle again and the
//! next caller starts a fresh call.

use core::any::Any;
use std::sync::Arc;

mod group;

pub use group::Group;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Why a call did not produce a value.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The work function returned an error. Every caller of the same call
    /// receives the same allocation.
    #[error("{0:#}")]
    Work(Arc<anyhow::Error>),
    /// The work function panicked. The call was still retired and every
    /// waiter released.
    #[error("work for key {key} panicked: {message}")]
    Panicked { key: String, message: String },
    /// The caller running the work was dropped before it finished, which
    /// fails the call for everyone who joined it.
    #[error("leader for key {0} was dropped before completing")]
    LeaderDropped(String),
    /// This caller stopped waiting. Other callers are unaffected.
    #[error("gave up waiting for key {0}")]
    Cancelled(String),
}

impl Error {
    /// The work function's own error, if that is what failed the call.
    pub fn as_work(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Work(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

/// What one caller gets back from [`Group::work`] and friends.
#[derive(Clone, Debug)]
#[must_use]
pub struct Outcome<T> {
    pub result: Result<T>,
    /// `false` for the caller that ran the work, `true` for everyone who
    /// joined it.
    pub shared: bool,
}

impl<T> Outcome<T> {
    fn leader(result: Result<T>) -> Self {
        Self {
            result,
            shared: false,
        }
    }

    fn joined(result: Result<T>) -> Self {
        Self {
            result,
            shared: true,
        }
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
