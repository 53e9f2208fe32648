use thiserror::Error;

/// The error half of every load result.
///
/// Backend failures are passed through untouched, wrapped in either
/// [`Fetch`][LoadError::Fetch] (the batch function blamed this particular
/// key) or [`Batch`][LoadError::Batch] (the batch function failed as a whole,
/// so every key in the batch gets the same error). The remaining variants are
/// raised by the loader itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch function reported an error for this key.
    #[error("{0}")]
    Fetch(E),

    /// The batch function failed for the whole batch.
    #[error("batch failed: {0}")]
    Batch(E),

    /// The batch function broke its contract by returning a different number
    /// of results than it was given keys. This is a bug in the batch
    /// function, not a data error.
    #[error("batch function returned {actual} results for {expected} keys")]
    ResultCount { expected: usize, actual: usize },

    /// The batch function panicked while this key was being loaded.
    #[error("batch function panicked")]
    Panicked,

    /// The scope owning the loader was torn down before this key resolved.
    #[error("load cancelled: the owning scope was torn down")]
    Cancelled,
}

impl<E> LoadError<E> {
    /// The error produced by the backend, if this error came from one.
    pub fn backend(&self) -> Option<&E> {
        match self {
            LoadError::Fetch(err) | LoadError::Batch(err) => Some(err),
            _ => None,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }

    /// True if the batch function itself misbehaved (wrong result count or a
    /// panic), as opposed to reporting a failure.
    #[inline]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, LoadError::ResultCount { .. } | LoadError::Panicked)
    }
}

/// Errors from building a [`LoaderConfig`][crate::LoaderConfig].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_batch must be at least 1")]
    ZeroMaxBatch,
}
