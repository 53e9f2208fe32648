use std::{num::NonZeroUsize, time::Duration};

use crate::error::ConfigError;

const DEFAULT_MAX_BATCH: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(max) => max,
    None => panic!("default max_batch must be nonzero"),
};

/// Rules for how a [`Loader`][crate::Loader] groups keys into batches.
///
/// A batch is dispatched as soon as it holds `max_batch` unique keys, or when
/// `wait` has passed since its first key arrived, whichever comes first. A
/// zero `wait` dispatches the batch the first time one of its futures is
/// polled, so every key requested before that poll shares the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub max_batch: NonZeroUsize,
    pub wait: Duration,
}

impl LoaderConfig {
    pub const DEFAULT_WAIT: Duration = Duration::from_millis(1);

    pub fn new(max_batch: usize, wait: Duration) -> Result<Self, ConfigError> {
        let max_batch = NonZeroUsize::new(max_batch).ok_or(ConfigError::ZeroMaxBatch)?;
        Ok(Self { max_batch, wait })
    }

    #[must_use]
    pub fn with_max_batch(self, max_batch: NonZeroUsize) -> Self {
        Self { max_batch, ..self }
    }

    #[must_use]
    pub fn with_wait(self, wait: Duration) -> Self {
        Self { wait, ..self }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            wait: Self::DEFAULT_WAIT,
        }
    }
}
