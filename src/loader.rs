use std::{
    any,
    collections::hash_map::{Entry, HashMap},
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    sync::{Arc, Weak},
};

use futures::{
    future::{join_all, JoinAll},
    FutureExt,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    batch::{AddKeyResult, BatchCell, FetchFn, LoadFuture, SharedBatch},
    config::LoaderConfig,
    data::{FetchResult, Token},
    error::LoadError,
};

/// What the loader knows about a key.
pub(crate) enum Slot<Key, Value, Error> {
    /// The key was loaded (or primed) earlier in this scope.
    Resolved(Result<Value, LoadError<Error>>),

    /// The key is part of a batch that hasn't resolved yet. Later lookups of
    /// the same key wait on that batch instead of fetching it again.
    Pending(SharedBatch<Key, Value, Error>, Token),
}

/// The shared, lock-protected state of a Loader: memoized results and the
/// batch currently accepting keys.
pub(crate) struct Registry<Key, Value, Error> {
    memo: HashMap<Key, Slot<Key, Value, Error>>,
    accumulating: Weak<BatchCell<Key, Value, Error>>,

    // Every batch that might still have waiters, so that they can be
    // cancelled when the scope is torn down.
    batches: Vec<Weak<BatchCell<Key, Value, Error>>>,
    next_batch: u64,
}

impl<Key: Eq + Hash, Value, Error> Registry<Key, Value, Error> {
    fn new() -> Self {
        Self {
            memo: HashMap::new(),
            accumulating: Weak::new(),
            batches: Vec::new(),
            next_batch: 0,
        }
    }

    /// Store the results of a completed batch. Keys that were cleared, or
    /// that were cleared and queued again in a newer batch, are left alone.
    pub(crate) fn memoize(
        &mut self,
        batch: &BatchCell<Key, Value, Error>,
        resolved: Vec<(Key, Result<Value, LoadError<Error>>)>,
    ) {
        for (key, result) in resolved {
            if let Some(slot) = self.memo.get_mut(&key) {
                if matches!(slot, Slot::Pending(pending, _) if std::ptr::eq(Arc::as_ptr(pending), batch))
                {
                    *slot = Slot::Resolved(result);
                }
            }
        }

        self.batches
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), batch) && weak.strong_count() > 0);
    }
}

/// A batching, memoizing loader for one kind of lookup.
///
/// A `Loader` collects the keys requested through [`load`][Loader::load]
/// into batches, calls its batch function once per batch, and hands each
/// caller the result for its key. Every result, success or failure, is
/// memoized for the lifetime of the loader, which is meant to be the lifetime
/// of one request (see [`Scope`][crate::Scope]).
///
/// Dropping the loader cancels every lookup that hasn't resolved yet; see
/// [`cancel_pending`][Loader::cancel_pending].
pub struct Loader<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    name: &'static str,
    config: LoaderConfig,
    fetch: FetchFn<Key, Value, Error>,
    registry: Arc<Mutex<Registry<Key, Value, Error>>>,
}

impl<Key, Value, Error> Debug for Loader<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("fetch", &"<closure>")
            .finish()
    }
}

impl<Key, Value, Error> Loader<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    /// Create a loader around a batch function.
    ///
    /// The batch function is called with the unique keys of a batch, in the
    /// order they were first requested, and must resolve to one result per
    /// key in that same order, or to a single error for the whole batch.
    pub fn new<Fetch, Fut>(config: LoaderConfig, fetch: Fetch) -> Self
    where
        Fetch: Fn(Vec<Key>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<Value, Error>> + Send + 'static,
    {
        Self {
            name: any::type_name::<Value>(),
            config,
            fetch: Arc::new(move |keys| fetch(keys).boxed()),
            registry: Arc::new(Mutex::new(Registry::new())),
        }
    }

    /// Set the name this loader uses in log events. Defaults to the name of
    /// the value type.
    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load the value for a single key.
    ///
    /// If the key was already loaded in this scope, the returned future
    /// resolves immediately with the memoized result. Otherwise the key joins
    /// the current batch (or the in-flight batch already fetching it) and
    /// the future resolves when that batch does.
    pub fn load(&self, key: Key) -> LoadFuture<Key, Value, Error> {
        let mut registry = self.registry.lock();

        match registry.memo.get(&key) {
            Some(Slot::Resolved(result)) => {
                trace!(loader = self.name, "memoized result");
                return LoadFuture::memoized(result.clone());
            }
            Some(Slot::Pending(batch, token)) => {
                return LoadFuture::waiting(batch.clone(), *token);
            }
            None => {}
        }

        let max_keys = self.config.max_batch.get();

        let (added, batch) = match registry
            .accumulating
            .upgrade()
            .map(|batch| (batch.add_key(key.clone(), max_keys), batch))
        {
            Some((AddKeyResult::Closed, _)) | None => {
                let batch = self.start_batch(&mut registry);
                (batch.add_key(key.clone(), max_keys), batch)
            }
            Some((added, batch)) => (added, batch),
        };

        // Once a batch is full, it's detached from the loader; the next key
        // starts a fresh batch.
        let token = match added {
            AddKeyResult::Added(token) => {
                registry.accumulating = Arc::downgrade(&batch);
                token
            }
            AddKeyResult::AddedLast(token) => {
                debug!(
                    loader = self.name,
                    batch = batch.id(),
                    "batch is full; dispatching without waiting"
                );
                registry.accumulating = Weak::new();
                token
            }
            AddKeyResult::Closed => unreachable!("a new batch refused a key"),
        };

        registry
            .memo
            .insert(key, Slot::Pending(batch.clone(), token));
        LoadFuture::waiting(batch, token)
    }

    /// Load several keys at once. This is the same as calling
    /// [`load`][Loader::load] for each key and awaiting them all; results
    /// are in the same order as `keys`.
    pub fn load_many<I>(&self, keys: I) -> JoinAll<LoadFuture<Key, Value, Error>>
    where
        I: IntoIterator<Item = Key>,
    {
        join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Memoize a value that is already known, so that loading its key won't
    /// call the batch function. Returns false, and does nothing, if the key is
    /// already memoized or being loaded.
    pub fn prime(&self, key: Key, value: Value) -> bool {
        match self.registry.lock().memo.entry(key) {
            Entry::Occupied(..) => false,
            Entry::Vacant(entry) => {
                entry.insert(Slot::Resolved(Ok(value)));
                true
            }
        }
    }

    /// Forget what this loader knows about a key, so that the next lookup
    /// fetches it again. Futures already waiting on the key are unaffected.
    /// Returns true if there was something to forget.
    pub fn clear(&self, key: &Key) -> bool {
        self.registry.lock().memo.remove(key).is_some()
    }

    /// Forget every memoized result. Futures already waiting on a batch are
    /// unaffected.
    pub fn clear_all(&self) {
        self.registry.lock().memo.clear();
    }

    /// The memoized result for a key, if it has resolved.
    pub fn peek(&self, key: &Key) -> Option<Result<Value, LoadError<Error>>> {
        match self.registry.lock().memo.get(key) {
            Some(Slot::Resolved(result)) => Some(result.clone()),
            _ => None,
        }
    }

    /// Dispatch the batch that is currently accumulating without waiting for
    /// its window to close. Returns false if there was no such batch.
    pub fn flush(&self) -> bool {
        let batch = {
            let mut registry = self.registry.lock();
            let batch = registry.accumulating.upgrade();
            registry.accumulating = Weak::new();
            batch
        };

        match batch {
            Some(batch) => batch.flush(),
            None => false,
        }
    }

    /// Resolve every lookup that is still waiting on a batch with
    /// [`LoadError::Cancelled`]. Timers are stopped, and batch functions that
    /// are in progress are dropped. Cancelled keys are not memoized. Returns
    /// the number of keys that were cancelled.
    ///
    /// This is called automatically when the loader is dropped.
    pub fn cancel_pending(&self) -> usize {
        let batches: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.accumulating = Weak::new();
            registry
                .memo
                .retain(|_, slot| matches!(slot, Slot::Resolved(..)));
            registry
                .batches
                .drain(..)
                .filter_map(|batch| batch.upgrade())
                .collect()
        };

        let cancelled: usize = batches
            .iter()
            .map(|batch| batch.abort(LoadError::Cancelled).len())
            .sum();

        if cancelled > 0 {
            debug!(loader = self.name, cancelled, "cancelled pending loads");
        }

        cancelled
    }

    fn start_batch(
        &self,
        registry: &mut Registry<Key, Value, Error>,
    ) -> SharedBatch<Key, Value, Error> {
        let id = registry.next_batch;
        registry.next_batch += 1;

        let batch = Arc::new(BatchCell::new(
            id,
            self.name,
            self.fetch.clone(),
            Arc::downgrade(&self.registry),
            self.config.wait,
        ));

        registry.batches.retain(|batch| batch.strong_count() > 0);
        registry.batches.push(Arc::downgrade(&batch));
        trace!(loader = self.name, batch = id, "opened batch window");

        batch
    }
}

impl<Key, Value, Error> Drop for Loader<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
