use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::{future::BoxFuture, ready, FutureExt};
use futures_timer::Delay;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    data::{FetchResult, KeySet, Token as KeyToken, ValueSet},
    error::LoadError,
    loader::Registry,
    wakerset::{Token as WakerToken, WakerSet},
};

pub(crate) type FetchFn<Key, Value, Error> =
    Arc<dyn Fn(Vec<Key>) -> BoxFuture<'static, FetchResult<Value, Error>> + Send + Sync>;

/// The result of trying to add a key to a batch. A batch only accepts keys
/// while it is accumulating; the key that fills it up is reported as
/// AddedLast, and the caller should stop handing it new keys.
#[derive(Debug)]
pub(crate) enum AddKeyResult {
    Added(KeyToken),
    AddedLast(KeyToken),
    Closed,
}

enum Phase<Key, Value, Error> {
    /// Still collecting keys. The delay is None once the batch should be
    /// dispatched without waiting (it filled up, or was flushed).
    Accum {
        keys: KeySet<Key>,
        delay: Option<Delay>,
    },

    /// The batch function has been called. `fut` is None while a future has
    /// taken it out to poll it.
    Running {
        keys: Vec<Key>,
        fut: Option<BoxFuture<'static, FetchResult<Value, Error>>>,
    },

    Done(ValueSet<Value, Error>),
}

impl<Key: Debug, Value: Debug, Error: Debug> Debug for Phase<Key, Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Accum { keys, delay } => f
                .debug_struct("Accum")
                .field("keys", keys)
                .field("delay", delay)
                .finish(),
            Phase::Running { keys, fut } => f
                .debug_struct("Running")
                .field("keys", keys)
                .field("fut", &fut.as_ref().map(|_| "<batch future>"))
                .finish(),
            Phase::Done(values) => f.debug_tuple("Done").field(values).finish(),
        }
    }
}

#[derive(Debug)]
struct BatchState<Key, Value, Error> {
    phase: Phase<Key, Value, Error>,
    wakers: WakerSet,
}

/// One batch window of a loader: the keys it collects, the call to the batch
/// function, and the results handed back to every future waiting on it.
///
/// There is no background task. The futures waiting on the batch drive it,
/// through the timer, the batch function, and the distribution of results.
/// Only one of them is woken at a time to do that work; all of them are woken
/// when the results are ready.
pub(crate) struct BatchCell<Key, Value, Error> {
    id: u64,
    loader: &'static str,
    fetch: FetchFn<Key, Value, Error>,
    owner: Weak<Mutex<Registry<Key, Value, Error>>>,
    state: Mutex<BatchState<Key, Value, Error>>,
}

impl<Key: Debug, Value: Debug, Error: Debug> Debug for BatchCell<Key, Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCell")
            .field("id", &self.id)
            .field("loader", &self.loader)
            .field("fetch", &"<closure>")
            .field("state", &self.state)
            .finish()
    }
}

pub(crate) type SharedBatch<Key, Value, Error> = Arc<BatchCell<Key, Value, Error>>;

impl<Key, Value, Error> BatchCell<Key, Value, Error> {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// A future waiting on this batch is going away. If it was driving the
    /// batch, someone else needs to take over.
    fn abandon(&self, waker: WakerToken) {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Done(..)) {
            state.wakers.discard_and_wake(waker);
        }
    }
}

impl<Key, Value, Error> BatchCell<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    pub(crate) fn new(
        id: u64,
        loader: &'static str,
        fetch: FetchFn<Key, Value, Error>,
        owner: Weak<Mutex<Registry<Key, Value, Error>>>,
        wait: Duration,
    ) -> Self {
        // The window opens with the first key, so the timer starts now.
        let delay = if wait.is_zero() {
            None
        } else {
            Some(Delay::new(wait))
        };

        Self {
            id,
            loader,
            fetch,
            owner,
            state: Mutex::new(BatchState {
                phase: Phase::Accum {
                    keys: KeySet::new(),
                    delay,
                },
                wakers: WakerSet::default(),
            }),
        }
    }

    pub(crate) fn add_key(&self, key: Key, max_keys: usize) -> AddKeyResult {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match &mut state.phase {
            Phase::Accum { keys, delay } => {
                let token = keys.add_key(key);

                // A full batch never waits: drop the timer and wake the
                // driver so that it dispatches immediately.
                if keys.len() >= max_keys {
                    *delay = None;
                    state.wakers.wake_driver();
                    AddKeyResult::AddedLast(token)
                } else {
                    AddKeyResult::Added(token)
                }
            }
            _ => AddKeyResult::Closed,
        }
    }

    /// Stop waiting for the timer and dispatch on the next poll. Returns false
    /// if the batch was already dispatched or already due.
    pub(crate) fn flush(&self) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match &mut state.phase {
            Phase::Accum { delay, .. } if delay.is_some() => {
                *delay = None;
                state.wakers.wake_driver();
                true
            }
            _ => false,
        }
    }

    /// Resolve every key that hasn't resolved yet with `err`, waking all the
    /// waiting futures. The timer and any in-progress batch function are
    /// dropped. Returns the keys that were still pending.
    pub(crate) fn abort(&self, err: LoadError<Error>) -> Vec<Key> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let keys = match &mut state.phase {
            Phase::Accum { keys, .. } => keys.take(),
            Phase::Running { keys, .. } => mem::take(keys),
            Phase::Done(..) => return Vec::new(),
        };

        let old = mem::replace(
            &mut state.phase,
            Phase::Done(ValueSet::uniform(keys.len(), err)),
        );
        let wakers = mem::take(&mut state.wakers);
        drop(guard);

        // The old phase owns the timer or the batch future, which may run
        // arbitrary code when dropped; keep that outside of the lock.
        drop(old);
        wakers.wake_all();
        keys
    }

    /// The batch function panicked. Everyone waiting gets `Panicked`, and
    /// so does every later lookup of these keys.
    fn poison(&self) {
        let keys = self.abort(LoadError::Panicked);

        if let Some(owner) = self.owner.upgrade() {
            let resolved = keys
                .into_iter()
                .map(|key| (key, Err(LoadError::Panicked)))
                .collect();
            owner.lock().memoize(self, resolved);
        }
    }

    fn poll_key(
        &self,
        key: KeyToken,
        waker: &mut Option<WakerToken>,
        ctx: &mut Context<'_>,
    ) -> Poll<Result<Value, LoadError<Error>>> {
        enum Next<Key, Fut> {
            Start(Vec<Key>),
            Resume(Fut),
        }

        // Note about this mutex: it is only held for the duration of a poll,
        // and never while the batch function is being called or polled.
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let next = match &mut state.phase {
            Phase::Done(values) => return Poll::Ready(values.get(key)),

            Phase::Accum { keys, delay } => {
                state.wakers.register(waker, ctx.waker());

                if let Some(delay) = delay {
                    ready!(delay.poll_unpin(ctx));
                }

                // The window is closed. Transition to the Running state,
                // claiming the batch function for ourselves.
                debug_assert!(!keys.is_empty(), "dispatched an empty batch");
                let keys = keys.take();
                debug!(
                    loader = self.loader,
                    batch = self.id,
                    keys = keys.len(),
                    "dispatching batch"
                );
                state.phase = Phase::Running {
                    keys: keys.clone(),
                    fut: None,
                };
                Next::Start(keys)
            }

            Phase::Running { fut, .. } => {
                state.wakers.register(waker, ctx.waker());

                match fut.take() {
                    Some(fut) => Next::Resume(fut),
                    // Another future is polling the batch function right
                    // now, and will wake us when it's done.
                    None => return Poll::Pending,
                }
            }
        };

        drop(guard);

        // If the batch function panics, the batch is resolved for everyone
        // else before the panic continues.
        let claim = Claim { batch: self };
        let mut fut = match next {
            Next::Start(keys) => (self.fetch)(keys),
            Next::Resume(fut) => fut,
        };
        let polled = fut.poll_unpin(ctx);
        mem::forget(claim);

        self.settle(key, waker, fut, polled)
    }

    fn settle(
        &self,
        key: KeyToken,
        waker: &mut Option<WakerToken>,
        fut: BoxFuture<'static, FetchResult<Value, Error>>,
        polled: Poll<FetchResult<Value, Error>>,
    ) -> Poll<Result<Value, LoadError<Error>>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (keys, result) = match &mut state.phase {
            Phase::Running { keys, fut: slot } => match polled {
                Poll::Pending => {
                    *slot = Some(fut);

                    // The batch future now holds our waker, so we're the one
                    // it will wake, even if someone else polled in the
                    // meantime.
                    if let Some(token) = *waker {
                        state.wakers.set_driver(token);
                    }
                    return Poll::Pending;
                }
                Poll::Ready(result) => (mem::take(keys), result),
            },

            // The batch was cancelled while we were polling it.
            Phase::Done(values) => {
                let result = values.get(key);
                drop(guard);
                drop(fut);
                return Poll::Ready(result);
            }

            Phase::Accum { .. } => unreachable!("a dispatched batch returned to accumulating"),
        };

        match &result {
            Ok(values) if values.len() != keys.len() => warn!(
                loader = self.loader,
                batch = self.id,
                expected = keys.len(),
                actual = values.len(),
                "batch function returned the wrong number of results; failing the whole batch"
            ),
            Ok(..) => trace!(loader = self.loader, batch = self.id, "batch resolved"),
            Err(..) => debug!(
                loader = self.loader,
                batch = self.id,
                keys = keys.len(),
                "batch function failed for the whole batch"
            ),
        }

        let values = ValueSet::from_fetch(keys.len(), result);
        let output = values.get(key);
        let resolved: Vec<_> = keys.into_iter().zip(values.iter().cloned()).collect();
        state.phase = Phase::Done(values);

        // Now that we have a result, signal all the other waiting futures so
        // they can collect theirs. We're about to return ours, so we don't
        // need to wake ourself.
        let mut wakers = mem::take(&mut state.wakers);
        if let Some(token) = waker.take() {
            wakers.discard_waker(token);
        }
        drop(guard);
        wakers.wake_all();
        drop(fut);

        if let Some(owner) = self.owner.upgrade() {
            owner.lock().memoize(self, resolved);
        }

        Poll::Ready(output)
    }
}

/// Held while the batch function runs outside of the lock. Only dropped
/// (rather than forgotten) if the batch function panics.
struct Claim<'a, Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    batch: &'a BatchCell<Key, Value, Error>,
}

impl<'a, Key, Value, Error> Drop for Claim<'a, Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    fn drop(&mut self) {
        error!(
            loader = self.batch.loader,
            batch = self.batch.id,
            "batch function panicked"
        );
        self.batch.poison();
    }
}

enum LoadState<Key, Value, Error> {
    Memoized(Option<Result<Value, LoadError<Error>>>),
    Waiting {
        batch: SharedBatch<Key, Value, Error>,
        key: KeyToken,
        waker: Option<WakerToken>,
    },
    Finished,
}

/// A pending lookup of a single key, created by [`Loader::load`][crate::Loader::load].
///
/// Lookups of memoized keys resolve on the first poll. Others resolve when
/// their batch does, with the result associated with their particular key.
/// Dropping a `LoadFuture` doesn't remove its key from the batch: the key is
/// still fetched and memoized for later lookups.
pub struct LoadFuture<Key, Value, Error> {
    state: LoadState<Key, Value, Error>,
}

impl<Key, Value, Error> LoadFuture<Key, Value, Error> {
    pub(crate) fn memoized(result: Result<Value, LoadError<Error>>) -> Self {
        Self {
            state: LoadState::Memoized(Some(result)),
        }
    }

    pub(crate) fn waiting(batch: SharedBatch<Key, Value, Error>, key: KeyToken) -> Self {
        Self {
            state: LoadState::Waiting {
                batch,
                key,
                waker: None,
            },
        }
    }
}

impl<Key, Value, Error> Debug for LoadFuture<Key, Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            LoadState::Memoized(..) => "Memoized".to_string(),
            LoadState::Waiting { batch, .. } => format!("Waiting(batch {})", batch.id),
            LoadState::Finished => "Finished".to_string(),
        };
        f.debug_struct("LoadFuture").field("state", &state).finish()
    }
}

// Nothing in a LoadFuture is ever pinned in place.
impl<Key, Value, Error> Unpin for LoadFuture<Key, Value, Error> {}

impl<Key, Value, Error> Future for LoadFuture<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    type Output = Result<Value, LoadError<Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        let output = match &mut this.state {
            LoadState::Memoized(result) => result
                .take()
                .expect("Can't re-poll a completed LoadFuture"),
            LoadState::Waiting { batch, key, waker } => {
                ready!(batch.poll_key(*key, waker, ctx))
            }
            LoadState::Finished => panic!("Can't re-poll a completed LoadFuture"),
        };

        this.state = LoadState::Finished;
        Poll::Ready(output)
    }
}

impl<Key, Value, Error> Drop for LoadFuture<Key, Value, Error> {
    fn drop(&mut self) {
        if let LoadState::Waiting { batch, waker, .. } = &mut self.state {
            if let Some(token) = waker.take() {
                batch.abandon(token);
            }
        }
    }
}
