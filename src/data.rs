//! Data structures for passing keys into a batch and distributing the batch
//! function's results back out to the waiting futures.

use std::{
    collections::hash_map::{Entry, HashMap},
    hash::Hash,
    iter, mem,
};

use crate::error::LoadError;

/// What a batch function resolves to: either one result per key, in the same
/// order as the keys it was given, or a single error for the whole batch.
pub type FetchResult<Value, Error> = Result<Vec<Result<Value, Error>>, Error>;

/// The position of a key in its batch. Every future waiting on a key holds
/// the token for that key, and uses it to pull its result out of the
/// ValueSet once the batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(usize);

/// The ordered set of unique keys accumulated by a batch. Keys keep the order
/// in which they were first requested; requesting a key a second time
/// returns the token it already has.
#[derive(Debug)]
pub(crate) struct KeySet<Key> {
    keys: Vec<Key>,
    tokens: HashMap<Key, Token>,
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            tokens: HashMap::new(),
        }
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let next = Token(self.keys.len());

        match self.tokens.entry(key) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                self.keys.push(entry.key().clone());
                entry.insert(next);
                next
            }
        }
    }

    /// Take the keys out of this set in request order, leaving it empty.
    /// Used when the batch stops accumulating and is dispatched.
    pub(crate) fn take(&mut self) -> Vec<Key> {
        self.tokens.clear();
        mem::take(&mut self.keys)
    }
}

/// The results of a completed batch, one per key, indexed by Token.
#[derive(Debug)]
pub(crate) struct ValueSet<Value, Error> {
    values: Vec<Result<Value, LoadError<Error>>>,
}

impl<Value: Clone, Error: Clone> ValueSet<Value, Error> {
    /// Pair the output of a batch function with the `expected` keys it was
    /// called with. A batch-wide error, or a result list of the wrong length,
    /// is spread across every key so that no waiter goes without a result.
    pub(crate) fn from_fetch(expected: usize, result: FetchResult<Value, Error>) -> Self {
        match result {
            Ok(values) if values.len() == expected => Self {
                values: values
                    .into_iter()
                    .map(|value| value.map_err(LoadError::Fetch))
                    .collect(),
            },
            Ok(values) => Self::uniform(
                expected,
                LoadError::ResultCount {
                    expected,
                    actual: values.len(),
                },
            ),
            Err(err) => Self::uniform(expected, LoadError::Batch(err)),
        }
    }

    /// A ValueSet where every key failed with the same error.
    pub(crate) fn uniform(len: usize, err: LoadError<Error>) -> Self {
        Self {
            values: iter::repeat(Err(err)).take(len).collect(),
        }
    }

    /// Get a copy of the result associated with a token.
    ///
    /// Every future holding a token for this batch must find a result here;
    /// a missing one means the token came from a different batch.
    pub(crate) fn get(&self, token: Token) -> Result<Value, LoadError<Error>> {
        match self.values.get(token.0) {
            Some(result) => result.clone(),
            None => panic!("Unknown logic error: no value in ValueSet associated with Token"),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Result<Value, LoadError<Error>>> {
        self.values.iter()
    }
}
