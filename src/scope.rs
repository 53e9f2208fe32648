//! Binding loaders to the lifetime of a request or connection.
//!
//! Memoized results must never outlive the request that produced them, so
//! loaders are created fresh for every scope and thrown away with it. A
//! [`ScopeFactory`] holds the one function that knows how to build a scope's
//! loaders; the entry points ([`ScopeFactory::request`] for request/response
//! handlers, [`ScopeFactory::connection`] for long-lived connections) only
//! decide when a scope starts and ends.

use std::{
    any::{self, Any, TypeId},
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tracing::{debug, warn};

use crate::loader::Loader;

/// Names one kind of loader in a [`Scope`].
///
/// Kinds are usually empty marker types; the associated types pin down the
/// exact [`Loader`] stored for the kind, so that retrieving it is type-safe.
///
/// ```
/// use scopeloader::LoaderKind;
///
/// struct UserById;
///
/// impl LoaderKind for UserById {
///     type Key = u64;
///     type Value = String;
///     type Error = String;
/// }
/// ```
pub trait LoaderKind: 'static {
    type Key: Eq + Hash + Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;
    type Error: Clone + Send + Sync + 'static;
}

/// The loader type stored in a [`Scope`] for the kind `L`.
pub type LoaderOf<L> =
    Loader<<L as LoaderKind>::Key, <L as LoaderKind>::Value, <L as LoaderKind>::Error>;

trait ScopedLoader: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn cancel_pending(&self) -> usize;
}

impl<Key, Value, Error> ScopedLoader for Loader<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
    Error: Clone + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn cancel_pending(&self) -> usize {
        Loader::cancel_pending(self)
    }
}

struct Entry {
    kind: &'static str,
    loader: Box<dyn ScopedLoader>,
}

/// Collects the loaders for a new [`Scope`].
#[derive(Default)]
pub struct ScopeBuilder {
    loaders: HashMap<TypeId, Entry>,
}

impl ScopeBuilder {
    /// Register the loader for kind `L`. Registering a kind twice replaces
    /// the first loader.
    pub fn insert<L: LoaderKind>(&mut self, loader: LoaderOf<L>) -> &mut Self {
        let kind = any::type_name::<L>();
        let entry = Entry {
            kind,
            loader: Box::new(loader),
        };

        if self.loaders.insert(TypeId::of::<L>(), entry).is_some() {
            warn!(kind, "loader registered twice in one scope; keeping the last one");
        }

        self
    }

    pub fn build(self) -> Scope {
        self.build_with_id(0)
    }

    fn build_with_id(self, id: u64) -> Scope {
        debug!(scope = id, loaders = self.loaders.len(), "opened scope");
        Scope {
            id,
            loaders: self.loaders,
        }
    }
}

impl Debug for ScopeBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.loaders.values().map(|entry| entry.kind))
            .finish()
    }
}

/// The loaders belonging to one request or connection.
///
/// Resolvers retrieve a loader with [`loader`][Scope::loader], keyed by its
/// [`LoaderKind`]. When the scope is torn down (explicitly with
/// [`teardown`][Scope::teardown], or by being dropped), every lookup still
/// waiting on one of its loaders fails with
/// [`LoadError::Cancelled`][crate::LoadError::Cancelled].
pub struct Scope {
    id: u64,
    loaders: HashMap<TypeId, Entry>,
}

impl Scope {
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::default()
    }

    /// Identifies this scope in log events. Scopes built by a
    /// [`ScopeFactory`] are numbered from 1; others are 0.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_loader<L: LoaderKind>(&self) -> Option<&LoaderOf<L>> {
        self.loaders
            .get(&TypeId::of::<L>())
            .and_then(|entry| entry.loader.as_any().downcast_ref())
    }

    /// Get the loader for kind `L`.
    ///
    /// # Panics
    ///
    /// Panics if no loader of that kind was registered. This means the scope
    /// was wired incorrectly, which is a bug rather than a runtime condition.
    pub fn loader<L: LoaderKind>(&self) -> &LoaderOf<L> {
        match self.try_loader::<L>() {
            Some(loader) => loader,
            None => panic!(
                "no loader of kind {} is registered in scope {}",
                any::type_name::<L>(),
                self.id
            ),
        }
    }

    /// Cancel every pending lookup on every loader in this scope. Returns the
    /// number of keys that were cancelled.
    pub fn teardown(&self) -> usize {
        let cancelled = self
            .loaders
            .values()
            .map(|entry| entry.loader.cancel_pending())
            .sum();

        debug!(scope = self.id, cancelled, "tore down scope");
        cancelled
    }
}

impl Debug for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field(
                "loaders",
                &self.loaders.values().map(|entry| entry.kind).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builds identical, independent scopes for every entry point.
///
/// The factory function receives a fresh [`ScopeBuilder`] and registers one
/// loader per kind; backend handles are captured by the closure.
///
/// ```
/// use std::sync::Arc;
///
/// use futures::executor::block_on;
/// use scopeloader::{Loader, LoaderConfig, LoaderKind, ScopeFactory};
///
/// struct Store;
///
/// impl Store {
///     async fn names(&self, ids: Vec<u64>) -> Result<Vec<Result<String, String>>, String> {
///         Ok(ids.into_iter().map(|id| Ok(format!("user {}", id))).collect())
///     }
/// }
///
/// struct UserName;
///
/// impl LoaderKind for UserName {
///     type Key = u64;
///     type Value = String;
///     type Error = String;
/// }
///
/// let store = Arc::new(Store);
/// let factory = ScopeFactory::new(move |scope| {
///     let store = store.clone();
///     scope.insert::<UserName>(Loader::new(LoaderConfig::default(), move |ids| {
///         let store = store.clone();
///         async move { store.names(ids).await }
///     }));
/// });
///
/// let name = block_on(factory.request(|scope| async move {
///     scope.loader::<UserName>().load(7).await
/// }));
/// assert_eq!(name.unwrap(), "user 7");
/// ```
#[derive(Clone)]
pub struct ScopeFactory {
    init: Arc<dyn Fn(&mut ScopeBuilder) + Send + Sync>,
    next_id: Arc<AtomicU64>,
}

impl ScopeFactory {
    pub fn new<Init>(init: Init) -> Self
    where
        Init: Fn(&mut ScopeBuilder) + Send + Sync + 'static,
    {
        Self {
            init: Arc::new(init),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Build a new scope with a fresh set of loaders.
    pub fn scope(&self) -> Scope {
        let mut builder = ScopeBuilder::default();
        (self.init)(&mut builder);
        builder.build_with_id(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Run a request handler in a scope of its own. The scope is torn down as
    /// soon as the handler finishes, or as soon as the returned future is
    /// dropped, even if the handler leaked clones of it to other tasks.
    pub async fn request<Handler, Fut, T>(&self, handler: Handler) -> T
    where
        Handler: FnOnce(Arc<Scope>) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.connection();
        let output = handler(guard.scope()).await;
        drop(guard);
        output
    }

    /// Open a scope for a long-lived connection. Every operation on the
    /// connection shares the scope, which is torn down when the returned
    /// guard is dropped.
    pub fn connection(&self) -> ConnectionScope {
        ConnectionScope {
            scope: Arc::new(self.scope()),
        }
    }
}

impl Debug for ScopeFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeFactory")
            .field("init", &"<closure>")
            .field("next_id", &self.next_id)
            .finish()
    }
}

/// A scope bound to the lifetime of a connection. See
/// [`ScopeFactory::connection`].
#[derive(Debug)]
pub struct ConnectionScope {
    scope: Arc<Scope>,
}

impl ConnectionScope {
    /// A shared handle to the scope, for handing to the connection's tasks.
    pub fn scope(&self) -> Arc<Scope> {
        self.scope.clone()
    }
}

impl Deref for ConnectionScope {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        self.scope.teardown();
    }
}
