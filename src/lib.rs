//! Scopeloader is a request-scoped implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader). It collects
//! individual key lookups made while handling a request into batches, makes
//! one backend call per batch, and hands each caller the result for its own
//! key, without the caller knowing anything about the batch. Results are
//! memoized for the rest of the request, so a key is fetched at most once.
//!
//! ## Overview
//!
//! Suppose resolving a list of posts needs each post's author. Looking up
//! authors one at a time issues one query per post; a [`Loader`] turns those
//! lookups into a single query per batch window.
//!
//! First, write a batch function. It receives the unique keys of a batch, in
//! the order they were first requested, and resolves to a
//! [`FetchResult`]: either one result per key, in the same order, or one
//! error for the whole batch.
//!
//! ```
//! use scopeloader::FetchResult;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum DbError {
//!     NotFound(u64),
//!     Unavailable,
//! }
//!
//! async fn users_by_id(ids: Vec<u64>) -> FetchResult<User, DbError> {
//!     // A real implementation would run one query for all the ids.
//!     Ok(ids
//!         .into_iter()
//!         .map(|id| match id {
//!             0 => Err(DbError::NotFound(id)),
//!             id => Ok(User { id, name: format!("user {}", id) }),
//!         })
//!         .collect())
//! }
//! ```
//!
//! Then create a loader around it. A [`LoaderConfig`] sets the two flush
//! triggers: `max_batch` dispatches a batch as soon as it holds that many
//! unique keys, and `wait` is the window during which keys are collected
//! before a smaller batch is dispatched anyway.
//!
//! ```
//! # use scopeloader::FetchResult;
//! # #[derive(Debug, Clone, PartialEq)] struct User { id: u64, name: String }
//! # #[derive(Debug, Clone, PartialEq)] enum DbError { NotFound(u64) }
//! # async fn users_by_id(ids: Vec<u64>) -> FetchResult<User, DbError> {
//! #     Ok(ids.into_iter().map(|id| match id {
//! #         0 => Err(DbError::NotFound(id)),
//! #         id => Ok(User { id, name: format!("user {}", id) }),
//! #     }).collect())
//! # }
//! use std::time::Duration;
//!
//! use futures::{executor::block_on, future::join};
//! use scopeloader::{LoadError, Loader, LoaderConfig};
//!
//! let config = LoaderConfig::new(100, Duration::from_millis(1)).unwrap();
//! let users = Loader::new(config, users_by_id);
//!
//! // Both lookups land in the same batch: users_by_id is called once,
//! // with [1, 0].
//! let (found, missing) = block_on(join(users.load(1), users.load(0)));
//!
//! assert_eq!(found.unwrap().name, "user 1");
//! assert_eq!(missing, Err(LoadError::Fetch(DbError::NotFound(0))));
//!
//! // Both results are memoized; neither of these calls users_by_id.
//! assert_eq!(block_on(users.load(1)).unwrap().id, 1);
//! assert!(block_on(users.load(0)).is_err());
//! ```
//!
//! Loaders are meant to live exactly as long as one request. A [`Scope`]
//! holds one loader per [`LoaderKind`], and a [`ScopeFactory`] builds a fresh
//! scope for every request ([`ScopeFactory::request`]) or connection
//! ([`ScopeFactory::connection`]). When a scope is torn down, every lookup
//! still waiting on one of its loaders fails with [`LoadError::Cancelled`].
//!
//! ## Design notes
//!
//! ### Poll-driven batches
//!
//! In keeping with Rust's polling async design, nothing in scopeloader runs
//! in the background, and no runtime is required. The batch window's timer
//! and the batch function are driven by polling the [`LoadFuture`]s waiting
//! on the batch.
//!
//! Because a batch only needs to be driven by a single task, only one task
//! (the one that most recently polled the batch) is woken to make progress.
//! The others are woken only when results are ready, or when the driving
//! future is dropped and one of them has to take over.
//!
//! The loader's locks are never held while the batch function is called or
//! polled, so keys can keep joining the next batch while one is in flight.
//!
//! ### Errors
//!
//! Every lookup resolves to exactly one `Result<Value, LoadError<Error>>`.
//! A batch function that fails as a whole, returns the wrong number of
//! results, or panics fails every key of its batch, rather than leaving any
//! of them waiting. Errors are memoized just like values, except for
//! cancellations.

mod batch;
mod config;
mod data;
mod error;
mod loader;
mod scope;
mod wakerset;

pub use batch::LoadFuture;
pub use config::LoaderConfig;
pub use data::FetchResult;
pub use error::{ConfigError, LoadError};
pub use loader::Loader;
pub use scope::{ConnectionScope, LoaderKind, LoaderOf, Scope, ScopeBuilder, ScopeFactory};
