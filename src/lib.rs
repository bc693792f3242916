//! `resilient-http` is a resilient async HTTP request layer.
//!
//! It wraps a raw [`Transport`] with:
//! - retries with backoff, see [`RetryPolicy`]
//! - result caching keyed by request identity and handler [`Fingerprint`],
//!   see [`ResponseCache`]
//! - bounded-concurrency batches with per-task failure handling, see
//!   [`ResilientClient::batch`]

mod cache;
mod client;
mod config;
mod error;
mod fingerprint;
mod pool;
mod response;
mod retry;
mod transport;

pub use cache::{CacheEntry, CacheStore, MemoryStore, ResponseCache};
pub use client::ResilientClient;
pub use config::{merge, ConfigOverrides, NoTtl, RequestConfig, TtlArg, OPTION_NAMES};
pub use error::{ConnectionErrorKind, RequestError};
pub use fingerprint::{fingerprint, Fingerprint, Handler, HandlerIdentity, Invoke};
pub use pool::{run_all, BatchTarget, PoolTask, RejectDecision, RejectHandler, TaskKey};
pub use reqwest::Method;
pub use response::Response;
pub use retry::{Attempt, AttemptObserver, Backoff, RetryDecision, RetryPolicy, RetryPredicate};
pub use transport::{ReqwestTransport, Transport};

pub type Result<T> = std::result::Result<T, RequestError>;
