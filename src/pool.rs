//! Bounded-concurrency execution of keyed request batches.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;

use futures_util::stream::{self, StreamExt};

use crate::{ConfigOverrides, RequestConfig, RequestError, Result};

/// Caller-chosen identity of one task in a batch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    Int(i64),
    Str(String),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(key) => write!(f, "{key}"),
            Self::Str(key) => f.write_str(key),
        }
    }
}

impl From<&str> for TaskKey {
    fn from(key: &str) -> Self {
        Self::Str(key.to_owned())
    }
}

impl From<String> for TaskKey {
    fn from(key: String) -> Self {
        Self::Str(key)
    }
}

impl From<i64> for TaskKey {
    fn from(key: i64) -> Self {
        Self::Int(key)
    }
}

impl From<i32> for TaskKey {
    fn from(key: i32) -> Self {
        Self::Int(key.into())
    }
}

impl From<u32> for TaskKey {
    fn from(key: u32) -> Self {
        Self::Int(key.into())
    }
}

/// What a batch task requests: a bare URL or a URL with its own overrides.
#[derive(Clone, Debug)]
pub enum BatchTarget {
    Url(String),
    Configured {
        url: String,
        overrides: ConfigOverrides,
    },
}

impl BatchTarget {
    /// Target with overrides layered over the batch's shared configuration.
    pub fn configured(url: impl Into<String>, overrides: ConfigOverrides) -> Self {
        Self::Configured {
            url: url.into(),
            overrides,
        }
    }

    /// URL requested by this target.
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) | Self::Configured { url, .. } => url,
        }
    }
}

impl From<&str> for BatchTarget {
    fn from(url: &str) -> Self {
        Self::Url(url.to_owned())
    }
}

impl From<String> for BatchTarget {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

/// Verdict of a rejection handler on a failed task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectDecision {
    /// Leave the key out of the results and keep going.
    Swallow,
    /// Stop the batch and fail it with this task's error.
    Abort,
}

/// Called with the terminal error and key of every failed task.
pub type RejectHandler<'a> = dyn Fn(&RequestError, &TaskKey) -> RejectDecision + Send + Sync + 'a;

/// One keyed request of a batch with its own configuration snapshot.
#[derive(Debug)]
pub struct PoolTask {
    pub key: TaskKey,
    pub url: String,
    pub config: RequestConfig,
}

/// Builds the task list of a batch, layering each target's overrides over
/// `shared`.
///
/// Keys must be unique within the batch.
pub(crate) fn plan<K, B, I>(tasks: I, shared: &RequestConfig) -> Result<Vec<PoolTask>>
where
    I: IntoIterator<Item = (K, B)>,
    K: Into<TaskKey>,
    B: Into<BatchTarget>,
{
    let mut seen = HashSet::new();
    let mut planned = Vec::new();
    for (key, target) in tasks {
        let key = key.into();
        if !seen.insert(key.clone()) {
            return Err(RequestError::invalid_argument(format!(
                "duplicate batch key '{key}'"
            )));
        }
        let task = match target.into() {
            BatchTarget::Url(url) => PoolTask {
                key,
                url,
                config: shared.clone(),
            },
            BatchTarget::Configured { url, overrides } => PoolTask {
                key,
                url,
                config: shared.merge(&overrides),
            },
        };
        planned.push(task);
    }
    Ok(planned)
}

/// Runs every task through `run`, keeping at most `concurrency` in flight.
///
/// Without `on_reject` the first failure aborts the batch. Aborting drops the
/// tasks still in flight and fails with [`RequestError::Batch`].
pub async fn run_all<T, F, Fut>(
    tasks: Vec<PoolTask>,
    concurrency: usize,
    on_reject: Option<&RejectHandler<'_>>,
    run: F,
) -> Result<HashMap<TaskKey, T>>
where
    F: Fn(PoolTask) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if concurrency == 0 {
        return Err(RequestError::invalid_argument(
            "batch concurrency must be at least 1",
        ));
    }

    let total = tasks.len();
    let mut in_flight = stream::iter(tasks.into_iter().map(|task| {
        let key = task.key.clone();
        #[cfg(feature = "tracing")]
        tracing::debug!(key = %key, url = %task.url, "dispatching batch task");
        let pending = run(task);
        async move { (key, pending.await) }
    }))
    .buffer_unordered(concurrency);

    let mut results = HashMap::with_capacity(total);
    while let Some((key, outcome)) = in_flight.next().await {
        match outcome {
            Ok(value) => {
                results.insert(key, value);
            }
            Err(error) => {
                let decision = match on_reject {
                    Some(on_reject) => on_reject(&error, &key),
                    None => RejectDecision::Abort,
                };
                match decision {
                    RejectDecision::Swallow => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(key = %key, %error, "swallowed batch task failure");
                    }
                    RejectDecision::Abort => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(key = %key, %error, "aborting batch");
                        return Err(RequestError::Batch {
                            key,
                            source: Box::new(error),
                        });
                    }
                }
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(total, succeeded = results.len(), "batch finished");

    Ok(results)
}
