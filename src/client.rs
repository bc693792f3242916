use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::time::timeout;

use crate::{
    pool::{self, PoolTask},
    BatchTarget, CacheStore, ConfigOverrides, RejectHandler, RequestConfig, RequestError,
    ReqwestTransport, Response, ResponseCache, Result, TaskKey, Transport,
};

#[derive(Clone)]
/// HTTP client adding retries, response caching and bounded batches on top
/// of a [`Transport`].
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    config: RequestConfig,
    cache: ResponseCache,
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Default for ResilientClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilientClient {
    /// Creates a client sending through `reqwest` with the default
    /// configuration.
    pub fn new() -> Self {
        Self::with_transport(ReqwestTransport::new())
    }

    /// Creates a client sending through a custom transport.
    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            config: RequestConfig::default(),
            cache: ResponseCache::private(),
        }
    }

    /// Replaces the base configuration every request is merged onto.
    pub fn with_config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    /// Caches results in `store`.
    ///
    /// With a store attached every request is cached; requests without a TTL
    /// are kept for as long as the store retains them.
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = ResponseCache::attached(store);
        self
    }

    /// Base configuration every request is merged onto.
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Performs one logical request and decodes its result into `T`.
    ///
    /// The result is the configured handler's output, or the [`Response`]
    /// itself when no handler is set. Transport and response failures are
    /// retried per the configuration and only surface once every attempt
    /// failed.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        overrides: &ConfigOverrides,
    ) -> Result<T> {
        let config = self.config.merge(overrides);
        let value = self.execute(&method, url, &config).await?;
        decode_result(value)
    }

    /// Performs a `GET` request, see [`ResilientClient::request`].
    pub async fn get<T: DeserializeOwned>(&self, url: &str, overrides: &ConfigOverrides) -> Result<T> {
        self.request(Method::GET, url, overrides).await
    }

    /// Runs a batch of keyed requests, at most `concurrency` at a time.
    ///
    /// Every task runs on its own snapshot of the base configuration merged
    /// with `shared` and then with the task's own overrides. A failed task is
    /// passed to `on_reject`, which either swallows it (the key is left out of
    /// the results) or aborts the batch. Without `on_reject` the first failure
    /// aborts the batch with [`RequestError::Batch`].
    pub async fn batch<T, K, B, I>(
        &self,
        method: Method,
        tasks: I,
        shared: &ConfigOverrides,
        concurrency: usize,
        on_reject: Option<&RejectHandler<'_>>,
    ) -> Result<HashMap<TaskKey, T>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = (K, B)>,
        K: Into<TaskKey>,
        B: Into<BatchTarget>,
    {
        let shared = self.config.merge(shared);
        let tasks = pool::plan(tasks, &shared)?;
        let method = &method;
        pool::run_all(tasks, concurrency, on_reject, move |task: PoolTask| async move {
            let value = self.execute(method, &task.url, &task.config).await?;
            decode_result(value)
        })
        .await
    }

    async fn execute(&self, method: &Method, url: &str, config: &RequestConfig) -> Result<serde_json::Value> {
        self.cache
            .execute(method, url, config, move || async move {
                let response = self.send_with_retry(method, url, config).await?;
                match config.handler() {
                    Some(handler) => handler.apply(&response),
                    None => Ok(serde_json::to_value(response)?),
                }
            })
            .await
    }

    async fn send_with_retry(&self, method: &Method, url: &str, config: &RequestConfig) -> Result<Response> {
        config
            .retry_policy()
            .run(config.on_attempt(), move |_| self.send_once(method, url, config))
            .await
    }

    async fn send_once(&self, method: &Method, url: &str, config: &RequestConfig) -> Result<Response> {
        let response = match config.timeout() {
            Some(limit) => timeout(limit, self.transport.send(method, url, config))
                .await
                .map_err(|_| attempt_timed_out(limit))??,
            None => self.transport.send(method, url, config).await?,
        };

        if config.http_errors_enabled() && !response.is_success() {
            return Err(RequestError::Response {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response)
    }
}

fn attempt_timed_out(limit: Duration) -> RequestError {
    RequestError::timeout(format!("attempt exceeded {} ms", limit.as_millis()))
}

fn decode_result<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| RequestError::Decode(format!("request result has an unexpected shape: {err}")))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Method;

    use super::ResilientClient;
    use crate::{
        Backoff, ConfigOverrides, Handler, RequestConfig, RequestError, Response, Result,
        Transport,
    };

    /// Transport answering from a script; `None` entries hang until timeout.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Option<Result<Response>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Option<Result<Response>>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _method: &Method, _url: &str, _config: &RequestConfig) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .expect("script mutex must not be poisoned")
                .pop_front();
            match next {
                Some(Some(outcome)) => outcome,
                Some(None) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Response::new(200, "late"))
                }
                None => Ok(Response::new(500, "script exhausted")),
            }
        }
    }

    fn fast_retries(limit: u32) -> RequestConfig {
        RequestConfig::new()
            .set_retry_limit(limit)
            .set_backoff(Backoff::None)
    }

    #[tokio::test]
    async fn response_is_the_default_result() {
        let transport = ScriptedTransport::new(vec![Some(Ok(Response::new(200, "hello")))]);
        let client = ResilientClient::with_transport(transport.clone());

        let response: Response = client
            .get("http://h/", &ConfigOverrides::new())
            .await
            .expect("request succeeds");
        assert_eq!(response.body, "hello");
    }

    #[tokio::test]
    async fn http_errors_can_be_disabled() {
        let transport = ScriptedTransport::new(vec![Some(Ok(Response::new(503, "down")))]);
        let client = ResilientClient::with_transport(transport.clone()).with_config(fast_retries(3));

        let response: Response = client
            .get("http://h/", &ConfigOverrides::new().http_errors(false))
            .await
            .expect("error statuses pass through");
        assert_eq!(response.status, 503);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_attempts_are_retried_as_connection_failures() {
        let transport = ScriptedTransport::new(vec![None, Some(Ok(Response::new(200, "ok")))]);
        let client = ResilientClient::with_transport(transport.clone()).with_config(fast_retries(1));
        let overrides = ConfigOverrides::new().timeout(0.05).expect("valid timeout");

        let response: Response = client
            .get("http://h/", &overrides)
            .await
            .expect("second attempt succeeds");
        assert_eq!(response.body, "ok");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_timeouts_surface_as_connection_errors() {
        let transport = ScriptedTransport::new(vec![None]);
        let client = ResilientClient::with_transport(transport.clone());
        let overrides = ConfigOverrides::new().timeout(0.02).expect("valid timeout");

        let err = client
            .get::<Response>("http://h/", &overrides)
            .await
            .expect_err("attempt times out");
        assert!(matches!(
            err,
            RequestError::Connection {
                kind: crate::ConnectionErrorKind::Timeout,
                ..
            }
        ));
    }

    fn tagged<F>(transform: F) -> Handler
    where
        F: Fn(&Response) -> Result<String> + Send + Sync + 'static,
    {
        Handler::closure(transform)
    }

    #[tokio::test]
    async fn forwarded_closures_keep_separate_cache_entries() {
        let transport = ScriptedTransport::new(vec![
            Some(Ok(Response::new(200, "x"))),
            Some(Ok(Response::new(200, "y"))),
        ]);
        let client = ResilientClient::with_transport(transport.clone());
        let first = tagged(|response: &Response| Ok(format!("first:{}", response.body)));
        let second = tagged(|response: &Response| Ok(format!("second:{}", response.body)));
        let cached = ConfigOverrides::new().cache_ttl(60u64).expect("valid ttl");

        let a: String = client
            .get("http://h/", &cached.clone().handler(first))
            .await
            .expect("first request succeeds");
        let b: String = client
            .get("http://h/", &cached.handler(second))
            .await
            .expect("second request succeeds");

        assert_eq!(a, "first:x");
        assert_eq!(b, "second:y");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_output_is_decoded_into_the_requested_type() {
        let transport = ScriptedTransport::new(vec![
            Some(Ok(Response::new(200, "a,b,c"))),
            Some(Ok(Response::new(200, "d,e"))),
        ]);
        let client = ResilientClient::with_transport(transport.clone());
        let split = Handler::path("csv::split", |response: &Response| {
            Ok(response.body.split(',').map(str::to_owned).collect::<Vec<_>>())
        })
        .expect("valid handler");

        let parts: Vec<String> = client
            .get("http://h/", &ConfigOverrides::new().handler(split.clone()))
            .await
            .expect("request succeeds");
        assert_eq!(parts, vec!["a", "b", "c"]);

        let err = client
            .get::<u64>("http://h/", &ConfigOverrides::new().handler(split))
            .await
            .expect_err("shape mismatch");
        assert!(matches!(err, RequestError::Decode(_)));
    }
}
