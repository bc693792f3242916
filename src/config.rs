//! Layered request configuration.
//!
//! [`RequestConfig`] is the complete option set a request runs with.
//! [`ConfigOverrides`] is a partial overlay applied on top of it with
//! [`RequestConfig::merge`]: scalar options are replaced, headers are merged
//! name by name and a header overridden with `None` is removed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{json, Map, Value as JsonValue};

use crate::{
    Attempt, AttemptObserver, Backoff, Handler, RequestError, Result, RetryPolicy, RetryPredicate,
};

/// Option names understood by [`RequestConfig::get`] and
/// [`ConfigOverrides::from_json`].
pub const OPTION_NAMES: [&str; 9] = [
    "headers",
    "proxy",
    "timeout",
    "connectTimeout",
    "retryLimit",
    "cacheTtl",
    "handler",
    "httpErrorsEnabled",
    "onAttemptObserver",
];

const REDACTED_HEADERS: [&str; 2] = ["authorization", "proxy-authorization"];

/// Explicit "no TTL" marker for [`RequestConfig::set_cache_ttl`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NoTtl;

/// Values accepted as a cache TTL.
///
/// Durations, integer seconds and "no TTL" (`None`, [`NoTtl`], JSON `null`)
/// are accepted. Strings are always rejected, even when they look like a
/// duration.
pub trait TtlArg {
    fn into_ttl(self) -> Result<Option<Duration>>;
}

impl TtlArg for Duration {
    fn into_ttl(self) -> Result<Option<Duration>> {
        Ok(Some(self))
    }
}

impl TtlArg for Option<Duration> {
    fn into_ttl(self) -> Result<Option<Duration>> {
        Ok(self)
    }
}

impl TtlArg for NoTtl {
    fn into_ttl(self) -> Result<Option<Duration>> {
        Ok(None)
    }
}

impl TtlArg for u64 {
    fn into_ttl(self) -> Result<Option<Duration>> {
        Ok(Some(Duration::from_secs(self)))
    }
}

impl TtlArg for u32 {
    fn into_ttl(self) -> Result<Option<Duration>> {
        u64::from(self).into_ttl()
    }
}

impl TtlArg for i64 {
    fn into_ttl(self) -> Result<Option<Duration>> {
        u64::try_from(self)
            .map_err(|_| {
                RequestError::invalid_argument(format!(
                    "cache TTL must not be negative, got {self}"
                ))
            })?
            .into_ttl()
    }
}

impl TtlArg for i32 {
    fn into_ttl(self) -> Result<Option<Duration>> {
        i64::from(self).into_ttl()
    }
}

impl TtlArg for &str {
    fn into_ttl(self) -> Result<Option<Duration>> {
        Err(RequestError::invalid_argument(format!(
            "cache TTL must be a duration, a number of seconds or no TTL, got string '{self}'"
        )))
    }
}

impl TtlArg for String {
    fn into_ttl(self) -> Result<Option<Duration>> {
        self.as_str().into_ttl()
    }
}

impl TtlArg for &JsonValue {
    fn into_ttl(self) -> Result<Option<Duration>> {
        match self {
            JsonValue::Null => Ok(None),
            JsonValue::String(text) => text.as_str().into_ttl(),
            JsonValue::Number(number) => match (number.as_u64(), number.as_i64()) {
                (Some(seconds), _) => seconds.into_ttl(),
                (None, Some(seconds)) => seconds.into_ttl(),
                _ => Err(RequestError::invalid_argument(format!(
                    "cache TTL must be a whole number of seconds, got {number}"
                ))),
            },
            other => Err(RequestError::invalid_argument(format!(
                "cache TTL must be a duration, a number of seconds or no TTL, got {other}"
            ))),
        }
    }
}

impl TtlArg for JsonValue {
    fn into_ttl(self) -> Result<Option<Duration>> {
        (&self).into_ttl()
    }
}

/// Options one logical request runs with.
#[derive(Clone)]
pub struct RequestConfig {
    headers: Vec<(String, String)>,
    proxy: Option<String>,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    retry_limit: u32,
    cache_ttl: Option<Duration>,
    handler: Option<Handler>,
    http_errors: bool,
    on_attempt: Option<AttemptObserver>,
    backoff: Backoff,
    retry_predicate: Option<RetryPredicate>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            proxy: None,
            timeout: None,
            connect_timeout: None,
            retry_limit: 0,
            cache_ttl: None,
            handler: None,
            http_errors: true,
            on_attempt: None,
            backoff: Backoff::default(),
            retry_predicate: None,
        }
    }
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                if REDACTED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                    (name.as_str(), "<redacted>")
                } else {
                    (name.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("RequestConfig")
            .field("headers", &headers)
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_limit", &self.retry_limit)
            .field("cache_ttl", &self.cache_ttl)
            .field("handler", &self.handler)
            .field("http_errors", &self.http_errors)
            .field("on_attempt", &self.on_attempt.is_some())
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RequestConfig {
    /// Default configuration: no headers, no timeouts, no retries, no cache
    /// TTL and HTTP errors enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header, replacing any header with the same name.
    pub fn set_header(mut self, name: &str, value: &str) -> Result<Self> {
        validate_header(name, value)?;
        upsert_header(&mut self.headers, name, value);
        Ok(self)
    }

    /// Removes the header `name`, compared case-insensitively.
    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self
    }

    /// Routes requests through the proxy at `uri`.
    pub fn set_proxy(mut self, uri: &str) -> Result<Self> {
        self.proxy = Some(validate_proxy(uri)?);
        Ok(self)
    }

    /// Sends requests directly, without a proxy.
    pub fn clear_proxy(mut self) -> Self {
        self.proxy = None;
        self
    }

    /// Bounds every attempt to `seconds`; `0` disables the bound.
    pub fn set_timeout(mut self, seconds: f64) -> Result<Self> {
        self.timeout = seconds_option("timeout", seconds)?;
        Ok(self)
    }

    /// Bounds the connect phase to `seconds`; `0` disables the bound.
    pub fn set_connect_timeout(mut self, seconds: f64) -> Result<Self> {
        self.connect_timeout = seconds_option("connect timeout", seconds)?;
        Ok(self)
    }

    /// Number of retries after the initial attempt.
    pub fn set_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets how long results are cached, see [`TtlArg`] for accepted values.
    pub fn set_cache_ttl<T: TtlArg>(mut self, ttl: T) -> Result<Self> {
        self.cache_ttl = ttl.into_ttl()?;
        Ok(self)
    }

    /// Transforms every response with `handler`; its output becomes the
    /// request's result.
    pub fn set_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Resolves requests to the [`Response`](crate::Response) itself.
    pub fn clear_handler(mut self) -> Self {
        self.handler = None;
        self
    }

    /// When enabled, non-2xx responses fail the attempt with
    /// [`RequestError::Response`].
    pub fn set_http_errors(mut self, enabled: bool) -> Self {
        self.http_errors = enabled;
        self
    }

    /// Calls `observer` after every attempt, successful or not.
    pub fn set_on_attempt<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Attempt<'_>) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(observer));
        self
    }

    /// Sets the delay inserted between attempts.
    pub fn set_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the default retry classification.
    pub fn set_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestError) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }

    /// Headers in the order they were first set.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Value of the header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Proxy URI, if any.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Per-attempt bound, `None` when unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Connect-phase bound, `None` when unbounded.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Retries allowed after the initial attempt.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// How long results are cached, `None` without a TTL.
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    /// Response transform, if any.
    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    /// Whether non-2xx responses fail the attempt.
    pub fn http_errors_enabled(&self) -> bool {
        self.http_errors
    }

    /// Per-attempt observer, if any.
    pub fn on_attempt(&self) -> Option<&AttemptObserver> {
        self.on_attempt.as_ref()
    }

    /// Delay inserted between attempts.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.retry_limit, self.backoff.clone());
        match &self.retry_predicate {
            Some(predicate) => policy.with_predicate(Arc::clone(predicate)),
            None => policy,
        }
    }

    /// Value of a single option, by its name in [`OPTION_NAMES`].
    ///
    /// The handler is reported by its fingerprint and the observer by whether
    /// one is set.
    pub fn get(&self, name: &str) -> Option<JsonValue> {
        let value = match name {
            "headers" => JsonValue::Object(
                self.headers
                    .iter()
                    .map(|(key, value)| (key.clone(), JsonValue::String(value.clone())))
                    .collect(),
            ),
            "proxy" => json!(self.proxy),
            "timeout" => json!(self.timeout.map(|timeout| timeout.as_secs_f64())),
            "connectTimeout" => json!(self.connect_timeout.map(|timeout| timeout.as_secs_f64())),
            "retryLimit" => json!(self.retry_limit),
            "cacheTtl" => json!(self.cache_ttl.map(|ttl| ttl.as_secs_f64())),
            "handler" => json!(self
                .handler
                .as_ref()
                .map(|handler| handler.fingerprint().to_string())),
            "httpErrorsEnabled" => json!(self.http_errors),
            "onAttemptObserver" => json!(self.on_attempt.is_some()),
            _ => return None,
        };
        Some(value)
    }

    /// Every option keyed by its name.
    pub fn get_all(&self) -> Map<String, JsonValue> {
        OPTION_NAMES
            .iter()
            .filter_map(|name| self.get(name).map(|value| ((*name).to_owned(), value)))
            .collect()
    }

    /// Returns a new configuration with `overrides` layered on top.
    pub fn merge(&self, overrides: &ConfigOverrides) -> RequestConfig {
        let mut merged = self.clone();
        for (name, value) in &overrides.headers {
            match value {
                Some(value) => upsert_header(&mut merged.headers, name, value),
                None => merged
                    .headers
                    .retain(|(key, _)| !key.eq_ignore_ascii_case(name)),
            }
        }
        if let Some(proxy) = &overrides.proxy {
            merged.proxy = proxy.clone();
        }
        if let Some(timeout) = overrides.timeout {
            merged.timeout = timeout;
        }
        if let Some(connect_timeout) = overrides.connect_timeout {
            merged.connect_timeout = connect_timeout;
        }
        if let Some(retry_limit) = overrides.retry_limit {
            merged.retry_limit = retry_limit;
        }
        if let Some(cache_ttl) = overrides.cache_ttl {
            merged.cache_ttl = cache_ttl;
        }
        if let Some(handler) = &overrides.handler {
            merged.handler = Some(handler.clone());
        }
        if let Some(http_errors) = overrides.http_errors {
            merged.http_errors = http_errors;
        }
        if let Some(observer) = &overrides.on_attempt {
            merged.on_attempt = Some(Arc::clone(observer));
        }
        merged
    }
}

/// Merges `overrides` onto `base`, see [`RequestConfig::merge`].
pub fn merge(base: &RequestConfig, overrides: &ConfigOverrides) -> RequestConfig {
    base.merge(overrides)
}

/// Partial configuration layered over a [`RequestConfig`].
///
/// Every setter validates immediately, so an invalid overlay can never reach
/// the retry loop.
#[derive(Clone, Default)]
pub struct ConfigOverrides {
    headers: Vec<(String, Option<String>)>,
    proxy: Option<Option<String>>,
    timeout: Option<Option<Duration>>,
    connect_timeout: Option<Option<Duration>>,
    retry_limit: Option<u32>,
    cache_ttl: Option<Option<Duration>>,
    handler: Option<Handler>,
    http_errors: Option<bool>,
    on_attempt: Option<AttemptObserver>,
}

impl fmt::Debug for ConfigOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ConfigOverrides")
            .field("headers", &headers)
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_limit", &self.retry_limit)
            .field("cache_ttl", &self.cache_ttl)
            .field("handler", &self.handler)
            .field("http_errors", &self.http_errors)
            .field("on_attempt", &self.on_attempt.is_some())
            .finish()
    }
}

impl ConfigOverrides {
    /// Empty overlay: merging it changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or replaces the header `name` in the merged headers.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        validate_header(name, value)?;
        self.set_header_entry(name, Some(value.to_owned()));
        Ok(self)
    }

    /// Removes `name` from the merged headers.
    pub fn remove_header(mut self, name: &str) -> Self {
        self.set_header_entry(name, None);
        self
    }

    /// Overrides the proxy, see [`RequestConfig::set_proxy`].
    pub fn proxy(mut self, uri: &str) -> Result<Self> {
        self.proxy = Some(Some(validate_proxy(uri)?));
        Ok(self)
    }

    /// Removes any base proxy.
    pub fn no_proxy(mut self) -> Self {
        self.proxy = Some(None);
        self
    }

    /// Overrides the per-attempt timeout, see [`RequestConfig::set_timeout`].
    pub fn timeout(mut self, seconds: f64) -> Result<Self> {
        self.timeout = Some(seconds_option("timeout", seconds)?);
        Ok(self)
    }

    /// Overrides the connect timeout.
    pub fn connect_timeout(mut self, seconds: f64) -> Result<Self> {
        self.connect_timeout = Some(seconds_option("connect timeout", seconds)?);
        Ok(self)
    }

    /// Overrides the number of retries after the initial attempt.
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    /// Overrides the cache TTL; [`NoTtl`] clears a base TTL.
    pub fn cache_ttl<T: TtlArg>(mut self, ttl: T) -> Result<Self> {
        self.cache_ttl = Some(ttl.into_ttl()?);
        Ok(self)
    }

    /// Overrides the response handler.
    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Overrides whether non-2xx responses fail the attempt.
    pub fn http_errors(mut self, enabled: bool) -> Self {
        self.http_errors = Some(enabled);
        self
    }

    /// Overrides the per-attempt observer.
    pub fn on_attempt<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Attempt<'_>) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(observer));
        self
    }

    /// Parses an options object such as
    /// `{"headers": {"Accept-Language": null}, "timeout": 2.5, "cacheTtl": 60}`.
    ///
    /// Unknown keys and mistyped values are rejected. `handler` and
    /// `onAttemptObserver` cannot be expressed as data and are rejected too;
    /// set them with [`ConfigOverrides::handler`] and
    /// [`ConfigOverrides::on_attempt`].
    pub fn from_json(options: &JsonValue) -> Result<Self> {
        let object = options.as_object().ok_or_else(|| {
            RequestError::invalid_argument(format!("options must be an object, got {options}"))
        })?;

        let mut overrides = Self::default();
        for (key, value) in object {
            overrides = match key.as_str() {
                "headers" => overrides.json_headers(value)?,
                "proxy" => match value {
                    JsonValue::Null => overrides.no_proxy(),
                    JsonValue::String(uri) => overrides.proxy(uri)?,
                    other => return Err(type_error("proxy", "a URI string or null", other)),
                },
                "timeout" => overrides.timeout(json_seconds("timeout", value)?)?,
                "connectTimeout" => {
                    overrides.connect_timeout(json_seconds("connectTimeout", value)?)?
                }
                "retryLimit" => {
                    let limit = value
                        .as_u64()
                        .and_then(|limit| u32::try_from(limit).ok())
                        .ok_or_else(|| {
                            type_error("retryLimit", "a non-negative integer", value)
                        })?;
                    overrides.retry_limit(limit)
                }
                "cacheTtl" => overrides.cache_ttl(value)?,
                "httpErrorsEnabled" => {
                    let enabled = value
                        .as_bool()
                        .ok_or_else(|| type_error("httpErrorsEnabled", "a boolean", value))?;
                    overrides.http_errors(enabled)
                }
                "handler" | "onAttemptObserver" => {
                    return Err(RequestError::invalid_argument(format!(
                        "option '{key}' must be set programmatically"
                    )))
                }
                unknown => {
                    return Err(RequestError::invalid_argument(format!(
                        "unknown option '{unknown}'"
                    )))
                }
            };
        }
        Ok(overrides)
    }

    /// Parses a JSON options document, see [`ConfigOverrides::from_json`].
    pub fn from_json_str(options: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(options).map_err(|err| {
            RequestError::invalid_argument(format!("options are not valid JSON: {err}"))
        })?;
        Self::from_json(&value)
    }

    fn json_headers(mut self, value: &JsonValue) -> Result<Self> {
        let headers = value
            .as_object()
            .ok_or_else(|| type_error("headers", "an object", value))?;
        for (name, value) in headers {
            self = match value {
                JsonValue::Null => self.remove_header(name),
                JsonValue::String(text) => self.header(name, text)?,
                other => {
                    return Err(type_error(
                        &format!("header '{name}'"),
                        "a string or null",
                        other,
                    ))
                }
            };
        }
        Ok(self)
    }

    fn set_header_entry(&mut self, name: &str, value: Option<String>) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_owned(), value)),
        }
    }
}

fn upsert_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers
        .iter_mut()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
    {
        Some(entry) => entry.1 = value.to_owned(),
        None => headers.push((name.to_owned(), value.to_owned())),
    }
}

fn validate_header(name: &str, value: &str) -> Result<()> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| RequestError::invalid_argument(format!("invalid header name '{name}'")))?;
    HeaderValue::from_str(value).map_err(|_| {
        RequestError::invalid_argument(format!("invalid value for header '{name}'"))
    })?;
    Ok(())
}

fn validate_proxy(uri: &str) -> Result<String> {
    let uri = uri.trim();
    let parsed = reqwest::Url::parse(uri)
        .map_err(|err| RequestError::invalid_argument(format!("invalid proxy URI '{uri}': {err}")))?;
    if parsed.cannot_be_a_base() {
        return Err(RequestError::invalid_argument(format!(
            "proxy URI '{uri}' is not absolute"
        )));
    }
    Ok(uri.to_owned())
}

fn seconds_option(option: &str, seconds: f64) -> Result<Option<Duration>> {
    if !seconds.is_finite() {
        return Err(RequestError::invalid_argument(format!(
            "{option} must be a finite number of seconds, got {seconds}"
        )));
    }
    if seconds < 0.0 {
        return Err(RequestError::invalid_argument(format!(
            "{option} must not be negative, got {seconds}"
        )));
    }
    if seconds == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(seconds).map(Some).map_err(|_| {
        RequestError::invalid_argument(format!("{option} of {seconds} seconds is out of range"))
    })
}

fn json_seconds(option: &str, value: &JsonValue) -> Result<f64> {
    match value {
        JsonValue::Null => Ok(0.0),
        JsonValue::Number(number) => number
            .as_f64()
            .ok_or_else(|| type_error(option, "a number of seconds", value)),
        other => Err(type_error(option, "a number of seconds", other)),
    }
}

fn type_error(option: &str, expected: &str, got: &JsonValue) -> RequestError {
    RequestError::invalid_argument(format!("{option} must be {expected}, got {got}"))
}
