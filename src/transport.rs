use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::{RequestConfig, RequestError, Response, Result};

/// Sends one attempt of a request.
///
/// Implementations return every response they obtain, whatever its status;
/// classifying error statuses is left to the caller. Failures to obtain a
/// response are reported as [`RequestError::Connection`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, method: &Method, url: &str, config: &RequestConfig) -> Result<Response>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, method: &Method, url: &str, config: &RequestConfig) -> Result<Response> {
        (**self).send(method, url, config).await
    }
}

type ClientKey = (Option<String>, Option<Duration>);

/// [`Transport`] backed by `reqwest`.
///
/// Proxy and connect timeout are client-level settings in `reqwest`, so one
/// client is kept per distinct pair of them.
#[derive(Default)]
pub struct ReqwestTransport {
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.clients.lock().map(|clients| clients.len()).unwrap_or(0);
        f.debug_struct("ReqwestTransport")
            .field("cached_clients", &cached)
            .finish()
    }
}

impl ReqwestTransport {
    /// Transport with no clients built yet; they are created on first use.
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, config: &RequestConfig) -> Result<reqwest::Client> {
        let key = (config.proxy().map(str::to_owned), config.connect_timeout());
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| RequestError::invalid_argument("transport client cache is poisoned"))?;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = config.proxy() {
            let proxy = reqwest::Proxy::all(proxy).map_err(|err| {
                RequestError::invalid_argument(format!("invalid proxy '{proxy}': {err}"))
            })?;
            builder = builder.proxy(proxy);
        }
        if let Some(connect_timeout) = config.connect_timeout() {
            builder = builder.connect_timeout(connect_timeout);
        }
        let client = builder.build().map_err(|err| {
            RequestError::invalid_argument(format!("could not build http client: {err}"))
        })?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, method: &Method, url: &str, config: &RequestConfig) -> Result<Response> {
        let client = self.client_for(config)?;
        let mut request = client.request(method.clone(), url);
        for (name, value) in config.headers() {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = config.timeout() {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.text().await?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ReqwestTransport;
    use crate::RequestConfig;

    #[test]
    fn clients_are_reused_per_proxy_and_connect_timeout() {
        let transport = ReqwestTransport::new();
        let plain = RequestConfig::new();
        let proxied = RequestConfig::new()
            .set_proxy("http://127.0.0.1:3128")
            .expect("valid proxy");

        transport.client_for(&plain).expect("client builds");
        transport.client_for(&plain).expect("client builds");
        transport.client_for(&proxied).expect("client builds");

        let cached = transport.clients.lock().expect("not poisoned").len();
        assert_eq!(cached, 2);
    }
}
