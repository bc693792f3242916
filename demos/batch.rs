use std::time::Duration;

use resilient_http::{
    ConfigOverrides, Handler, Method, RejectDecision, RequestConfig, RequestError, ResilientClient,
    Response, TaskKey,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base = std::env::var("DEMO_BASE_URL").unwrap_or_else(|_| "https://httpbin.org".to_owned());

    let config = RequestConfig::new()
        .set_header("Accept", "application/json")?
        .set_timeout(5.0)?
        .set_cache_ttl(Duration::from_secs(60))?
        .set_retry_limit(2);
    let client = ResilientClient::new().with_config(config);

    let status = Handler::path("demo::status", |response: &Response| Ok(response.status))?;
    let tasks = [
        ("ok", format!("{base}/status/200")),
        ("created", format!("{base}/status/201")),
        ("broken", format!("{base}/status/500")),
        ("missing", format!("{base}/status/404")),
    ];

    let on_reject = |error: &RequestError, key: &TaskKey| {
        eprintln!("task {key} failed: {error}");
        RejectDecision::Swallow
    };

    let results = client
        .batch::<u16, _, _, _>(
            Method::GET,
            tasks,
            &ConfigOverrides::new().handler(status),
            2,
            Some(&on_reject),
        )
        .await?;

    for (key, status) in results {
        println!("{key}: {status}");
    }

    Ok(())
}
