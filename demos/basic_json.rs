use std::time::Duration;

use reqflow::prelude::{Client, RequestOptions, RetryConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct CreateItem<'a> {
    name: &'a str,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct EchoResponse {
    json: Option<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder()
        .defaults(
            RequestOptions::new()
                .base_url("https://httpbin.org/")
                .timeout(Duration::from_secs(3))
                .try_header("x-client-name", "reqflow-example-basic")?,
        )
        .try_build()?;

    let response = client
        .request(
            RequestOptions::new()
                .url("post")
                .method(http::Method::POST)
                .json(&CreateItem {
                    name: "demo",
                    enabled: true,
                })?
                .retry_config(
                    RetryConfig::new()
                        .retry(2)
                        .retry_delay(Duration::from_millis(100))
                        .max_retry_delay(Duration::from_millis(800)),
                ),
        )
        .await?;

    let echo: EchoResponse = response.json()?;
    println!("status={} echoed={:?}", response.status(), echo.json);
    Ok(())
}
