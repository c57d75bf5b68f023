use std::time::Duration;

use http::header::HeaderValue;
use reqflow::prelude::{
    Client, Error, Interceptor, RequestDescriptor, RequestError, RequestOptions, Response,
    RetryConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder()
        .defaults(RequestOptions::new().base_url("https://httpbin.org/"))
        .try_build()?;

    client.interceptors().request.add(Interceptor::new(
        |mut request: RequestDescriptor| async move {
            request
                .headers_mut()
                .insert("x-request-source", HeaderValue::from_static("demo"));
            Ok(request)
        },
    ));
    client.interceptors().response.add(
        Interceptor::new(|response: Response| async move {
            println!("<- {} {}", response.status(), response.config().url());
            Ok(response)
        })
        .on_rejected(|error: Error| async move {
            eprintln!("request failed: {error}");
            Err(error)
        }),
    );

    let retry = RetryConfig::new()
        .retry(3)
        .retry_delay(Duration::from_millis(50))
        .status_codes_to_retry([500..=599])
        .on_retry_attempt(|error: &RequestError, next: &mut RequestDescriptor| {
            let attempt = next
                .retry_config()
                .map(RetryConfig::current_retry_attempt)
                .unwrap_or_default();
            eprintln!("retry #{attempt} after: {error}");
        });

    match client
        .request(RequestOptions::new().url("status/503").retry_config(retry))
        .await
    {
        Ok(response) => println!("unexpected success: {}", response.status()),
        Err(error) => {
            let attempts = error
                .as_request_error()
                .and_then(RequestError::retry_config)
                .map(RetryConfig::current_retry_attempt)
                .unwrap_or_default();
            println!("gave up after {attempts} retries: {error}");
        }
    }
    Ok(())
}
