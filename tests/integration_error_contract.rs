use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use reqflow::prelude::{
    Client, Data, Error, ErrorKind, RequestError, RequestOptions, ResponseData, ResponseType,
    RetryConfig,
};
use reqflow::{
    ByteStream, ErrorCode, REDACTED, StaticEnv, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use serde_json::{Value, json};

/// Answers every request with the same status, content type and body.
struct FixedTransport {
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
}

impl Transport for FixedTransport {
    fn send(
        &self,
        _request: TransportRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        headers.insert(
            "x-upstream-secret",
            HeaderValue::from_static("upstream-secret-value"),
        );
        let response = TransportResponse::new(
            self.status,
            headers,
            ByteStream::from_bytes(Bytes::from_static(self.body.as_bytes())),
        );
        Box::pin(async move { Ok(response) })
    }
}

fn client_answering(status: u16, content_type: &'static str, body: &'static str) -> Client {
    Client::builder()
        .transport(Arc::new(FixedTransport {
            status: StatusCode::from_u16(status).expect("valid status"),
            content_type,
            body,
        }))
        .env(Arc::new(StaticEnv::new()))
        .build()
}

fn secret_request() -> RequestOptions {
    RequestOptions::new()
        .url("https://oauth.example.com/token?token=abc123&keep=yes")
        .method(Method::POST)
        .header(AUTHORIZATION, HeaderValue::from_static("Bearer live-token"))
        .data(json!({"client_secret": "hunter2", "scope": "read"}))
}

fn request_error(error: Error) -> RequestError {
    error
        .into_request_error()
        .expect("pipeline failures carry a request error")
}

#[tokio::test]
async fn terminal_errors_are_redacted_without_touching_caller_options() {
    let client = client_answering(400, "application/json", r#"{"error":"invalid_grant"}"#);
    let options = secret_request();

    let error = request_error(
        client
            .request(options.clone())
            .await
            .expect_err("400 fails validation"),
    );

    let config = error.config();
    assert_eq!(
        config.headers().get(AUTHORIZATION).map(HeaderValue::as_bytes),
        Some(REDACTED.as_bytes())
    );
    let query: Vec<(String, String)> = config
        .url()
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    assert!(query.contains(&("token".to_owned(), REDACTED.to_owned())));
    assert!(query.contains(&("keep".to_owned(), "yes".to_owned())));
    match config.data() {
        Some(Data::Json(value)) => {
            assert_eq!(value["client_secret"], REDACTED);
            assert_eq!(value["scope"], "read");
        }
        other => panic!("expected json data, got {other:?}"),
    }

    let response = error.response().expect("status failures keep the response");
    assert_eq!(
        response
            .headers()
            .get("x-upstream-secret")
            .map(HeaderValue::as_bytes),
        Some(REDACTED.as_bytes())
    );

    assert_eq!(
        options.headers_ref().get(AUTHORIZATION),
        Some(&HeaderValue::from_static("Bearer live-token"))
    );
    assert_eq!(
        options.url_ref(),
        Some("https://oauth.example.com/token?token=abc123&keep=yes")
    );
    match options.data_ref() {
        Some(Data::Json(value)) => assert_eq!(value["client_secret"], "hunter2"),
        other => panic!("expected json data, got {other:?}"),
    }
}

#[tokio::test]
async fn disabled_redaction_keeps_credentials() {
    let client = client_answering(401, "text/plain", "denied");
    let error = request_error(
        client
            .request(secret_request().disable_error_redaction())
            .await
            .expect_err("401 fails validation"),
    );
    assert_eq!(
        error
            .config()
            .headers()
            .get(AUTHORIZATION)
            .map(HeaderValue::as_bytes),
        Some(&b"Bearer live-token"[..])
    );
    assert!(error.config().url().as_str().contains("token=abc123"));
}

#[tokio::test]
async fn custom_redactor_replaces_the_default() {
    let client = client_answering(500, "text/plain", "boom");
    let error = request_error(
        client
            .request(
                secret_request()
                    .error_redactor(|error: &mut RequestError| {
                        error.config_mut().headers_mut().clear();
                    }),
            )
            .await
            .expect_err("500 fails validation"),
    );
    assert!(error.config().headers().is_empty());
    assert!(error.config().url().as_str().contains("token=abc123"));
}

#[tokio::test]
async fn structured_api_errors_are_extracted() {
    let client = client_answering(
        403,
        "application/json",
        r#"{"error":{"code":403,"status":"PERMISSION_DENIED","message":"top","errors":[{"message":"first"},{"message":"second"}],"domain":"global"}}"#,
    );
    let error = client
        .get("https://api.example.com/v1/things")
        .await
        .expect_err("403 fails validation");

    assert_eq!(error.kind(), ErrorKind::Status);
    assert_eq!(error.status(), Some(StatusCode::FORBIDDEN));
    assert_eq!(error.code(), Some(&ErrorCode::Numeric(403)));
    assert_eq!(error.to_string(), "first\nsecond");

    let request_error = request_error(error);
    let info = request_error.api_error().expect("structured error body");
    assert_eq!(info.status, "PERMISSION_DENIED");
    assert_eq!(info.details.get("domain"), Some(&Value::from("global")));
    assert!(!info.details.contains_key("message"));
}

#[tokio::test]
async fn plain_text_failure_bodies_become_the_message() {
    let client = client_answering(502, "text/plain", "upstream unavailable");
    let error = client
        .get("https://api.example.com/")
        .await
        .expect_err("502 fails validation");
    assert_eq!(error.to_string(), "upstream unavailable");
    assert_eq!(error.code(), Some(&ErrorCode::Numeric(502)));
    let request_error = request_error(error);
    let response = request_error.response().expect("response snapshot");
    assert!(matches!(response.data(), ResponseData::Text(text) if text == "upstream unavailable"));
}

#[tokio::test]
async fn unparsable_rejected_bodies_still_fail_on_status() {
    let client = client_answering(503, "text/html", "<html>down</html>");
    let error = client
        .request(
            RequestOptions::new()
                .url("https://api.example.com/v1/things")
                .response_type(ResponseType::Json)
                .retry_config(
                    RetryConfig::new()
                        .retry(2)
                        .retry_delay(Duration::from_millis(1))
                        .retry_delay_multiplier(1.0),
                ),
        )
        .await
        .expect_err("503 fails validation");

    assert_eq!(error.kind(), ErrorKind::Status);
    assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(error.to_string(), "<html>down</html>");

    let request_error = request_error(error);
    let response = request_error.response().expect("status failures keep the response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(matches!(response.data(), ResponseData::Text(text) if text == "<html>down</html>"));
    assert_eq!(
        request_error
            .retry_config()
            .map(RetryConfig::current_retry_attempt),
        Some(2)
    );
}

#[tokio::test]
async fn unparsable_accepted_bodies_report_decode_with_the_response() {
    let client = client_answering(200, "application/json", "{truncated");
    let error = client
        .request(
            RequestOptions::new()
                .url("https://api.example.com/v1/things")
                .response_type(ResponseType::Json)
                .retry(true),
        )
        .await
        .expect_err("body is not json");

    assert_eq!(error.kind(), ErrorKind::Decode);
    assert_eq!(error.status(), Some(StatusCode::OK));

    let request_error = request_error(error);
    let response = request_error.response().expect("decode failures keep the response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(CONTENT_TYPE));
    assert!(matches!(response.data(), ResponseData::Text(text) if text == "{truncated"));
    assert_eq!(
        request_error
            .retry_config()
            .map(RetryConfig::current_retry_attempt),
        Some(0)
    );
}

#[tokio::test]
async fn oversized_responses_report_a_size_limit_error() {
    let client = client_answering(200, "text/plain", "0123456789abcdef");
    let error = client
        .request(
            RequestOptions::new()
                .url("https://api.example.com/large")
                .max_content_length(4)
                .retry(true),
        )
        .await
        .expect_err("body exceeds the limit");
    assert_eq!(error.kind(), ErrorKind::SizeLimit);
    assert!(error.to_string().contains("over the limit"));
}

#[tokio::test]
async fn configuration_errors_are_returned_before_sending() {
    let client = client_answering(200, "text/plain", "ok");
    let error = client
        .request(RequestOptions::new())
        .await
        .expect_err("no url");
    assert_eq!(error.kind(), ErrorKind::Configuration);
    assert!(matches!(error, Error::MissingUrl));
    assert!(error.as_request_error().is_none());
}
