use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use http::Method;
use reqflow::prelude::{Client, ErrorKind, RequestOptions, ResponseData, ResponseType, RetryConfig};
use reqflow::{EnvSource, StaticEnv};
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
}

impl MockResponse {
    fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into().into_bytes(),
            delay,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn json(status: u16, body: Value) -> Self {
        Self::new(
            status,
            vec![("Content-Type", "application/json")],
            body.to_string(),
            Duration::ZERO,
        )
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    target: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;

                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }

                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let target = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        target,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn client_with_env(env: StaticEnv) -> Client {
    let env: Arc<dyn EnvSource> = Arc::new(env);
    Client::builder().env(env).try_build().expect("client should build")
}

fn client() -> Client {
    client_with_env(StaticEnv::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_decodes_json_by_content_type() {
    let server = MockServer::start(vec![MockResponse::json(200, json!({"id": "42", "ok": true}))]);

    let response = client()
        .get(server.url("/items/42"))
        .await
        .expect("request should succeed");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.status_text(), "OK");
    let body: Value = response.json().expect("json body");
    assert_eq!(body, json!({"id": "42", "ok": true}));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].target, "/items/42");
}

#[derive(Serialize)]
struct NewItem<'a> {
    name: &'a str,
    tags: Vec<&'a str>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_sends_serialized_json_body() {
    let server = MockServer::start(vec![MockResponse::json(201, json!({"created": true}))]);

    let response = client()
        .request(
            RequestOptions::new()
                .url(server.url("/items"))
                .method(Method::POST)
                .json(&NewItem {
                    name: "widget",
                    tags: vec!["a", "b"],
                })
                .expect("payload serializes"),
        )
        .await
        .expect("request should succeed");
    assert_eq!(response.status().as_u16(), 201);

    let requests = server.requests();
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(
        request.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    let sent: Value = serde_json::from_slice(&request.body).expect("json request body");
    assert_eq!(sent, json!({"name": "widget", "tags": ["a", "b"]}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn base_url_and_params_build_the_request_target() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "text/plain")],
        "found",
        Duration::ZERO,
    )]);

    let client = Client::builder()
        .defaults(RequestOptions::new().base_url(server.url("/v1/")))
        .env(Arc::new(StaticEnv::new()))
        .build();
    let response = client
        .request(
            RequestOptions::new()
                .url("search?lang=en")
                .param("q", "rust http")
                .response_type(ResponseType::Text),
        )
        .await
        .expect("request should succeed");
    assert_eq!(response.text(), Some("found"));

    let requests = server.requests();
    assert_eq!(requests[0].target, "/v1/search?lang=en&q=rust+http");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_server_is_retried_over_the_wire() {
    let server = MockServer::start(vec![
        MockResponse::new(503, Vec::<(String, String)>::new(), "", Duration::ZERO),
        MockResponse::json(200, json!({"attempt": 2})),
    ]);

    let response = client()
        .request(
            RequestOptions::new().url(server.url("/flaky")).retry_config(
                RetryConfig::new()
                    .retry_delay(Duration::from_millis(5))
                    .retry_delay_multiplier(1.0),
            ),
        )
        .await
        .expect("second attempt succeeds");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(server.served_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_server_trips_the_request_timeout() {
    let server = MockServer::start(vec![
        MockResponse::json(200, json!({})).delayed(Duration::from_millis(600)),
    ]);

    let error = client()
        .request(
            RequestOptions::new()
                .url(server.url("/slow"))
                .timeout(Duration::from_millis(100)),
        )
        .await
        .expect_err("request should time out");

    assert_eq!(error.kind(), ErrorKind::Transport);
    assert_eq!(error.code().and_then(|code| code.as_name()), Some("TimeoutError"));
    assert!(error.to_string().contains("timeout"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_responses_hand_back_the_body() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "application/octet-stream")],
        "raw-bytes",
        Duration::ZERO,
    )]);

    let response = client()
        .request(
            RequestOptions::new()
                .url(server.url("/download"))
                .response_type(ResponseType::Stream),
        )
        .await
        .expect("request should succeed");
    let ResponseData::Stream(stream) = response.data() else {
        panic!("expected a stream body");
    };
    let bytes = stream.collect().await.expect("read body");
    assert_eq!(&bytes[..], b"raw-bytes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let address = listener.local_addr().expect("probe address");
    drop(listener);

    let error = client()
        .get(format!("http://{address}/"))
        .await
        .expect_err("nothing is listening");
    assert_eq!(error.kind(), ErrorKind::Transport);
    let request_error = error.as_request_error().expect("request error");
    assert!(request_error.response().is_none());
    assert!(request_error.code().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_targets_go_through_the_configured_proxy() {
    let proxy = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "text/plain")],
        "via proxy",
        Duration::ZERO,
    )]);

    let response = client()
        .request(
            RequestOptions::new()
                .url("http://upstream.invalid/resource?x=1")
                .proxy(proxy.base_url.clone()),
        )
        .await
        .expect("proxy answers");
    assert_eq!(response.text(), Some("via proxy"));

    let requests = proxy.requests();
    assert_eq!(requests[0].target, "http://upstream.invalid/resource?x=1");
    assert_eq!(
        requests[0].headers.get("host").map(String::as_str),
        Some("upstream.invalid")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn environment_proxy_respects_no_proxy() {
    let proxy = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "text/plain")],
        "via env proxy",
        Duration::ZERO,
    )]);
    let direct = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "text/plain")],
        "direct",
        Duration::ZERO,
    )]);

    let client = client_with_env(
        StaticEnv::new()
            .with("HTTP_PROXY", proxy.base_url.clone())
            .with("NO_PROXY", "127.0.0.1"),
    );

    let proxied = client
        .get("http://upstream.invalid/env")
        .await
        .expect("env proxy answers");
    assert_eq!(proxied.text(), Some("via env proxy"));

    let bypassed = client
        .get(direct.url("/local"))
        .await
        .expect("no_proxy host is dialed directly");
    assert_eq!(bypassed.text(), Some("direct"));
    assert_eq!(client.agents().len(), 1);
    assert_eq!(direct.requests()[0].target, "/local");
}
