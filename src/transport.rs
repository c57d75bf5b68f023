use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use url::Url;

use crate::Result;
use crate::body::{Body, ByteStream, ResponseData};
use crate::descriptor::RequestDescriptor;
use crate::error::{BoxError, RequestError, TransportError, TransportErrorKind};
use crate::options::ResponseType;
use crate::proxy::Agent;
use crate::response::Response;
use crate::signal::AbortSignal;

/// Performs one HTTP exchange. Implementations may honor `request.agent`;
/// cancellation through `request.signal` is enforced by the caller.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest)
    -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}

/// Wire-level request: the descriptor minus everything that only matters to
/// the pipeline (convenience data, retry state, hooks).
#[derive(Debug)]
pub struct TransportRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    pub signal: AbortSignal,
    pub agent: Option<Agent>,
}

impl TransportRequest {
    pub(crate) fn from_descriptor(config: &RequestDescriptor) -> Self {
        Self {
            url: config.url().clone(),
            method: config.method().clone(),
            headers: config.headers().clone(),
            body: config.body().cloned(),
            signal: config.signal().clone(),
            agent: config.agent().cloned(),
        }
    }
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            status_text: None,
            headers,
            body,
        }
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = Some(status_text.into());
        self
    }
}

/// Full override of the transport step. Receives the default adapter so it
/// can wrap the normal behavior instead of replacing it.
pub trait Adapter: Send + Sync {
    fn execute(
        &self,
        config: RequestDescriptor,
        default: DefaultAdapter,
    ) -> BoxFuture<'static, Result<Response>>;
}

impl<F, Fut> Adapter for F
where
    F: Fn(RequestDescriptor, DefaultAdapter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn execute(
        &self,
        config: RequestDescriptor,
        default: DefaultAdapter,
    ) -> BoxFuture<'static, Result<Response>> {
        Box::pin(self(config, default))
    }
}

/// Sends through the transport and decodes the body per the declared
/// response type. Status validation is left to the caller.
#[derive(Clone)]
pub struct DefaultAdapter {
    transport: Arc<dyn Transport>,
}

enum ReadBodyError {
    Read(BoxError),
    TooLarge { actual_bytes: u64 },
    Decode { source: serde_json::Error, raw: Bytes },
}

impl DefaultAdapter {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn execute(&self, config: RequestDescriptor) -> Result<Response> {
        let transport = config
            .transport()
            .cloned()
            .unwrap_or_else(|| self.transport.clone());
        let signal = config.signal().clone();
        if let Some(reason) = signal.reason() {
            return Err(RequestError::aborted(&config, reason).into());
        }

        let request = TransportRequest::from_descriptor(&config);
        let sent = tokio::select! {
            biased;
            reason = signal.aborted() => return Err(RequestError::aborted(&config, reason).into()),
            sent = transport.send(request) => sent,
        };
        let TransportResponse {
            status,
            status_text,
            headers,
            body,
        } = sent.map_err(|error| RequestError::transport(&config, error))?;

        let limit = config.max_content_length();
        if let Some(limit) = limit
            && let Some(length) = content_length(&headers)
            && length > limit
        {
            let response = Response::new(
                status,
                status_text,
                headers,
                ResponseData::Empty,
                config.clone(),
            );
            return Err(RequestError::size_limit(&config, Some(response), limit, length).into());
        }

        let decoded = tokio::select! {
            biased;
            reason = signal.aborted() => return Err(RequestError::aborted(&config, reason).into()),
            decoded = decode_body(config.response_type(), &headers, body, limit) => decoded,
        };
        let data = match decoded {
            Ok(data) => data,
            Err(ReadBodyError::Read(source)) => {
                let error = TransportError::new(TransportErrorKind::Read, source);
                return Err(RequestError::transport(&config, error).into());
            }
            Err(ReadBodyError::TooLarge { actual_bytes }) => {
                let response = Response::new(
                    status,
                    status_text,
                    headers,
                    ResponseData::Empty,
                    config.clone(),
                );
                return Err(RequestError::size_limit(
                    &config,
                    Some(response),
                    limit.unwrap_or_default(),
                    actual_bytes,
                )
                .into());
            }
            Err(ReadBodyError::Decode { source, raw }) => {
                let response = Response::new(
                    status,
                    status_text,
                    headers,
                    ResponseData::Text(String::from_utf8_lossy(&raw).into_owned()),
                    config.clone(),
                );
                // Rejected statuses are reported by status validation.
                if !config.accepts_status(status) {
                    return Ok(response);
                }
                return Err(RequestError::decode(&config, Some(response), source).into());
            }
        };

        Ok(Response::new(status, status_text, headers, data, config))
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn read_body_limited(body: &ByteStream, max_bytes: Option<u64>) -> std::result::Result<Bytes, ReadBodyError> {
    let Some(mut stream) = body.take() else {
        return Ok(Bytes::new());
    };
    let mut collected = BytesMut::new();
    let mut total_len = 0_u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ReadBodyError::Read)?;
        total_len = total_len.saturating_add(chunk.len() as u64);
        if let Some(max_bytes) = max_bytes
            && total_len > max_bytes
        {
            return Err(ReadBodyError::TooLarge {
                actual_bytes: total_len,
            });
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(collected.freeze())
}

async fn decode_body(
    response_type: ResponseType,
    headers: &HeaderMap,
    body: ByteStream,
    max_bytes: Option<u64>,
) -> std::result::Result<ResponseData, ReadBodyError> {
    if response_type == ResponseType::Stream {
        return Ok(ResponseData::Stream(body));
    }
    let bytes = read_body_limited(&body, max_bytes).await?;
    let data = match response_type {
        ResponseType::Json if bytes.is_empty() => ResponseData::Empty,
        ResponseType::Json => match serde_json::from_slice(&bytes) {
            Ok(value) => ResponseData::Json(value),
            Err(source) => return Err(ReadBodyError::Decode { source, raw: bytes }),
        },
        ResponseType::ArrayBuffer | ResponseType::Blob => ResponseData::Bytes(bytes),
        ResponseType::Text => ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned()),
        ResponseType::Unknown | ResponseType::Stream => sniff_content_type(headers, bytes),
    };
    Ok(data)
}

/// No content type decodes as text, JSON types parse with a text fallback,
/// `text/*` is text and everything else stays binary.
fn sniff_content_type(headers: &HeaderMap, bytes: Bytes) -> ResponseData {
    let Some(content_type) = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned());
    };
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("application/json") {
        return match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => ResponseData::Json(value),
            Err(_) => ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned()),
        };
    }
    if content_type.starts_with("text/") {
        return ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned());
    }
    ResponseData::Bytes(bytes)
}
