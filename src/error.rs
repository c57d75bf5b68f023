use std::fmt;

use http::{Method, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::body::ResponseData;
use crate::descriptor::RequestDescriptor;
use crate::response::Response;
use crate::retry::RetryConfig;
use crate::signal::AbortReason;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Failure reported by a [`Transport`](crate::Transport) before any response
/// was produced.
#[derive(Debug, Error)]
#[error("{kind} transport error: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    code: Option<String>,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            code: None,
            source: source.into(),
        }
    }

    /// Attaches a platform error code such as `ECONNRESET`.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.as_str())
    }
}

/// Coarse classification of every error the crate returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    Configuration,
    Interceptor,
    Transport,
    Status,
    SizeLimit,
    Decode,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Interceptor => "interceptor",
            Self::Transport => "transport",
            Self::Status => "status",
            Self::SizeLimit => "size_limit",
            Self::Decode => "decode",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Normalized error code.
///
/// Named codes come from the transport (`connect`, `ECONNRESET`, ...) or from
/// the abort reason (`AbortError`, `TimeoutError`). Numeric codes only appear when
/// the code was taken from a structured API error body.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Named(String),
    Numeric(i64),
}

impl ErrorCode {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Numeric(_) => None,
        }
    }

    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            Self::Named(_) => None,
            Self::Numeric(code) => Some(*code),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => formatter.write_str(name),
            Self::Numeric(code) => write!(formatter, "{code}"),
        }
    }
}

impl PartialEq<&str> for ErrorCode {
    fn eq(&self, other: &&str) -> bool {
        self.as_name() == Some(*other)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request url is required")]
    MissingUrl,
    #[error("invalid request url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("invalid http method {method}")]
    InvalidMethod { method: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("a request body is not allowed for {method} requests")]
    BodyNotAllowed { method: Method },
    #[error("invalid proxy url {proxy}")]
    InvalidProxy { proxy: String },
    #[error("failed to construct transport agent: {message}")]
    Agent { message: String },
    #[error("invalid tls configuration for backend {backend}: {message}")]
    TlsConfig {
        backend: &'static str,
        message: String,
    },
    #[error("{message}")]
    Interceptor { message: String },
    #[error(transparent)]
    Request(Box<RequestError>),
}

impl Error {
    /// Error raised from inside an interceptor handler.
    pub fn interceptor(message: impl Into<String>) -> Self {
        Self::Interceptor {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Interceptor { .. } => ErrorKind::Interceptor,
            Self::Request(error) => error.kind(),
            _ => ErrorKind::Configuration,
        }
    }

    pub fn as_request_error(&self) -> Option<&RequestError> {
        match self {
            Self::Request(error) => Some(error),
            _ => None,
        }
    }

    pub fn into_request_error(self) -> Option<RequestError> {
        match self {
            Self::Request(error) => Some(*error),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.as_request_error().and_then(RequestError::status)
    }

    pub fn code(&self) -> Option<&ErrorCode> {
        self.as_request_error().and_then(RequestError::code)
    }
}

impl From<RequestError> for Error {
    fn from(error: RequestError) -> Self {
        Self::Request(Box::new(error))
    }
}

/// The single error type raised once a request has been attempted.
///
/// `config` and `response` are snapshots owned by the error: mutating them never
/// reaches the options the caller passed in, and later attempts never reach them.
#[derive(Debug)]
pub struct RequestError {
    kind: ErrorKind,
    message: String,
    config: RequestDescriptor,
    response: Option<Response>,
    code: Option<ErrorCode>,
    status: Option<StatusCode>,
    api_error: Option<ApiErrorInfo>,
    source: Option<BoxError>,
}

impl RequestError {
    fn new(kind: ErrorKind, message: impl Into<String>, config: &RequestDescriptor) -> Self {
        Self {
            kind,
            message: message.into(),
            config: config.clone(),
            response: None,
            code: None,
            status: None,
            api_error: None,
            source: None,
        }
    }

    pub(crate) fn transport(config: &RequestDescriptor, error: TransportError) -> Self {
        let mut created = Self::new(ErrorKind::Transport, error.to_string(), config);
        created.code = Some(ErrorCode::Named(error.code().to_owned()));
        created.source = Some(Box::new(error));
        created
    }

    pub(crate) fn aborted(config: &RequestDescriptor, reason: AbortReason) -> Self {
        let message = match (reason, config.timeout()) {
            (AbortReason::Timeout, Some(timeout)) => {
                format!("request timeout: no response within {}ms", timeout.as_millis())
            }
            (AbortReason::Timeout, None) => "request timeout".to_owned(),
            (AbortReason::Aborted, _) => "request was aborted".to_owned(),
        };
        let mut created = Self::new(ErrorKind::Transport, message, config);
        created.code = Some(ErrorCode::Named(reason.as_str().to_owned()));
        created
    }

    pub(crate) fn status_failure(
        config: &RequestDescriptor,
        response: Response,
        info: ApiErrorInfo,
    ) -> Self {
        let mut created = Self::new(ErrorKind::Status, info.message.clone(), config);
        created.status = Some(response.status());
        created.code = Some(info.code.clone());
        created.response = Some(response);
        created.api_error = Some(info);
        created
    }

    pub(crate) fn size_limit(
        config: &RequestDescriptor,
        response: Option<Response>,
        limit_bytes: u64,
        actual_bytes: u64,
    ) -> Self {
        let message = format!(
            "response content length ({actual_bytes} bytes) is over the limit ({limit_bytes} bytes)"
        );
        let mut created = Self::new(ErrorKind::SizeLimit, message, config);
        if let Some(response) = response {
            created.status = Some(response.status());
            created.response = Some(response);
        }
        created
    }

    pub(crate) fn decode(
        config: &RequestDescriptor,
        response: Option<Response>,
        source: serde_json::Error,
    ) -> Self {
        let mut created = Self::new(
            ErrorKind::Decode,
            format!("failed to decode response body: {source}"),
            config,
        );
        created.code = Some(ErrorCode::Named("decode".to_owned()));
        created.source = Some(Box::new(source));
        if let Some(response) = response {
            created.status = Some(response.status());
            created.response = Some(response);
        }
        created
    }

    /// Wraps an error raised by an adapter override that is not already a
    /// request error.
    pub(crate) fn wrap(config: &RequestDescriptor, error: Error) -> Self {
        match error {
            Error::Request(error) => *error,
            other => {
                let mut created = Self::new(ErrorKind::Transport, other.to_string(), config);
                created.source = Some(Box::new(other));
                created
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn config(&self) -> &RequestDescriptor {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RequestDescriptor {
        &mut self.config
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    pub fn code(&self) -> Option<&ErrorCode> {
        self.code.as_ref()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn api_error(&self) -> Option<&ApiErrorInfo> {
        self.api_error.as_ref()
    }

    pub fn retry_config(&self) -> Option<&RetryConfig> {
        self.config.retry_config()
    }

    pub(crate) fn retry_config_mut(&mut self) -> Option<&mut RetryConfig> {
        self.config.retry_config_mut()
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.message)
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

/// Error details pulled out of a structured (`{"error": ...}`) response body.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiErrorInfo {
    pub message: String,
    pub code: ErrorCode,
    pub status: String,
    /// Remaining fields of the structured error object.
    pub details: Map<String, Value>,
}

/// Builds the message, code and status for a rejected response.
///
/// A non-empty text body is used verbatim as the message; an empty one keeps
/// `default_message`. Structured `{"error": ...}` bodies take precedence.
pub(crate) fn extract_api_error(response: &Response, default_message: &str) -> ApiErrorInfo {
    let status_code = ErrorCode::Numeric(i64::from(response.status().as_u16()));
    let status_text = response.status_text().to_owned();
    let mut message = default_message.to_owned();

    let json = match response.data() {
        ResponseData::Text(text) if !text.is_empty() => {
            message = text.clone();
            None
        }
        ResponseData::Json(Value::String(text)) => {
            message = text.clone();
            None
        }
        ResponseData::Json(value) => Some(value),
        _ => None,
    };

    let error = json
        .and_then(|value| value.get("error"))
        .filter(|error| is_truthy(error) && !response.status().is_success());
    let fallback = ApiErrorInfo {
        message: message.clone(),
        code: status_code.clone(),
        status: status_text.clone(),
        details: Map::new(),
    };
    let Some(error) = error else {
        return fallback;
    };

    match error {
        Value::String(text) => ApiErrorInfo {
            message: text.clone(),
            code: status_code,
            status: status_text,
            details: Map::new(),
        },
        Value::Object(fields) => {
            if let Some(Value::String(text)) = fields.get("message") {
                message = text.clone();
            }
            let status = match fields.get("status") {
                Some(Value::String(status)) => status.clone(),
                _ => status_text,
            };
            let code = match fields.get("code").and_then(Value::as_i64) {
                Some(code) => ErrorCode::Numeric(code),
                None => status_code,
            };
            if let Some(Value::Array(errors)) = fields.get("errors") {
                let joined = errors
                    .iter()
                    .filter_map(|item| item.get("message").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n");
                if !joined.is_empty() {
                    message = joined;
                }
            }
            let details = fields
                .iter()
                .filter(|(key, _)| !matches!(key.as_str(), "message" | "code" | "status"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            ApiErrorInfo {
                message,
                code,
                status,
                details,
            }
        }
        _ => fallback,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
