use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::body::{Data, FormParams};
use crate::error::Error;
use crate::headers::merge_into;
use crate::multipart::MultipartPart;
use crate::proxy::{Agent, NoProxyRule};
use crate::redact::{ErrorRedaction, ErrorRedactor};
use crate::retry::RetryConfig;
use crate::transport::{Adapter, Transport};
use crate::util::{parse_header_name, parse_header_value};

/// How the response body is decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResponseType {
    /// Hand back the unconsumed body stream.
    Stream,
    Json,
    ArrayBuffer,
    Blob,
    Text,
    /// Decide from the response `Content-Type`.
    #[default]
    Unknown,
}

impl ResponseType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Json => "json",
            Self::ArrayBuffer => "arraybuffer",
            Self::Blob => "blob",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }
}

/// Status acceptance predicate. Defaults to `200..=299`.
#[derive(Clone)]
pub struct ValidateStatus(Arc<dyn Fn(StatusCode) -> bool + Send + Sync>);

impl ValidateStatus {
    pub fn new(predicate: impl Fn(StatusCode) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn accepts(&self, status: StatusCode) -> bool {
        (self.0)(status)
    }
}

impl Default for ValidateStatus {
    fn default() -> Self {
        Self::new(|status| (200..300).contains(&status.as_u16()))
    }
}

impl fmt::Debug for ValidateStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("ValidateStatus(..)")
    }
}

/// Custom query serializer. Its output is appended to the URL as-is, and it is
/// also used for form-encoded object bodies.
#[derive(Clone)]
pub struct ParamsSerializer(Arc<dyn Fn(&FormParams) -> String + Send + Sync>);

impl ParamsSerializer {
    pub fn new(serializer: impl Fn(&FormParams) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(serializer))
    }

    pub fn serialize(&self, params: &FormParams) -> String {
        (self.0)(params)
    }
}

impl fmt::Debug for ParamsSerializer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("ParamsSerializer(..)")
    }
}

/// Caller-facing options bag.
///
/// Every field is optional so instance defaults and call-site options can be
/// merged field by field; see [`RequestOptions::merge`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub(crate) url: Option<String>,
    pub(crate) base_url: Option<String>,
    pub(crate) method: Option<Method>,
    pub(crate) headers: HeaderMap,
    pub(crate) data: Option<Data>,
    pub(crate) params: Option<FormParams>,
    pub(crate) params_serializer: Option<ParamsSerializer>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) signal: Option<CancellationToken>,
    pub(crate) response_type: Option<ResponseType>,
    pub(crate) validate_status: Option<ValidateStatus>,
    pub(crate) max_content_length: Option<u64>,
    pub(crate) proxy: Option<String>,
    pub(crate) no_proxy: Option<Vec<NoProxyRule>>,
    pub(crate) cert: Option<String>,
    pub(crate) key: Option<String>,
    pub(crate) agent: Option<Agent>,
    pub(crate) multipart: Option<Vec<MultipartPart>>,
    pub(crate) retry: Option<bool>,
    pub(crate) retry_config: Option<RetryConfig>,
    pub(crate) error_redactor: Option<ErrorRedaction>,
    pub(crate) adapter: Option<Arc<dyn Adapter>>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) allow_body_with_safe_method: Option<bool>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RequestOptions")
            .field("url", &self.url)
            .field("base_url", &self.base_url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("response_type", &self.response_type)
            .field("max_content_length", &self.max_content_length)
            .field("proxy", &self.proxy)
            .field("no_proxy", &self.no_proxy)
            .field("agent", &self.agent)
            .field("multipart", &self.multipart)
            .field("retry", &self.retry)
            .field("retry_config", &self.retry_config)
            .field("adapter", &self.adapter.is_some())
            .field("transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets a header, replacing any value already set on these options.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Merges `headers` into the headers already set, with the usual
    /// `set-cookie` accumulation.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        merge_into(&mut self.headers, headers);
        self
    }

    pub fn data(mut self, data: impl Into<Data>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Sets the body to `payload` as a JSON value. The content type is
    /// resolved when the request is prepared.
    pub fn json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value =
            serde_json::to_value(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self.data(Data::Json(value)))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(payload).map_err(|source| Error::SerializeQuery { source })?;
        Ok(self.data(Data::Form(FormParams::parse(&encoded))))
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .get_or_insert_with(FormParams::new)
            .append(name, value);
        self
    }

    pub fn params(mut self, params: FormParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(params).map_err(|source| Error::SerializeQuery { source })?;
        let target = self.params.get_or_insert_with(FormParams::new);
        for (name, value) in FormParams::parse(&encoded).iter() {
            target.append(name, value);
        }
        Ok(self)
    }

    pub fn params_serializer(
        mut self,
        serializer: impl Fn(&FormParams) -> String + Send + Sync + 'static,
    ) -> Self {
        self.params_serializer = Some(ParamsSerializer::new(serializer));
        self
    }

    /// Per-attempt timeout. Zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    pub fn validate_status(
        mut self,
        predicate: impl Fn(StatusCode) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.validate_status = Some(ValidateStatus::new(predicate));
        self
    }

    pub fn max_content_length(mut self, max_bytes: u64) -> Self {
        self.max_content_length = Some(max_bytes);
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn no_proxy<I, R>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<NoProxyRule>,
    {
        self.no_proxy = Some(rules.into_iter().map(Into::into).collect());
        self
    }

    /// PEM certificate chain and private key for mutual TLS.
    pub fn client_identity(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.cert = Some(cert_pem.into());
        self.key = Some(key_pem.into());
        self
    }

    pub fn agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn multipart(mut self, parts: impl IntoIterator<Item = MultipartPart>) -> Self {
        self.multipart = Some(parts.into_iter().collect());
        self
    }

    /// Enables retries with the default policy when no retry config is set.
    pub fn retry(mut self, enabled: bool) -> Self {
        self.retry = Some(enabled);
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    pub fn error_redactor(mut self, redactor: impl ErrorRedactor + 'static) -> Self {
        self.error_redactor = Some(ErrorRedaction::Custom(Arc::new(redactor)));
        self
    }

    pub fn disable_error_redaction(mut self) -> Self {
        self.error_redactor = Some(ErrorRedaction::Disabled);
        self
    }

    pub fn adapter(mut self, adapter: impl Adapter + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    /// Sends this request through `transport` instead of the client transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn allow_body_with_safe_method(mut self, allow: bool) -> Self {
        self.allow_body_with_safe_method = Some(allow);
        self
    }

    pub fn url_ref(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn headers_ref(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn data_ref(&self) -> Option<&Data> {
        self.data.as_ref()
    }

    /// Returns `self` with every field set on `overrides` taking precedence.
    ///
    /// Headers go through the header merge, params and retry configs merge
    /// key by key, and lists such as `no_proxy` or `multipart` are replaced
    /// wholesale.
    pub fn merge(&self, overrides: &RequestOptions) -> RequestOptions {
        let mut headers = self.headers.clone();
        merge_into(&mut headers, overrides.headers.clone());

        let params = match (&self.params, &overrides.params) {
            (Some(base), Some(update)) => {
                let mut merged: FormParams = base
                    .iter()
                    .filter(|(name, _)| !update.contains(name))
                    .collect();
                for (name, value) in update.iter() {
                    merged.append(name, value);
                }
                Some(merged)
            }
            (base, update) => update.clone().or_else(|| base.clone()),
        };

        let retry_config = match (&self.retry_config, &overrides.retry_config) {
            (Some(base), Some(update)) => Some(base.merge(update)),
            (base, update) => update.clone().or_else(|| base.clone()),
        };

        RequestOptions {
            url: overrides.url.clone().or_else(|| self.url.clone()),
            base_url: overrides.base_url.clone().or_else(|| self.base_url.clone()),
            method: overrides.method.clone().or_else(|| self.method.clone()),
            headers,
            data: overrides.data.clone().or_else(|| self.data.clone()),
            params,
            params_serializer: overrides
                .params_serializer
                .clone()
                .or_else(|| self.params_serializer.clone()),
            timeout: overrides.timeout.or(self.timeout),
            signal: overrides.signal.clone().or_else(|| self.signal.clone()),
            response_type: overrides.response_type.or(self.response_type),
            validate_status: overrides
                .validate_status
                .clone()
                .or_else(|| self.validate_status.clone()),
            max_content_length: overrides.max_content_length.or(self.max_content_length),
            proxy: overrides.proxy.clone().or_else(|| self.proxy.clone()),
            no_proxy: overrides.no_proxy.clone().or_else(|| self.no_proxy.clone()),
            cert: overrides.cert.clone().or_else(|| self.cert.clone()),
            key: overrides.key.clone().or_else(|| self.key.clone()),
            agent: overrides.agent.clone().or_else(|| self.agent.clone()),
            multipart: overrides.multipart.clone().or_else(|| self.multipart.clone()),
            retry: overrides.retry.or(self.retry),
            retry_config,
            error_redactor: overrides
                .error_redactor
                .clone()
                .or_else(|| self.error_redactor.clone()),
            adapter: overrides.adapter.clone().or_else(|| self.adapter.clone()),
            transport: overrides.transport.clone().or_else(|| self.transport.clone()),
            allow_body_with_safe_method: overrides
                .allow_body_with_safe_method
                .or(self.allow_body_with_safe_method),
        }
    }
}

/// First argument of [`Client::fetch`](crate::Client::fetch).
#[derive(Clone, Debug)]
pub enum RequestInput {
    Url(String),
    Parsed(Url),
    Request(RequestOptions),
}

impl From<&str> for RequestInput {
    fn from(url: &str) -> Self {
        Self::Url(url.to_owned())
    }
}

impl From<String> for RequestInput {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<Url> for RequestInput {
    fn from(url: Url) -> Self {
        Self::Parsed(url)
    }
}

impl From<RequestOptions> for RequestInput {
    fn from(options: RequestOptions) -> Self {
        Self::Request(options)
    }
}

impl RequestInput {
    /// Normalizes a fetch-style call into one options bag.
    ///
    /// Headers of `input` are applied before those of `init`; every other
    /// option set on a request-like `input` wins over `init`.
    pub fn into_options(self, init: Option<RequestOptions>) -> RequestOptions {
        let init = init.unwrap_or_default();
        match self {
            Self::Url(url) => init.url(url),
            Self::Parsed(url) => init.url(url.to_string()),
            Self::Request(request) => {
                let mut headers = request.headers.clone();
                merge_into(&mut headers, init.headers.clone());
                let mut merged = init.merge(&request);
                merged.headers = headers;
                merged
            }
        }
    }
}
