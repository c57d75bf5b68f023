//! Normalization of caller options into the canonical per-attempt descriptor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::body::{Body, Data, FormParams};
use crate::error::Error;
use crate::multipart::{
    buffered_multipart_body, content_type_for_boundary, generate_boundary, multipart_body,
};
use crate::options::{RequestOptions, ResponseType, ValidateStatus};
use crate::proxy::{Agent, AgentCache, AgentFactory, AgentResolution, EnvSource, resolve_agent};
use crate::redact::ErrorRedaction;
use crate::retry::RetryConfig;
use crate::signal::AbortSignal;
use crate::tls::ClientIdentity;
use crate::transport::{Adapter, Transport};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Fully resolved configuration of one attempt.
///
/// Built once per logical call and cloned before every attempt, so changes an
/// attempt's interceptors or hooks make never reach an earlier error snapshot.
/// Streaming bodies are the exception: clones share the one underlying stream.
#[derive(Clone)]
pub struct RequestDescriptor {
    url: Url,
    method: Method,
    headers: HeaderMap,
    data: Option<Data>,
    body: Option<Body>,
    response_type: ResponseType,
    validate_status: ValidateStatus,
    max_content_length: Option<u64>,
    timeout: Option<Duration>,
    user_signal: Option<CancellationToken>,
    signal: AbortSignal,
    agent: Option<Agent>,
    retry_config: Option<RetryConfig>,
    error_redactor: ErrorRedaction,
    adapter: Option<Arc<dyn Adapter>>,
    transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RequestDescriptor")
            .field("url", &self.url.as_str())
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("body", &self.body)
            .field("response_type", &self.response_type)
            .field("max_content_length", &self.max_content_length)
            .field("timeout", &self.timeout)
            .field("agent", &self.agent)
            .field("retry_config", &self.retry_config)
            .field("error_redactor", &self.error_redactor)
            .finish_non_exhaustive()
    }
}

impl RequestDescriptor {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The caller's data before serialization. Never sent on the wire.
    pub fn data(&self) -> Option<&Data> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut Data> {
        self.data.as_mut()
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut Body> {
        self.body.as_mut()
    }

    pub fn set_body(&mut self, body: Option<Body>) {
        self.body = body;
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn accepts_status(&self, status: StatusCode) -> bool {
        self.validate_status.accepts(status)
    }

    pub fn max_content_length(&self) -> Option<u64> {
        self.max_content_length
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Takes effect from the next signal derivation, i.e. the next attempt.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    pub fn retry_config(&self) -> Option<&RetryConfig> {
        self.retry_config.as_ref()
    }

    pub fn retry_config_mut(&mut self) -> Option<&mut RetryConfig> {
        self.retry_config.as_mut()
    }

    pub fn error_redaction(&self) -> &ErrorRedaction {
        &self.error_redactor
    }

    pub fn adapter(&self) -> Option<&Arc<dyn Adapter>> {
        self.adapter.as_ref()
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    /// Replaces the signal with a fresh one built from the user token and the
    /// current timeout.
    pub(crate) fn rederive_signal(&mut self) {
        self.signal = AbortSignal::derive(self.user_signal.as_ref(), self.timeout);
    }
}

/// Collaborators the builder needs to resolve agents.
pub(crate) struct PrepareContext<'a> {
    pub(crate) env: &'a dyn EnvSource,
    pub(crate) agents: &'a AgentCache,
    pub(crate) agent_factory: &'a dyn AgentFactory,
}

/// Merges `options` over `defaults` and resolves the result into a
/// descriptor. Fails before any network activity when no URL can be
/// resolved.
pub(crate) fn prepare(
    defaults: &RequestOptions,
    options: &RequestOptions,
    context: &PrepareContext<'_>,
) -> Result<RequestDescriptor> {
    let merged = defaults.merge(options);
    let method = merged.method.clone().unwrap_or(Method::GET);
    let mut headers = merged.headers.clone();

    let mut url = resolve_url(&merged)?;
    if let Some(params) = merged.params.as_ref().filter(|params| !params.is_empty()) {
        url = append_params(url, params, &merged)?;
    }

    let body = resolve_body(&merged, &mut headers)?;
    if body.is_some()
        && matches!(method, Method::GET | Method::HEAD)
        && !merged.allow_body_with_safe_method.unwrap_or(false)
    {
        return Err(Error::BodyNotAllowed { method });
    }

    let response_type = merged.response_type.unwrap_or_default();
    if response_type == ResponseType::Json && !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    }

    let agent = match merged.agent.clone() {
        Some(agent) => Some(agent),
        None => {
            let identity = match (&merged.cert, &merged.key) {
                (Some(cert), Some(key)) => Some(ClientIdentity::new(cert.clone(), key.clone())),
                _ => None,
            };
            resolve_agent(
                AgentResolution {
                    url: &url,
                    proxy: merged.proxy.as_deref(),
                    no_proxy: merged.no_proxy.as_deref().unwrap_or_default(),
                    identity,
                },
                context.env,
                context.agents,
                context.agent_factory,
            )?
        }
    };

    let retry_config = match (merged.retry_config.clone(), merged.retry) {
        (Some(config), _) => Some(config.materialized()),
        (None, Some(true)) => Some(RetryConfig::new().materialized()),
        (None, _) => None,
    };

    let signal = AbortSignal::derive(merged.signal.as_ref(), merged.timeout);

    Ok(RequestDescriptor {
        url,
        method,
        headers,
        data: merged.data.clone(),
        body,
        response_type,
        validate_status: merged.validate_status.clone().unwrap_or_default(),
        max_content_length: merged.max_content_length,
        timeout: merged.timeout,
        user_signal: merged.signal.clone(),
        signal,
        agent,
        retry_config,
        error_redactor: merged.error_redactor.clone().unwrap_or_default(),
        adapter: merged.adapter.clone(),
        transport: merged.transport.clone(),
    })
}

fn invalid_url(url: &str, source: url::ParseError) -> Error {
    Error::InvalidUrl {
        url: url.to_owned(),
        source,
    }
}

fn resolve_url(options: &RequestOptions) -> Result<Url> {
    let target = options
        .url
        .as_deref()
        .filter(|url| !url.is_empty())
        .ok_or(Error::MissingUrl)?;
    match options.base_url.as_deref().filter(|base| !base.is_empty()) {
        Some(base_url) => {
            let base = Url::parse(base_url).map_err(|source| invalid_url(base_url, source))?;
            base.join(target).map_err(|source| invalid_url(target, source))
        }
        None => Url::parse(target).map_err(|source| invalid_url(target, source)),
    }
}

/// Custom serializer output is concatenated onto the URL; otherwise pairs are
/// appended, keeping duplicates and any query already present.
fn append_params(mut url: Url, params: &FormParams, options: &RequestOptions) -> Result<Url> {
    match &options.params_serializer {
        Some(serializer) => {
            let serialized = serializer.serialize(params);
            let serialized = serialized.strip_prefix('?').unwrap_or(&serialized);
            let prefix = if url.as_str().contains('?') { '&' } else { '?' };
            let joined = format!("{url}{prefix}{serialized}");
            Url::parse(&joined).map_err(|source| invalid_url(&joined, source))
        }
        None => {
            url.query_pairs_mut()
                .extend_pairs(params.iter());
            Ok(url)
        }
    }
}

fn content_type_is(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case(expected))
}

fn set_content_type_if_missing(headers: &mut HeaderMap, content_type: &'static str) {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
}

fn resolve_body(options: &RequestOptions, headers: &mut HeaderMap) -> Result<Option<Body>> {
    if let Some(parts) = options.multipart.clone().filter(|parts| !parts.is_empty()) {
        let boundary = generate_boundary();
        let content_type = content_type_for_boundary(&boundary);
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&content_type).map_err(|source| Error::InvalidHeaderValue {
                name: CONTENT_TYPE.as_str().to_owned(),
                source,
            })?,
        );
        let body = match buffered_multipart_body(&parts, &boundary) {
            Some(bytes) => Body::Bytes(bytes),
            None => Body::Stream(multipart_body(parts, &boundary)),
        };
        return Ok(Some(body));
    }

    let Some(data) = options.data.clone() else {
        return Ok(None);
    };
    let body = match data {
        Data::Text(text) => {
            set_content_type_if_missing(headers, "text/plain;charset=UTF-8");
            Body::Text(text)
        }
        Data::Bytes(bytes) => Body::Bytes(bytes),
        Data::Stream(stream) => Body::Stream(stream),
        Data::Form(params) => {
            set_content_type_if_missing(headers, "application/x-www-form-urlencoded;charset=UTF-8");
            Body::Form(params)
        }
        Data::Json(value) if content_type_is(headers, FORM_URLENCODED) => {
            let params = FormParams::from_json(&value);
            match &options.params_serializer {
                Some(serializer) => Body::Text(serializer.serialize(&params)),
                None => Body::Form(params),
            }
        }
        Data::Json(value) => {
            set_content_type_if_missing(headers, "application/json");
            Body::Text(
                serde_json::to_string(&value).map_err(|source| Error::SerializeJson { source })?,
            )
        }
    };
    Ok(Some(body))
}
