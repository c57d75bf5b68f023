use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use http::Method;
use serde_json::Value;
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::body::{Body, ByteStream, ResponseData};
use crate::descriptor::{PrepareContext, RequestDescriptor, prepare};
use crate::error::{ErrorKind, RequestError, extract_api_error};
use crate::hyper_transport::{HyperAgentFactory, HyperTransport};
use crate::interceptor::Interceptors;
use crate::options::{RequestInput, RequestOptions, ResponseType};
use crate::proxy::{AgentCache, AgentFactory, EnvSource, ProcessEnv};
use crate::response::Response;
use crate::retry::should_retry_request;
use crate::transport::{DefaultAdapter, Transport};
use crate::util::redact_uri_for_logs;

pub struct ClientBuilder {
    defaults: RequestOptions,
    transport: Option<Arc<dyn Transport>>,
    agent_factory: Option<Arc<dyn AgentFactory>>,
    env: Option<Arc<dyn EnvSource>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            defaults: RequestOptions::new(),
            transport: None,
            agent_factory: None,
            env: None,
        }
    }

    /// Options every request starts from; call-site options override them
    /// field by field.
    pub fn defaults(mut self, defaults: RequestOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn agent_factory(mut self, agent_factory: Arc<dyn AgentFactory>) -> Self {
        self.agent_factory = Some(agent_factory);
        self
    }

    /// Source of `HTTPS_PROXY`/`NO_PROXY` style variables. Defaults to the
    /// process environment.
    pub fn env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn try_build(self) -> Result<Client> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };
        Ok(Client {
            defaults: self.defaults,
            interceptors: Arc::new(Interceptors::default()),
            agents: Arc::new(AgentCache::new()),
            transport,
            agent_factory: self
                .agent_factory
                .unwrap_or_else(|| Arc::new(HyperAgentFactory)),
            env: self.env.unwrap_or_else(|| Arc::new(ProcessEnv)),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqflow client: {error}; use try_build() to handle configuration errors")
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Request pipeline: options are prepared into a descriptor, passed through
/// the request interceptors, sent (and retried) through the adapter, and the
/// outcome is passed through the response interceptors.
///
/// Clones share interceptors and the agent cache.
#[derive(Clone)]
pub struct Client {
    defaults: RequestOptions,
    interceptors: Arc<Interceptors>,
    agents: Arc<AgentCache>,
    transport: Arc<dyn Transport>,
    agent_factory: Arc<dyn AgentFactory>,
    env: Arc<dyn EnvSource>,
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("defaults", &self.defaults)
            .field("interceptors", &self.interceptors)
            .field("agents", &self.agents)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    #[track_caller]
    pub fn new() -> Self {
        ClientBuilder::new().build()
    }

    pub fn defaults(&self) -> &RequestOptions {
        &self.defaults
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    pub fn agents(&self) -> &AgentCache {
        &self.agents
    }

    pub async fn get(&self, url: impl Into<String>) -> Result<Response> {
        self.request(RequestOptions::new().url(url).method(Method::GET))
            .await
    }

    /// Fetch-style entry point; see [`RequestInput::into_options`] for how
    /// `input` and `init` combine.
    pub async fn fetch(
        &self,
        input: impl Into<RequestInput>,
        init: Option<RequestOptions>,
    ) -> Result<Response> {
        self.request(input.into().into_options(init)).await
    }

    pub async fn request(&self, options: RequestOptions) -> Result<Response> {
        let descriptor = self.prepare(&options)?;
        let descriptor = self.interceptors.request.run(Ok(descriptor)).await?;
        let outcome = self.execute_with_retries(descriptor).await;
        self.interceptors.response.run(outcome).await
    }

    fn prepare(&self, options: &RequestOptions) -> Result<RequestDescriptor> {
        let context = PrepareContext {
            env: self.env.as_ref(),
            agents: &self.agents,
            agent_factory: self.agent_factory.as_ref(),
        };
        prepare(&self.defaults, options, &context)
    }

    async fn execute_with_retries(&self, mut config: RequestDescriptor) -> Result<Response> {
        if let Some(retry_config) = config.retry_config_mut() {
            retry_config.mark_first_request(Instant::now());
        }

        loop {
            let attempt = config
                .retry_config()
                .map_or(0, |retry_config| retry_config.current_retry_attempt())
                + 1;
            let span = info_span!(
                "reqflow.request",
                method = %config.method(),
                uri = %redact_uri_for_logs(config.url().as_str()),
                attempt = attempt
            );
            let outcome = self.attempt(config.clone()).instrument(span.clone()).await;
            let mut error = match outcome {
                Ok(response) => {
                    span.in_scope(|| debug!(status = response.status().as_u16(), "request completed"));
                    return Ok(response);
                }
                Err(error) => error,
            };

            let eligible = match error.retry_config() {
                Some(_) if error.kind() == ErrorKind::SizeLimit => false,
                Some(_) if !config.body().is_none_or(Body::is_replayable) => {
                    span.in_scope(|| debug!("request body was consumed and cannot be resent"));
                    false
                }
                Some(retry_config) => should_retry_request(retry_config, &error).await,
                None => false,
            };
            let retry_config = match error.retry_config().cloned() {
                Some(retry_config) if eligible => retry_config,
                _ => {
                    span.in_scope(|| debug!(error = %error, "request failed"));
                    config.error_redaction().apply(&mut error);
                    return Err(error.into());
                }
            };

            let elapsed = retry_config
                .time_of_first_request()
                .map(|started| started.elapsed())
                .unwrap_or_default();
            let delay = retry_config.next_retry_delay(elapsed);
            let next_attempt = retry_config.current_retry_attempt() + 1;
            if let Some(snapshot) = error.retry_config_mut() {
                snapshot.set_current_retry_attempt(next_attempt);
            }
            if let Some(current) = config.retry_config_mut() {
                current.set_current_retry_attempt(next_attempt);
            }

            if let Some(hook) = retry_config.on_retry_attempt_hook() {
                hook.on_retry_attempt(&error, &mut config).await;
            }
            span.in_scope(|| {
                warn!(
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying request"
                );
            });
            match retry_config.retry_backoff_hook() {
                Some(backoff) => backoff.backoff(&error, delay).await,
                None if !delay.is_zero() => tokio::time::sleep(delay).await,
                None => {}
            }
            config.rederive_signal();
        }
    }

    /// One attempt through the adapter, with status validation.
    async fn attempt(&self, config: RequestDescriptor) -> Result<Response, RequestError> {
        debug!("sending request");
        let default = DefaultAdapter::new(Arc::clone(&self.transport));
        let outcome = match config.adapter().cloned() {
            Some(adapter) => adapter.execute(config.clone(), default).await,
            None => default.execute(config.clone()).await,
        };
        let response = outcome.map_err(|error| RequestError::wrap(&config, error))?;

        let status = response.status();
        if config.accepts_status(status) {
            return Ok(response);
        }

        let response = buffer_failed_response(response, config.response_type()).await;
        let default_message = format!("Request failed with status code {}", status.as_u16());
        let info = extract_api_error(&response, &default_message);
        Err(RequestError::status_failure(&config, response, info))
    }
}

impl Default for Client {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

/// Makes a failed response inspectable: stream bodies are drained into
/// chunks, and binary or text bodies that hold JSON are parsed when the
/// declared type expects it.
async fn buffer_failed_response(mut response: Response, response_type: ResponseType) -> Response {
    let stream = match response.data() {
        ResponseData::Stream(stream) => Some(stream.clone()),
        _ => None,
    };
    if let Some(stream) = stream {
        *response.data_mut() = ResponseData::Chunks(drain_chunks(&stream).await);
    }

    let translated = match (response_type, response.data()) {
        (ResponseType::Json, ResponseData::Text(text)) => serde_json::from_str::<Value>(text).ok(),
        (ResponseType::ArrayBuffer | ResponseType::Blob, ResponseData::Bytes(bytes)) => {
            serde_json::from_slice::<Value>(bytes).ok()
        }
        _ => None,
    };
    if let Some(value) = translated {
        *response.data_mut() = ResponseData::Json(value);
    }
    response
}

async fn drain_chunks(stream: &ByteStream) -> Vec<Bytes> {
    let Some(mut chunks) = stream.take() else {
        return Vec::new();
    };
    let mut drained = Vec::new();
    while let Some(Ok(chunk)) = chunks.next().await {
        drained.push(chunk);
    }
    drained
}
