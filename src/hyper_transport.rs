//! Default transport on the hyper-util legacy client with rustls.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use http::{Request, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;
use url::Url;

use crate::Result;
use crate::body::{Body, ByteStream};
use crate::error::{BoxError, Error, TransportError, TransportErrorKind};
use crate::proxy::{Agent, AgentFactory, AgentKind, ProxyConnector};
use crate::tls::{ClientIdentity, build_rustls_tls_config};
use crate::transport::{Transport, TransportRequest, TransportResponse};
use crate::util::{classify_transport_error, io_error_code, redact_uri_for_logs};

pub(crate) type ReqBody = UnsyncBoxBody<Bytes, BoxError>;

type HttpsConnector = hyper_rustls::HttpsConnector<ProxyConnector>;
type HyperClient = Client<HttpsConnector, ReqBody>;

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

fn empty_req_body() -> ReqBody {
    Full::new(Bytes::new())
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

fn buffered_req_body(body: Bytes) -> ReqBody {
    Full::new(body)
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

fn req_body(body: Option<Body>) -> ReqBody {
    match body {
        None => empty_req_body(),
        Some(Body::Stream(stream)) => {
            let chunks = Body::Stream(stream)
                .into_stream()
                .map(|item| item.map(Frame::data));
            BodyExt::boxed_unsync(StreamBody::new(chunks))
        }
        Some(buffered) => buffered_req_body(buffered.as_bytes().unwrap_or_default()),
    }
}

/// Sends requests over a pooled hyper client, optionally through one proxy
/// and with a client identity.
///
/// When a request carries an [`Agent`], the agent's transport is used instead.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
}

impl fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new() -> Result<Self> {
        Self::build(None, None)
    }

    pub fn with_proxy(proxy: &Url, identity: Option<&ClientIdentity>) -> Result<Self> {
        let proxy_uri = proxy
            .as_str()
            .parse::<Uri>()
            .map_err(|_| Error::InvalidProxy {
                proxy: redact_uri_for_logs(proxy.as_str()),
            })?;
        Self::build(Some(proxy_uri), identity)
    }

    pub fn with_identity(identity: &ClientIdentity) -> Result<Self> {
        Self::build(None, Some(identity))
    }

    fn build(proxy: Option<Uri>, identity: Option<&ClientIdentity>) -> Result<Self> {
        let connector = ProxyConnector::new(proxy);
        let tls_config = build_rustls_tls_config(identity)?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self { client })
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let uri = request
            .url
            .as_str()
            .parse::<Uri>()
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
        let mut builder = Request::builder().method(request.method).uri(uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let http_request = builder
            .body(req_body(request.body))
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;

        debug!(uri = %redact_uri_for_logs(request.url.as_str()), "sending over hyper");
        let response = self.client.request(http_request).await.map_err(|error| {
            let kind = classify_transport_error(&error);
            let code = io_error_code(&error);
            let transport_error = TransportError::new(kind, error);
            match code {
                Some(code) => transport_error.with_code(code),
                None => transport_error,
            }
        })?;

        let (parts, incoming) = response.into_parts();
        let status_text = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
            .map(ToOwned::to_owned);
        let body = ByteStream::new(incoming.into_data_stream());
        let mut transport_response = TransportResponse::new(parts.status, parts.headers, body);
        transport_response.status_text = status_text;
        Ok(transport_response)
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        mut request: TransportRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        if let Some(agent) = request.agent.take() {
            let transport = Arc::clone(agent.transport());
            return Box::pin(async move { transport.send(request).await });
        }
        Box::pin(self.execute(request))
    }
}

/// Builds hyper transports for proxy and mutual-TLS agents.
#[derive(Clone, Copy, Debug, Default)]
pub struct HyperAgentFactory;

impl AgentFactory for HyperAgentFactory {
    fn proxy_agent(&self, proxy: &Url, identity: Option<&ClientIdentity>) -> Result<Agent> {
        let transport = HyperTransport::with_proxy(proxy, identity)?;
        Ok(Agent::new(
            AgentKind::Proxy {
                proxy: proxy.to_string(),
            },
            Arc::new(transport),
        ))
    }

    fn tls_agent(&self, identity: &ClientIdentity) -> Result<Agent> {
        let transport = HyperTransport::with_identity(identity)?;
        Ok(Agent::new(AgentKind::Tls, Arc::new(transport)))
    }
}
