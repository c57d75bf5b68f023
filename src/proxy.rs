//! Proxy routing decisions, environment lookup and the transport agent cache.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use http::Uri;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use regex::Regex;
use tower_service::Service;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::tls::ClientIdentity;
use crate::transport::Transport;
use crate::util::{lock_unpoisoned, redact_uri_for_logs, url_origin};

pub(crate) type BoxConnectError = Box<dyn StdError + Send + Sync>;

/// A request URL that matches any rule is sent directly.
#[derive(Clone, Debug)]
pub enum NoProxyRule {
    /// Tested against the full URL.
    Pattern(Regex),
    /// Matches by origin.
    Origin(Url),
    /// `*.host` or `.host` match a hostname suffix; anything else must equal
    /// the origin, the hostname or the full URL.
    Text(String),
}

impl NoProxyRule {
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            Self::Pattern(pattern) => pattern.is_match(url.as_str()),
            Self::Origin(rule) => url_origin(rule) == url_origin(url),
            Self::Text(rule) => {
                let hostname = url.host_str().unwrap_or_default();
                if let Some(suffix) = rule.strip_prefix("*.").or_else(|| rule.strip_prefix('.')) {
                    let suffix = suffix.to_ascii_lowercase();
                    return hostname == suffix || hostname.ends_with(&format!(".{suffix}"));
                }
                rule == &url_origin(url) || rule == hostname || rule == url.as_str()
            }
        }
    }
}

impl From<&str> for NoProxyRule {
    fn from(rule: &str) -> Self {
        Self::Text(rule.to_owned())
    }
}

impl From<String> for NoProxyRule {
    fn from(rule: String) -> Self {
        Self::Text(rule)
    }
}

impl From<Regex> for NoProxyRule {
    fn from(pattern: Regex) -> Self {
        Self::Pattern(pattern)
    }
}

impl From<Url> for NoProxyRule {
    fn from(url: Url) -> Self {
        Self::Origin(url)
    }
}

/// Whether `url` should skip the proxy. Rules from the comma-separated
/// `env_no_proxy` list supplement the configured ones.
pub fn should_bypass_proxy(url: &Url, rules: &[NoProxyRule], env_no_proxy: Option<&str>) -> bool {
    if rules.iter().any(|rule| rule.matches(url)) {
        return true;
    }
    env_no_proxy
        .into_iter()
        .flat_map(|list| list.split(','))
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .any(|rule| NoProxyRule::Text(rule.to_owned()).matches(url))
}

/// Environment lookup, injectable so proxy discovery can be tested without
/// touching process state.
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for StaticEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

fn first_var(env: &dyn EnvSource, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env.var(name))
        .find(|value| !value.trim().is_empty())
}

pub(crate) fn proxy_from_env(env: &dyn EnvSource) -> Option<String> {
    first_var(env, &["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"])
}

pub(crate) fn no_proxy_from_env(env: &dyn EnvSource) -> Option<String> {
    first_var(env, &["NO_PROXY", "no_proxy"])
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentKind {
    Proxy { proxy: String },
    Tls,
    Custom,
}

/// A network path for requests: a transport bound to a proxy and/or client
/// identity.
#[derive(Clone)]
pub struct Agent {
    kind: AgentKind,
    transport: Arc<dyn Transport>,
}

impl Agent {
    pub fn new(kind: AgentKind, transport: Arc<dyn Transport>) -> Self {
        Self { kind, transport }
    }

    pub fn custom(transport: Arc<dyn Transport>) -> Self {
        Self::new(AgentKind::Custom, transport)
    }

    pub fn kind(&self) -> &AgentKind {
        &self.kind
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn same_as(&self, other: &Agent) -> bool {
        Arc::ptr_eq(&self.transport, &other.transport)
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Agent")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Builds agents for the resolver. The client default creates hyper-based
/// transports.
pub trait AgentFactory: Send + Sync {
    fn proxy_agent(&self, proxy: &Url, identity: Option<&ClientIdentity>) -> Result<Agent, Error>;

    fn tls_agent(&self, identity: &ClientIdentity) -> Result<Agent, Error>;
}

/// Agents shared by every call made through one client. Entries are never
/// evicted.
#[derive(Default)]
pub struct AgentCache {
    agents: Mutex<HashMap<String, Agent>>,
}

impl fmt::Debug for AgentCache {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AgentCache")
            .field("len", &self.len())
            .finish()
    }
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Agent> {
        lock_unpoisoned(&self.agents).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.agents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached agent for `key`, building one on a miss. The build
    /// runs outside the lock; concurrent misses for one key keep the last
    /// agent inserted.
    pub fn get_or_try_insert(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<Agent, Error>,
    ) -> Result<Agent, Error> {
        if let Some(agent) = self.get(key) {
            return Ok(agent);
        }
        let agent = build()?;
        lock_unpoisoned(&self.agents).insert(key.to_owned(), agent.clone());
        Ok(agent)
    }
}

pub(crate) struct AgentResolution<'a> {
    pub(crate) url: &'a Url,
    pub(crate) proxy: Option<&'a str>,
    pub(crate) no_proxy: &'a [NoProxyRule],
    pub(crate) identity: Option<ClientIdentity>,
}

/// Picks the agent for a request: a proxy agent when a proxy applies to the
/// URL, otherwise a direct mutual-TLS agent when an identity is configured.
pub(crate) fn resolve_agent(
    resolution: AgentResolution<'_>,
    env: &dyn EnvSource,
    cache: &AgentCache,
    factory: &dyn AgentFactory,
) -> Result<Option<Agent>, Error> {
    let proxy = resolution
        .proxy
        .map(ToOwned::to_owned)
        .filter(|proxy| !proxy.trim().is_empty())
        .or_else(|| proxy_from_env(env));
    let env_no_proxy = no_proxy_from_env(env);

    if let Some(proxy) = proxy
        && !should_bypass_proxy(resolution.url, resolution.no_proxy, env_no_proxy.as_deref())
    {
        let proxy_url = Url::parse(proxy.trim()).map_err(|_| Error::InvalidProxy {
            proxy: redact_uri_for_logs(&proxy),
        })?;
        let agent = cache.get_or_try_insert(&proxy, || {
            debug!(proxy = %redact_uri_for_logs(&proxy), "creating proxy agent");
            factory.proxy_agent(&proxy_url, resolution.identity.as_ref())
        })?;
        return Ok(Some(agent));
    }

    if let Some(identity) = resolution.identity {
        let agent = cache.get_or_try_insert(identity.key_pem(), || {
            debug!("creating mutual tls agent");
            factory.tls_agent(&identity)
        })?;
        return Ok(Some(agent));
    }

    Ok(None)
}

#[derive(Clone)]
struct ProxyRoute {
    tunnel: Tunnel<HttpConnector>,
    proxy_uri: Uri,
}

#[derive(Debug)]
pub(crate) struct ProxyConnection<T> {
    inner: T,
    proxied: bool,
}

impl<T> ProxyConnection<T> {
    fn new(inner: T, proxied: bool) -> Self {
        Self { inner, proxied }
    }
}

impl<T> HyperRead for ProxyConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for ProxyConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_shutdown(cx)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.proxied)
    }
}

/// Connector that either dials the target directly or routes through one
/// proxy: `CONNECT` tunnels for https targets, absolute-form requests for
/// plain http.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    direct: HttpConnector,
    proxy: Option<ProxyRoute>,
}

impl ProxyConnector {
    pub(crate) fn new(proxy_uri: Option<Uri>) -> Self {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        let proxy = proxy_uri.map(|proxy_uri| ProxyRoute {
            tunnel: Tunnel::new(proxy_uri.clone(), direct.clone()),
            proxy_uri,
        });
        Self { direct, proxy }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyConnection<<HttpConnector as Service<Uri>>::Response>;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if let Some(proxy) = &mut self.proxy {
            return match proxy.tunnel.poll_ready(cx) {
                Poll::Ready(Ok(())) => self.direct.poll_ready(cx).map_err(|error| Box::new(error) as _),
                Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
                Poll::Pending => Poll::Pending,
            };
        }
        self.direct
            .poll_ready(cx)
            .map_err(|error| Box::new(error) as _)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let Some(proxy) = &mut self.proxy else {
            let connecting = self.direct.call(dst);
            return Box::pin(async move {
                connecting
                    .await
                    .map(|connection| ProxyConnection::new(connection, false))
                    .map_err(|error| Box::new(error) as _)
            });
        };

        if dst
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"))
        {
            let connecting = proxy.tunnel.call(normalize_tunnel_target_uri(dst));
            return Box::pin(async move {
                connecting
                    .await
                    .map(|connection| ProxyConnection::new(connection, false))
                    .map_err(|error| Box::new(error) as _)
            });
        }

        let connecting = self.direct.call(proxy.proxy_uri.clone());
        Box::pin(async move {
            connecting
                .await
                .map(|connection| ProxyConnection::new(connection, true))
                .map_err(|error| Box::new(error) as _)
        })
    }
}

fn normalize_tunnel_target_uri(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }
    let Some(host) = dst.host() else {
        return dst;
    };
    let authority_text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:443")
    } else {
        format!("{host}:443")
    };
    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}
