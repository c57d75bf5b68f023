//! `reqflow` is an interceptable HTTP request pipeline: caller options are
//! normalized into a request descriptor, passed through request interceptors,
//! sent through a pluggable transport, and failed attempts are classified,
//! retried with backoff, and redacted before they reach the caller.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{Client, RequestOptions, RetryConfig};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .defaults(
//!             RequestOptions::new()
//!                 .base_url("https://api.example.com/v1/")
//!                 .timeout(Duration::from_secs(3)),
//!         )
//!         .try_build()?;
//!
//!     let response = client
//!         .request(
//!             RequestOptions::new()
//!                 .url("items/42")
//!                 .retry_config(RetryConfig::new().retry(2)),
//!         )
//!         .await?;
//!     let item: Item = response.json()?;
//!
//!     println!("item id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - Retries are off unless `retry(true)` or a `RetryConfig` is set.
//! - Only `GET`, `HEAD`, `PUT`, `OPTIONS` and `DELETE` are retried by default.
//! - Authorization headers, OAuth grant bodies and token query parameters are
//!   redacted from returned errors unless redaction is disabled.

#[cfg(all(not(feature = "tls-rustls-ring"), not(feature = "tls-rustls-aws-lc-rs")))]
compile_error!(
    "reqflow requires one TLS backend feature: enable `tls-rustls-ring` or `tls-rustls-aws-lc-rs`"
);

mod body;
mod client;
mod descriptor;
mod error;
mod headers;
mod hyper_transport;
mod interceptor;
mod multipart;
mod options;
mod proxy;
mod redact;
mod response;
mod retry;
mod signal;
mod tls;
mod transport;
mod util;

pub use crate::body::{BoxByteStream, Body, ByteStream, Data, FormParams, ResponseData};
pub use crate::client::{Client, ClientBuilder};
pub use crate::descriptor::RequestDescriptor;
pub use crate::error::{
    ApiErrorInfo, BoxError, Error, ErrorCode, ErrorKind, RequestError, TransportError,
    TransportErrorKind,
};
pub use crate::headers::{HeaderSource, merge_headers};
pub use crate::hyper_transport::{HyperAgentFactory, HyperTransport};
pub use crate::interceptor::{Interceptor, InterceptorId, InterceptorManager, Interceptors};
pub use crate::multipart::{MultipartPart, PartContent};
pub use crate::options::{
    ParamsSerializer, RequestInput, RequestOptions, ResponseType, ValidateStatus,
};
pub use crate::proxy::{
    Agent, AgentCache, AgentFactory, AgentKind, EnvSource, NoProxyRule, ProcessEnv, StaticEnv,
    should_bypass_proxy,
};
pub use crate::redact::{DefaultErrorRedactor, ErrorRedaction, ErrorRedactor, REDACTED};
pub use crate::response::Response;
pub use crate::retry::{
    DEFAULT_NO_RESPONSE_RETRIES, DEFAULT_RETRY, DEFAULT_RETRY_DELAY,
    DEFAULT_RETRY_DELAY_MULTIPLIER, OnRetryAttempt, RetryBackoff, RetryConfig, ShouldRetry,
};
pub use crate::signal::{AbortReason, AbortSignal};
pub use crate::tls::{ClientIdentity, TlsBackend};
pub use crate::transport::{
    Adapter, DefaultAdapter, Transport, TransportRequest, TransportResponse,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use crate::{
        Agent, Client, ClientBuilder, Data, Error, ErrorKind, FormParams, Interceptor,
        RequestDescriptor, RequestError, RequestOptions, Response, ResponseData, ResponseType,
        Result, RetryConfig, Transport,
    };
}
