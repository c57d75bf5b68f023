use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::error::BoxError;
use crate::util::lock_unpoisoned;

pub type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// A one-shot byte stream that can be shared between snapshots.
///
/// Cloning shares the underlying stream; whichever clone takes it first owns
/// it, and every other clone observes it as consumed.
#[derive(Clone)]
pub struct ByteStream {
    inner: Arc<Mutex<Option<BoxByteStream>>>,
}

impl ByteStream {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let mapped = stream.map(|item| item.map_err(Into::into));
        Self {
            inner: Arc::new(Mutex::new(Some(Box::pin(mapped)))),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self::new(futures_util::stream::iter([Ok::<_, BoxError>(bytes)]))
    }

    pub fn take(&self) -> Option<BoxByteStream> {
        lock_unpoisoned(&self.inner).take()
    }

    pub fn is_consumed(&self) -> bool {
        lock_unpoisoned(&self.inner).is_none()
    }

    /// Reads the whole stream into memory.
    pub async fn collect(&self) -> Result<Bytes, BoxError> {
        let Some(mut stream) = self.take() else {
            return Ok(Bytes::new());
        };
        let mut collected = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ByteStream")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Ordered key/value pairs with `URLSearchParams` semantics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormParams {
    pairs: Vec<(String, String)>,
}

impl FormParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(encoded: &str) -> Self {
        let encoded = encoded.strip_prefix('?').unwrap_or(encoded);
        url::form_urlencoded::parse(encoded.as_bytes())
            .into_owned()
            .collect()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((name.into(), value.into()));
    }

    /// Replaces the first entry named `name` and drops any later duplicates,
    /// appending when the name is absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut seen = false;
        self.pairs.retain_mut(|(key, current)| {
            if key != name {
                return true;
            }
            if seen {
                return false;
            }
            seen = true;
            *current = value.clone();
            true
        });
        if !seen {
            self.pairs.push((name.to_owned(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pairs.iter().any(|(key, _)| key == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.pairs.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn as_pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn to_urlencoded(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.pairs {
            serializer.append_pair(name, value);
        }
        serializer.finish()
    }

    /// Flattens a JSON object into pairs. Scalars keep their textual form,
    /// nested values are serialized as JSON.
    pub(crate) fn from_json(value: &Value) -> Self {
        let Value::Object(fields) = value else {
            return Self::default();
        };
        fields
            .iter()
            .map(|(key, value)| (key.clone(), json_scalar_text(value)))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for FormParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn json_scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_owned(),
        other => other.to_string(),
    }
}

/// Caller-supplied request data, before serialization.
#[derive(Clone, Debug)]
pub enum Data {
    Text(String),
    Bytes(Bytes),
    Json(Value),
    Form(FormParams),
    Stream(ByteStream),
}

impl From<String> for Data {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Data {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for Data {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<FormParams> for Data {
    fn from(params: FormParams) -> Self {
        Self::Form(params)
    }
}

impl From<ByteStream> for Data {
    fn from(stream: ByteStream) -> Self {
        Self::Stream(stream)
    }
}

/// Serialized request body as handed to the transport.
#[derive(Clone, Debug)]
pub enum Body {
    Text(String),
    Bytes(Bytes),
    Form(FormParams),
    Stream(ByteStream),
}

impl Body {
    /// Buffered bytes of the body, `None` for streams.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Self::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            Self::Bytes(bytes) => Some(bytes.clone()),
            Self::Form(params) => Some(Bytes::from(params.to_urlencoded())),
            Self::Stream(_) => None,
        }
    }

    /// Converts the body into a stream of chunks, consuming shared streams.
    /// Whether the body can be sent again. A stream replays only until read.
    pub fn is_replayable(&self) -> bool {
        match self {
            Self::Stream(stream) => !stream.is_consumed(),
            _ => true,
        }
    }

    pub fn into_stream(self) -> BoxByteStream {
        match self {
            Self::Stream(stream) => stream
                .take()
                .unwrap_or_else(|| Box::pin(futures_util::stream::empty())),
            buffered => {
                let bytes = buffered.as_bytes().unwrap_or_default();
                Box::pin(futures_util::stream::iter([Ok::<_, BoxError>(bytes)]))
            }
        }
    }
}

/// Decoded response body.
#[derive(Clone, Debug, Default)]
pub enum ResponseData {
    #[default]
    Empty,
    Text(String),
    Json(Value),
    Bytes(Bytes),
    Stream(ByteStream),
    /// Chunks drained from a stream response that failed status validation.
    Chunks(Vec<Bytes>),
}

impl ResponseData {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Whether the body content is held in memory and can be inspected.
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Stream(_))
    }
}
