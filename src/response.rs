use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::body::{ByteStream, ResponseData};
use crate::descriptor::RequestDescriptor;
use crate::error::RequestError;

/// Result of one transport exchange, with the descriptor that produced it.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    data: ResponseData,
    config: RequestDescriptor,
}

impl Response {
    pub fn new(
        status: StatusCode,
        status_text: Option<String>,
        headers: HeaderMap,
        data: ResponseData,
        config: RequestDescriptor,
    ) -> Self {
        let status_text = status_text
            .or_else(|| status.canonical_reason().map(ToOwned::to_owned))
            .unwrap_or_default();
        Self {
            status,
            status_text,
            headers,
            data,
            config,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn data(&self) -> &ResponseData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ResponseData {
        &mut self.data
    }

    pub fn into_data(self) -> ResponseData {
        self.data
    }

    pub fn config(&self) -> &RequestDescriptor {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RequestDescriptor {
        &mut self.config
    }

    pub fn text(&self) -> Option<&str> {
        self.data.as_text()
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.data.as_bytes()
    }

    /// The unconsumed body of a `stream` response.
    pub fn body_stream(&self) -> Option<&ByteStream> {
        match &self.data {
            ResponseData::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Deserializes the decoded body into `T`.
    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let decoded = match &self.data {
            ResponseData::Json(value) => T::deserialize(value),
            ResponseData::Text(text) => serde_json::from_str(text),
            ResponseData::Bytes(bytes) => serde_json::from_slice(bytes),
            ResponseData::Empty => serde_json::from_str("null"),
            ResponseData::Chunks(chunks) => serde_json::from_slice(&chunks.concat()),
            ResponseData::Stream(_) => serde_json::from_str(""),
        };
        decoded.map_err(|source| RequestError::decode(&self.config, None, source).into())
    }
}
