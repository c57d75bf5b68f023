use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream;
use rand::Rng;

use crate::body::{BoxByteStream, ByteStream};
use crate::error::BoxError;

const DEFAULT_PART_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone, Debug)]
pub enum PartContent {
    Text(String),
    Bytes(Bytes),
    /// Forwarded chunk by chunk without buffering.
    Stream(ByteStream),
}

/// One part of a `multipart/related` body.
#[derive(Clone, Debug)]
pub struct MultipartPart {
    content_type: Option<String>,
    content: PartContent,
}

impl MultipartPart {
    pub fn new(content: PartContent) -> Self {
        Self {
            content_type: None,
            content,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(PartContent::Text(content.into()))
    }

    pub fn bytes(content: impl Into<Bytes>) -> Self {
        Self::new(PartContent::Bytes(content.into()))
    }

    pub fn stream(content: ByteStream) -> Self {
        Self::new(PartContent::Stream(content))
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_type_or_default(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or(DEFAULT_PART_CONTENT_TYPE)
    }
}

/// Fresh random boundary token.
pub fn generate_boundary() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

pub fn content_type_for_boundary(boundary: &str) -> String {
    format!("multipart/related; boundary={boundary}")
}

/// Frames `parts` in memory. Returns `None` when a part streams its content.
pub fn buffered_multipart_body(parts: &[MultipartPart], boundary: &str) -> Option<Bytes> {
    let mut framed = BytesMut::new();
    for part in parts {
        framed.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Type: {}\r\n\r\n",
                part.content_type_or_default()
            )
            .as_bytes(),
        );
        match &part.content {
            PartContent::Text(text) => framed.extend_from_slice(text.as_bytes()),
            PartContent::Bytes(bytes) => framed.extend_from_slice(bytes),
            PartContent::Stream(_) => return None,
        }
        framed.extend_from_slice(b"\r\n");
    }
    framed.extend_from_slice(format!("--{boundary}--").as_bytes());
    Some(framed.freeze())
}

/// Frames `parts` as a `multipart/related` body delimited by `boundary`.
pub fn multipart_body(parts: Vec<MultipartPart>, boundary: &str) -> ByteStream {
    let boundary = boundary.to_owned();
    let closing = Bytes::from(format!("--{boundary}--"));
    let framed = stream::iter(parts).flat_map(move |part| {
        let head = Bytes::from(format!(
            "--{boundary}\r\nContent-Type: {}\r\n\r\n",
            part.content_type_or_default()
        ));
        let content: BoxByteStream = match part.content {
            PartContent::Text(text) => {
                Box::pin(stream::iter([Ok::<_, BoxError>(Bytes::from(text))]))
            }
            PartContent::Bytes(bytes) => Box::pin(stream::iter([Ok::<_, BoxError>(bytes)])),
            PartContent::Stream(source) => source
                .take()
                .unwrap_or_else(|| Box::pin(stream::empty())),
        };
        stream::iter([Ok::<_, BoxError>(head)])
            .chain(content)
            .chain(stream::iter([Ok(Bytes::from_static(b"\r\n"))]))
    });
    ByteStream::new(framed.chain(stream::iter([Ok::<_, BoxError>(closing)])))
}
