use std::fmt;

use data_model::{Labels, DEFAULT_CONTENT_TYPE};
use reqwest::header::HeaderMap;

use crate::{source::PayloadSource, ByteStream};

/// A record queued for writing.
///
/// Returned by the `add` methods of the batches so that the optional parts
/// can be chained on:
///
/// ```
/// use batch_protocol::Batch;
///
/// let mut batch = Batch::new();
/// batch
///     .add(1_000u64, "hello")
///     .unwrap()
///     .content_type("text/plain")
///     .label("sensor", "a");
/// assert_eq!(batch.size(), 5);
/// ```
pub struct WriteRecord {
    timestamp: u64,
    content_type: Option<String>,
    labels: Labels,
    source: PayloadSource,
}

impl WriteRecord {
    pub fn new(timestamp: u64, source: impl Into<PayloadSource>) -> Self {
        Self {
            timestamp,
            content_type: None,
            labels: Labels::new(),
            source: source.into(),
        }
    }

    pub fn content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn labels(&mut self, labels: Labels) -> &mut Self {
        self.labels.extend(labels);
        self
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn size(&self) -> u64 {
        self.source.len()
    }

    pub fn get_content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    pub fn get_labels(&self) -> &Labels {
        &self.labels
    }

    pub(crate) fn into_source(self) -> PayloadSource {
        self.source
    }
}

impl fmt::Debug for WriteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRecord")
            .field("timestamp", &self.timestamp)
            .field("content_type", &self.get_content_type())
            .field("labels", &self.labels)
            .field("size", &self.size())
            .finish()
    }
}

/// Headers and body of a write request. The body streams the payloads in
/// header order and is exactly `content_length` bytes long.
pub struct EncodedBatch {
    pub headers: HeaderMap,
    pub content_length: u64,
    pub body: ByteStream,
}

impl fmt::Debug for EncodedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedBatch")
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}
