use std::{fmt, time::Duration};

use bytes::{Bytes, BytesMut};
use data_model::{Error, Labels, Result, DEFAULT_CONTENT_TYPE};
use futures::{stream::BoxStream, StreamExt};

use crate::{lockstep::Slot, ByteStream};

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Ok,
    /// The server reported an error for this record of a batch. The record
    /// carries no payload.
    Failed { status: u16, message: String },
}

impl RecordStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Parse an `x-reduct-error-*` value: `<status>,<message>`.
    pub fn from_header(value: &str) -> Result<Self> {
        match Error::from_header(value)? {
            Error::Http { status, message } => Ok(Self::Failed { status, message }),
            other => Err(other),
        }
    }

    pub fn to_error(&self) -> Option<Error> {
        match self {
            Self::Ok => None,
            Self::Failed { status, message } => Some(Error::http(*status, message.clone())),
        }
    }
}

/// Metadata of a record as announced by the response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub entry: String,
    pub timestamp: u64,
    pub size: u64,
    pub content_type: String,
    pub labels: Labels,
    pub status: RecordStatus,
}

impl RecordHeader {
    pub fn new(entry: impl Into<String>, timestamp: u64, size: u64) -> Self {
        Self {
            entry: entry.into(),
            timestamp,
            size,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            labels: Labels::new(),
            status: RecordStatus::Ok,
        }
    }
}

pub(crate) enum Payload {
    /// Failed records and metadata-only reads.
    Empty,
    /// Whole body of a single-record response, already bounded to `size`.
    Body {
        body: ByteStream,
        carry: Bytes,
        timeout: Option<Duration>,
    },
    /// Part of a batch body.
    Batched(Slot),
}

/// A record received from the server.
///
/// Metadata is fixed at construction. The payload is a forward-only byte
/// stream that can be consumed once, in pieces with [`Record::read`] or as a
/// whole with [`Record::read_all`].
pub struct Record {
    header: RecordHeader,
    last: bool,
    payload: Payload,
    received: u64,
}

impl Record {
    pub(crate) fn new(header: RecordHeader, last: bool, payload: Payload) -> Self {
        Self {
            header,
            last,
            payload,
            received: 0,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn entry(&self) -> &str {
        &self.header.entry
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }

    pub fn content_type(&self) -> &str {
        &self.header.content_type
    }

    pub fn labels(&self) -> &Labels {
        &self.header.labels
    }

    pub fn status(&self) -> &RecordStatus {
        &self.header.status
    }

    /// The record is the last one of its query.
    pub fn last(&self) -> bool {
        self.last
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Up to `max` bytes of the payload, `None` once it is exhausted.
    pub async fn read(&mut self, max: usize) -> Result<Option<Bytes>> {
        if max == 0 {
            return Err(Error::invalid_argument("read size must be greater than 0"));
        }
        let chunk = match &mut self.payload {
            Payload::Empty => None,
            Payload::Batched(slot) => slot.read(max).await?,
            Payload::Body {
                body,
                carry,
                timeout,
            } => {
                while carry.is_empty() {
                    let next = match timeout {
                        Some(timeout) => tokio::time::timeout(*timeout, body.next())
                            .await
                            .map_err(|_| Error::Timeout(*timeout))?,
                        None => body.next().await,
                    };
                    match next.transpose()? {
                        Some(chunk) => *carry = chunk,
                        None => break,
                    }
                }
                if carry.is_empty() {
                    None
                } else {
                    let take = max.min(carry.len());
                    Some(carry.split_to(take))
                }
            }
        };

        if let Some(chunk) = &chunk {
            self.received += chunk.len() as u64;
            if self.received > self.header.size {
                return Err(Error::OverRead {
                    expected: self.header.size,
                });
            }
        } else if self.received < self.header.size && !matches!(self.payload, Payload::Empty) {
            return Err(Error::IncompleteRead {
                expected: self.header.size,
                received: self.received,
            });
        }
        Ok(chunk)
    }

    /// The rest of the payload in one buffer.
    pub async fn read_all(&mut self) -> Result<Bytes> {
        if matches!(self.payload, Payload::Empty) {
            return Ok(Bytes::new());
        }
        // the declared size is untrusted until the bytes arrive
        let remaining = self
            .header
            .size
            .saturating_sub(self.received)
            .min(DEFAULT_CHUNK_SIZE as u64);
        let mut data = BytesMut::with_capacity(remaining as usize);
        while let Some(chunk) = self.read(DEFAULT_CHUNK_SIZE).await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }

    /// The rest of the payload as a stream of chunks of at most `chunk_size`
    /// bytes.
    pub fn into_stream(self, chunk_size: usize) -> BoxStream<'static, Result<Bytes>> {
        async_stream::try_stream! {
            let mut record = self;
            while let Some(chunk) = record.read(chunk_size).await? {
                yield chunk;
            }
        }
        .boxed()
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("entry", &self.header.entry)
            .field("timestamp", &self.header.timestamp)
            .field("size", &self.header.size)
            .field("content_type", &self.header.content_type)
            .field("labels", &self.header.labels)
            .field("status", &self.header.status)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
