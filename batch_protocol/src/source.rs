use std::{fmt, path::Path};

use bytes::Bytes;
use data_model::{Error, Result};
use futures::{stream, Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::ByteStream;

/// Payload handed to a write: a finite, non-restartable sequence of chunks
/// with a declared total length.
///
/// Every constructor ends up as the same thing, so the codec never cares
/// whether the bytes live in memory, in a file or behind a socket. The chunks
/// are checked against `length` while they are streamed out.
pub struct PayloadSource {
    length: u64,
    chunks: ByteStream,
}

impl PayloadSource {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        let chunks = if data.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(data) }).boxed()
        };
        Self { length, chunks }
    }

    pub fn from_stream<S>(chunks: S, length: u64) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            length,
            chunks: chunks.boxed(),
        }
    }

    pub fn from_reader<R>(reader: R, length: u64) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let chunks = ReaderStream::new(reader).map(|chunk| chunk.map_err(Error::from));
        Self::from_stream(chunks, length)
    }

    /// Stream a file; the length is taken from its metadata.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let length = file.metadata().await?.len();
        Ok(Self::from_reader(file, length))
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The chunks, failing with `IncompleteRead` or `OverRead` as soon as the
    /// source disagrees with its declared length.
    pub fn into_stream(self) -> ByteStream {
        bounded(self.chunks, self.length)
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSource")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl From<Bytes> for PayloadSource {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for PayloadSource {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static [u8]> for PayloadSource {
    fn from(data: &'static [u8]) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static str> for PayloadSource {
    fn from(data: &'static str) -> Self {
        Self::from_bytes(data)
    }
}

impl From<String> for PayloadSource {
    fn from(data: String) -> Self {
        Self::from_bytes(data)
    }
}

/// Enforce an exact byte count on a chunk stream. A chunk that would cross
/// `length` is not yielded.
pub fn bounded<S>(chunks: S, length: u64) -> ByteStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    async_stream::try_stream! {
        let mut received = 0u64;
        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > length {
                Err::<(), _>(Error::OverRead { expected: length })?;
            }
            if !chunk.is_empty() {
                yield chunk;
            }
        }
        if received < length {
            Err::<(), _>(Error::IncompleteRead { expected: length, received })?;
        }
    }
    .boxed()
}

/// Concatenate sources into one body without buffering any of them.
pub fn concat(sources: impl IntoIterator<Item = PayloadSource>) -> ByteStream {
    let streams: Vec<ByteStream> = sources.into_iter().map(PayloadSource::into_stream).collect();
    stream::iter(streams).flatten().boxed()
}
