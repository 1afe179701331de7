//! Wire format of record batches.
//!
//! A batch is a set of records sent in one HTTP message: the metadata of every
//! record is carried by headers, the payloads are concatenated in the body in
//! header order. Two header layouts exist, [`v1`] for a single entry and
//! [`v2`] for many entries; [`decode_batch`] picks the right one.

pub mod header;
mod lockstep;
pub mod record;
pub mod single;
pub mod source;
pub mod v1;
pub mod v2;
pub mod write;

use std::time::Duration;

use bytes::Bytes;
use data_model::{Error, Result};
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use tracing::error;

pub use record::{Record, RecordHeader, RecordStatus, DEFAULT_CHUNK_SIZE};
pub use source::PayloadSource;
pub use v1::Batch;
pub use v2::RecordBatch;
pub use write::{EncodedBatch, WriteRecord};

use crate::{header::get_header, lockstep::Lockstep, record::Payload};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

pub const HEADER_PREFIX: &str = "x-reduct-";
pub const TIME_PREFIX: &str = "x-reduct-time-";
pub const ERROR_PREFIX: &str = "x-reduct-error-";
pub const LABEL_PREFIX: &str = "x-reduct-label-";
pub const TIME_HEADER: &str = "x-reduct-time";
pub const ERROR_HEADER: &str = "x-reduct-error";
pub const LAST_HEADER: &str = "x-reduct-last";
pub const API_HEADER: &str = "x-reduct-api";
pub const QUERY_ID_HEADER: &str = "x-reduct-query-id";
pub const ENTRIES_HEADER: &str = "x-reduct-entries";
pub const START_TS_HEADER: &str = "x-reduct-start-ts";
pub const LABELS_HEADER: &str = "x-reduct-labels";

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Entry of the records of a v1 response.
    pub entry: String,
    /// The response belongs to a `HEAD` request and has no body.
    pub head: bool,
    /// Deadline for every chunk of the body.
    pub timeout: Option<Duration>,
}

/// The response completes the query.
pub fn is_last(headers: &HeaderMap) -> Result<bool> {
    Ok(get_header(headers, LAST_HEADER)?
        .map(|value| matches!(value.trim(), "true" | "1"))
        .unwrap_or(false))
}

/// The response carries batch framing, as opposed to a JSON document.
pub fn is_batch(headers: &HeaderMap) -> bool {
    headers.contains_key(ENTRIES_HEADER)
        || headers.keys().any(|name| {
            let name = name.as_str();
            name.starts_with(TIME_PREFIX) || name == LAST_HEADER
        })
}

pub fn query_id(headers: &HeaderMap) -> Result<Option<u64>> {
    get_header(headers, QUERY_ID_HEADER)?
        .map(|id| {
            id.trim()
                .parse::<u64>()
                .map_err(|_| Error::protocol(format!("invalid '{QUERY_ID_HEADER}' header")))
        })
        .transpose()
}

/// Split a batch response into its records.
///
/// All headers are validated before anything is returned: a malformed header
/// makes the whole batch unusable. The payloads are not read here; each
/// record reads its own part of `body` when asked to.
pub fn decode_batch(
    headers: &HeaderMap,
    body: ByteStream,
    options: &DecodeOptions,
) -> Result<Vec<Record>> {
    let decoded = if headers.contains_key(ENTRIES_HEADER) {
        v2::decode(headers)
    } else {
        v1::decode(headers, &options.entry)
    };
    let records = decoded.inspect_err(|e| error!(error = %e, "unusable batch response"))?;

    let sizes: Vec<u64> = records
        .iter()
        .map(|record| {
            if options.head || !record.status.is_ok() {
                0
            } else {
                record.size
            }
        })
        .collect();

    if !options.head {
        if let Some(content_length) = get_header(headers, CONTENT_LENGTH.as_str())? {
            let declared: u64 = sizes.iter().sum();
            let content_length = content_length
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::protocol("invalid content-length header"))?;
            if content_length != declared {
                error!(content_length, declared, "batch body length mismatch");
                return Err(Error::protocol(format!(
                    "content-length {content_length} differs from the {declared} declared bytes"
                )));
            }
        }
    }

    let last = is_last(headers)?;
    let count = records.len();
    let lockstep = Lockstep::new(body, sizes.clone(), options.timeout);
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(index, header)| {
            let payload = if sizes[index] == 0 {
                Payload::Empty
            } else {
                Payload::Batched(lockstep.slot(index))
            };
            Record::new(header, last && index + 1 == count, payload)
        })
        .collect())
}
