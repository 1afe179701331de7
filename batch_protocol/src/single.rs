//! A single record per request: metadata travels in plain headers.

use std::time::Duration;

use bytes::Bytes;
use data_model::{Error, Result};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};

use crate::{
    header::{get_header, header_str, insert_header, validate_content_type, validate_label_key},
    is_last,
    record::{Payload, Record, RecordHeader},
    source::bounded,
    write::{EncodedBatch, WriteRecord},
    ByteStream, LABEL_PREFIX, TIME_HEADER,
};

pub fn encode(record: WriteRecord) -> Result<EncodedBatch> {
    let mut headers = HeaderMap::new();
    let content_type = record.get_content_type();
    validate_content_type(content_type)?;
    insert_header(&mut headers, CONTENT_TYPE.as_str(), content_type)?;
    insert_header(&mut headers, CONTENT_LENGTH.as_str(), &record.size().to_string())?;
    for (key, value) in record.get_labels() {
        validate_label_key(key)?;
        insert_header(&mut headers, &format!("{LABEL_PREFIX}{key}"), value)?;
    }
    Ok(EncodedBatch {
        headers,
        content_length: record.size(),
        body: record.into_source().into_stream(),
    })
}

/// The record of a `GET`/`HEAD /b/{bucket}/{entry}?ts=` response.
pub fn decode(
    headers: &HeaderMap,
    body: ByteStream,
    entry: &str,
    head: bool,
    timeout: Option<Duration>,
) -> Result<Record> {
    let timestamp = get_header(headers, TIME_HEADER)?
        .ok_or_else(|| Error::protocol(format!("missing '{TIME_HEADER}' header")))?
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::protocol(format!("invalid '{TIME_HEADER}' header")))?;
    let size = get_header(headers, CONTENT_LENGTH.as_str())?
        .ok_or_else(|| Error::protocol("missing content-length header"))?
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::protocol("invalid content-length header"))?;

    let mut record = RecordHeader::new(entry, timestamp, size);
    if let Some(content_type) = get_header(headers, CONTENT_TYPE.as_str())? {
        record.content_type = content_type.to_string();
    }
    for (name, value) in headers {
        if let Some(label) = name.as_str().strip_prefix(LABEL_PREFIX) {
            record
                .labels
                .insert(label.to_string(), header_str(name.as_str(), value)?.to_string());
        }
    }

    let payload = if head || size == 0 {
        Payload::Empty
    } else {
        Payload::Body {
            body: bounded(body, size),
            carry: Bytes::new(),
            timeout,
        }
    };
    Ok(Record::new(record, is_last(headers)?, payload))
}
