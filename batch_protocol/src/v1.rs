//! Protocol v1: many records of one entry in one request or response.
//!
//! Every record is described by `x-reduct-time-<timestamp>:
//! <size>,<content_type>[,<label>=<value>...]` and its payload follows the
//! payload of the previous record in the body, in timestamp order. Errors of
//! single records are reported as `x-reduct-error-<timestamp>:
//! <status>,<message>`.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    time::Instant,
};

use data_model::{to_micros, Error, Labels, Result, TimeInput, DEFAULT_CONTENT_TYPE};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};

use crate::{
    header::{
        encode_label_value, header_str, insert_header, parse_label_items, split_record_value,
        validate_content_type, validate_label_key,
    },
    record::{RecordHeader, RecordStatus},
    source::concat,
    write::{EncodedBatch, WriteRecord},
    ERROR_PREFIX, TIME_PREFIX,
};

/// Records of one entry, ordered by timestamp. Adding a record with a
/// timestamp already in the batch replaces it.
#[derive(Debug, Default)]
pub struct Batch {
    records: BTreeMap<u64, WriteRecord>,
    last_access: Option<Instant>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        timestamp: impl Into<TimeInput>,
        data: impl Into<crate::PayloadSource>,
    ) -> Result<&mut WriteRecord> {
        let timestamp = to_micros(timestamp)?;
        let record = WriteRecord::new(timestamp, data);
        self.last_access = Some(Instant::now());
        Ok(match self.records.entry(timestamp) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(record);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(record),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total payload bytes.
    pub fn size(&self) -> u64 {
        self.records.values().map(WriteRecord::size).sum()
    }

    /// When a record was last added; callers flushing on age use it.
    pub fn last_access(&self) -> Option<Instant> {
        self.last_access
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.last_access = None;
    }

    pub fn encode(self) -> Result<EncodedBatch> {
        let mut headers = HeaderMap::new();
        let mut content_length = 0u64;
        for (timestamp, record) in &self.records {
            insert_header(
                &mut headers,
                &format!("{TIME_PREFIX}{timestamp}"),
                &encode_record_value(
                    record.size(),
                    record.get_content_type(),
                    record.get_labels(),
                )?,
            )?;
            content_length += record.size();
        }
        insert_header(&mut headers, CONTENT_TYPE.as_str(), DEFAULT_CONTENT_TYPE)?;
        insert_header(
            &mut headers,
            CONTENT_LENGTH.as_str(),
            &content_length.to_string(),
        )?;

        let body = concat(self.records.into_values().map(WriteRecord::into_source));
        Ok(EncodedBatch {
            headers,
            content_length,
            body,
        })
    }
}

fn encode_record_value(size: u64, content_type: &str, labels: &Labels) -> Result<String> {
    validate_content_type(content_type)?;
    let mut value = format!("{size},{content_type}");
    for (key, label) in labels {
        validate_label_key(key)?;
        value.push(',');
        value.push_str(key);
        value.push('=');
        value.push_str(&encode_label_value(label)?);
    }
    Ok(value)
}

/// Record headers of a v1 response for `entry`, in timestamp order.
pub fn decode(headers: &HeaderMap, entry: &str) -> Result<Vec<RecordHeader>> {
    let mut records: BTreeMap<u64, RecordHeader> = BTreeMap::new();
    let mut errors: BTreeMap<u64, RecordStatus> = BTreeMap::new();

    for (name, value) in headers {
        let name = name.as_str();
        if let Some(timestamp) = name.strip_prefix(TIME_PREFIX) {
            let timestamp = parse_timestamp(name, timestamp)?;
            let value = header_str(name, value)?;
            records.insert(timestamp, decode_record_value(entry, timestamp, value)?);
        } else if let Some(timestamp) = name.strip_prefix(ERROR_PREFIX) {
            let timestamp = parse_timestamp(name, timestamp)?;
            errors.insert(
                timestamp,
                RecordStatus::from_header(header_str(name, value)?)?,
            );
        }
    }

    for (timestamp, status) in errors {
        match records.get_mut(&timestamp) {
            Some(record) if record.size != 0 => {
                return Err(Error::protocol(format!(
                    "failed record {timestamp} declares {} bytes of payload",
                    record.size
                )));
            }
            Some(record) => record.status = status,
            None => {
                let mut record = RecordHeader::new(entry, timestamp, 0);
                record.status = status;
                records.insert(timestamp, record);
            }
        }
    }
    Ok(records.into_values().collect())
}

fn parse_timestamp(name: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| Error::protocol(format!("invalid timestamp in header '{name}'")))
}

fn decode_record_value(entry: &str, timestamp: u64, value: &str) -> Result<RecordHeader> {
    let (size, content_type, labels) = split_record_value(value)?;
    let mut record = RecordHeader::new(entry, timestamp, size);
    if let Some(content_type) = content_type.filter(|ct| !ct.is_empty()) {
        record.content_type = content_type.to_string();
    }
    if let Some(labels) = labels {
        for (key, label) in parse_label_items(labels)? {
            record
                .labels
                .insert(key.to_string(), label.unwrap_or_default().to_string());
        }
    }
    Ok(record)
}

/// Per-record errors of a v1 write response, keyed by timestamp.
pub fn parse_write_errors(headers: &HeaderMap) -> Result<BTreeMap<u64, Error>> {
    let mut errors = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if let Some(timestamp) = name.strip_prefix(ERROR_PREFIX) {
            let timestamp = parse_timestamp(name, timestamp)?;
            errors.insert(timestamp, Error::from_header(header_str(name, value)?)?);
        }
    }
    Ok(errors)
}
