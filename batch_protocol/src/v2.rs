//! Protocol v2: records of several entries in one request or response.
//!
//! Headers are compressed against the previous record of the same entry:
//!
//! * `x-reduct-entries`: percent-encoded entry names, comma separated;
//! * `x-reduct-start-ts`: the smallest timestamp of the batch;
//! * `x-reduct-labels`: label names, referenced by their index;
//! * `x-reduct-<entry index>-<timestamp - start>`:
//!   `<size>[,<content type>[,<label delta>]]` where an empty content type
//!   repeats the previous one, and the delta only lists labels that changed.
//!   `<index>=` (no value) removes a label.
//!
//! Errors of single records are reported as
//! `x-reduct-error-<entry index>-<delta>: <status>,<message>`.

use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet, HashMap},
    time::Instant,
};

use data_model::{to_micros, Error, Labels, Result, TimeInput, DEFAULT_CONTENT_TYPE};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};

use crate::{
    header::{
        decode_name, encode_label_value, encode_name, get_header, header_str, insert_header,
        parse_label_items, split_record_value, validate_content_type, validate_label_key,
    },
    record::{RecordHeader, RecordStatus},
    source::concat,
    write::{EncodedBatch, WriteRecord},
    PayloadSource, ENTRIES_HEADER, HEADER_PREFIX, LABELS_HEADER, START_TS_HEADER,
};

/// Records of any number of entries, ordered by entry and timestamp. Adding a
/// record for an `(entry, timestamp)` already in the batch replaces it.
#[derive(Debug, Default)]
pub struct RecordBatch {
    records: BTreeMap<(String, u64), WriteRecord>,
    last_access: Option<Instant>,
}

impl RecordBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        entry: impl Into<String>,
        timestamp: impl Into<TimeInput>,
        data: impl Into<PayloadSource>,
    ) -> Result<&mut WriteRecord> {
        let entry = entry.into();
        if entry.is_empty() {
            return Err(Error::invalid_argument("entry name must not be empty"));
        }
        let timestamp = to_micros(timestamp)?;
        let record = WriteRecord::new(timestamp, data);
        self.last_access = Some(Instant::now());
        Ok(match self.records.entry((entry, timestamp)) {
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

    pub fn size(&self) -> u64 {
        self.records.values().map(WriteRecord::size).sum()
    }

    pub fn last_access(&self) -> Option<Instant> {
        self.last_access
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.last_access = None;
    }

    pub fn encode(self) -> Result<EncodedBatch> {
        let start_ts = self
            .records
            .keys()
            .map(|(_, timestamp)| *timestamp)
            .min()
            .unwrap_or(0);

        let mut headers = HeaderMap::new();
        let mut entries: Vec<&str> = Vec::new();
        let mut label_names = LabelTable::default();
        let mut previous: Option<(&str, &Labels)> = None;
        let mut content_length = 0u64;

        for ((entry, timestamp), record) in &self.records {
            if entries.last() != Some(&entry.as_str()) {
                entries.push(entry.as_str());
                previous = None;
            }
            let entry_index = entries.len() - 1;

            let content_type = record.get_content_type();
            validate_content_type(content_type)?;
            let content_type_part = match previous {
                Some((prev_content_type, _)) if prev_content_type == content_type => "",
                _ => content_type,
            };
            let delta = label_delta(
                record.get_labels(),
                previous.map(|(_, labels)| labels),
                &mut label_names,
            )?;

            let mut value = record.size().to_string();
            if !content_type_part.is_empty() || !delta.is_empty() {
                value.push(',');
                value.push_str(content_type_part);
                if !delta.is_empty() {
                    value.push(',');
                    value.push_str(&delta);
                }
            }
            insert_header(
                &mut headers,
                &format!("{HEADER_PREFIX}{entry_index}-{}", timestamp - start_ts),
                &value,
            )?;

            content_length += record.size();
            previous = Some((content_type, record.get_labels()));
        }

        let entries = entries
            .iter()
            .map(|entry| encode_name(entry))
            .collect::<Vec<_>>()
            .join(",");
        insert_header(&mut headers, ENTRIES_HEADER, &entries)?;
        insert_header(&mut headers, START_TS_HEADER, &start_ts.to_string())?;
        if !label_names.names.is_empty() {
            let labels = label_names
                .names
                .iter()
                .map(|name| encode_name(name))
                .collect::<Vec<_>>()
                .join(",");
            insert_header(&mut headers, LABELS_HEADER, &labels)?;
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

/// Label names in order of first use.
#[derive(Default)]
struct LabelTable {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelTable {
    fn index_of(&mut self, name: &str) -> usize {
        if let Some(index) = self.index.get(name) {
            return *index;
        }
        let index = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), index);
        index
    }
}

fn label_delta(
    labels: &Labels,
    previous: Option<&Labels>,
    table: &mut LabelTable,
) -> Result<String> {
    let mut ops: Vec<(usize, String)> = Vec::new();
    match previous {
        None => {
            for (key, value) in labels {
                validate_label_key(key)?;
                ops.push((table.index_of(key), encode_label_value(value)?.into_owned()));
            }
        }
        Some(previous) => {
            let keys: BTreeSet<&String> = labels.keys().chain(previous.keys()).collect();
            for key in keys {
                match (labels.get(key), previous.get(key)) {
                    (Some(value), Some(prev)) if value == prev => {}
                    (Some(value), _) => {
                        validate_label_key(key)?;
                        ops.push((table.index_of(key), encode_label_value(value)?.into_owned()));
                    }
                    (None, _) => ops.push((table.index_of(key), String::new())),
                }
            }
        }
    }
    ops.sort_by_key(|(index, _)| *index);
    Ok(ops
        .iter()
        .map(|(index, value)| format!("{index}={value}"))
        .collect::<Vec<_>>()
        .join(","))
}

/// `<entry index>-<delta>`; `None` for headers of another shape.
fn parse_record_key(raw: &str) -> Option<Result<(usize, u64)>> {
    let (entry, delta) = raw.split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(entry) || !digits(delta) {
        return None;
    }
    Some(
        entry
            .parse::<usize>()
            .ok()
            .zip(delta.parse::<u64>().ok())
            .ok_or_else(|| Error::protocol(format!("record key '{raw}' is out of range"))),
    )
}

fn parse_names(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',').map(|name| decode_name(name.trim())).collect()
}

/// Record headers of a v2 response, ordered by entry and timestamp.
pub fn decode(headers: &HeaderMap) -> Result<Vec<RecordHeader>> {
    let entries = parse_names(
        get_header(headers, ENTRIES_HEADER)?
            .ok_or_else(|| Error::protocol(format!("missing '{ENTRIES_HEADER}' header")))?,
    )?;
    let start_ts = get_header(headers, START_TS_HEADER)?
        .ok_or_else(|| Error::protocol(format!("missing '{START_TS_HEADER}' header")))?
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::protocol(format!("invalid '{START_TS_HEADER}' header")))?;
    let label_names = get_header(headers, LABELS_HEADER)?
        .map(parse_names)
        .transpose()?;

    let mut values: BTreeMap<(usize, u64), &str> = BTreeMap::new();
    let mut errors: BTreeMap<(usize, u64), RecordStatus> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        let Some(rest) = name.strip_prefix(HEADER_PREFIX) else {
            continue;
        };
        if let Some(key) = rest.strip_prefix("error-").and_then(parse_record_key) {
            errors.insert(key?, RecordStatus::from_header(header_str(name, value)?)?);
        } else if let Some(key) = parse_record_key(rest) {
            values.insert(key?, header_str(name, value)?);
        }
    }

    let keys: BTreeSet<(usize, u64)> = values.keys().chain(errors.keys()).copied().collect();
    let mut previous: HashMap<usize, (String, Labels)> = HashMap::new();
    let mut records = Vec::with_capacity(keys.len());

    for (entry_index, delta) in keys {
        let entry = entries.get(entry_index).ok_or_else(|| {
            Error::protocol(format!("entry index {entry_index} is not in '{ENTRIES_HEADER}'"))
        })?;
        let timestamp = start_ts
            .checked_add(delta)
            .ok_or_else(|| Error::protocol(format!("timestamp delta {delta} overflows")))?;

        let mut record = match values.get(&(entry_index, delta)) {
            Some(value) => {
                let (size, content_type, delta_labels) = split_record_value(value)?;
                let (prev_content_type, prev_labels) = previous
                    .get(&entry_index)
                    .map(|(content_type, labels)| (content_type.as_str(), labels.clone()))
                    .unwrap_or((DEFAULT_CONTENT_TYPE, Labels::new()));

                let mut record = RecordHeader::new(entry.as_str(), timestamp, size);
                record.content_type = content_type
                    .filter(|ct| !ct.is_empty())
                    .unwrap_or(prev_content_type)
                    .to_string();
                record.labels = prev_labels;
                if let Some(delta_labels) = delta_labels {
                    apply_label_delta(&mut record.labels, delta_labels, label_names.as_deref())?;
                }
                previous.insert(
                    entry_index,
                    (record.content_type.clone(), record.labels.clone()),
                );
                record
            }
            None => RecordHeader::new(entry.as_str(), timestamp, 0),
        };

        if let Some(status) = errors.remove(&(entry_index, delta)) {
            if record.size != 0 {
                return Err(Error::protocol(format!(
                    "failed record {entry}/{timestamp} declares {} bytes of payload",
                    record.size
                )));
            }
            record.status = status;
        }
        records.push(record);
    }
    Ok(records)
}

fn apply_label_delta(labels: &mut Labels, raw: &str, names: Option<&[String]>) -> Result<()> {
    for (key, value) in parse_label_items(raw)? {
        let name = match (names, key.parse::<usize>()) {
            (Some(names), Ok(index)) => names
                .get(index)
                .cloned()
                .ok_or_else(|| Error::protocol(format!("label index {index} is out of range")))?,
            _ if key.starts_with('@') => {
                return Err(Error::protocol(format!(
                    "label '{key}' uses the reserved '@' prefix"
                )))
            }
            _ => key.to_string(),
        };
        match value {
            Some(value) => labels.insert(name, value.to_string()),
            None => labels.remove(&name),
        };
    }
    Ok(())
}

/// Per-record errors of a v2 write response, keyed by entry and timestamp.
pub fn parse_write_errors(headers: &HeaderMap) -> Result<BTreeMap<(String, u64), Error>> {
    let mut errors = BTreeMap::new();
    let has_errors = headers
        .keys()
        .any(|name| name.as_str().starts_with(crate::ERROR_PREFIX));
    if !has_errors {
        return Ok(errors);
    }

    let entries = parse_names(
        get_header(headers, ENTRIES_HEADER)?
            .ok_or_else(|| Error::protocol(format!("missing '{ENTRIES_HEADER}' header")))?,
    )?;
    let start_ts = get_header(headers, START_TS_HEADER)?
        .ok_or_else(|| Error::protocol(format!("missing '{START_TS_HEADER}' header")))?
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::protocol(format!("invalid '{START_TS_HEADER}' header")))?;

    for (name, value) in headers {
        let name = name.as_str();
        let Some(key) = name
            .strip_prefix(crate::ERROR_PREFIX)
            .and_then(parse_record_key)
        else {
            continue;
        };
        let (entry_index, delta) = key?;
        let entry = entries.get(entry_index).ok_or_else(|| {
            Error::protocol(format!("entry index {entry_index} is not in '{ENTRIES_HEADER}'"))
        })?;
        let timestamp = start_ts
            .checked_add(delta)
            .ok_or_else(|| Error::protocol(format!("timestamp delta {delta} overflows")))?;
        errors.insert(
            (entry.clone(), timestamp),
            Error::from_header(header_str(name, value)?)?,
        );
    }
    Ok(errors)
}
