use std::collections::BTreeMap;

use batch_protocol::{single, v1, v2, Batch, PayloadSource, Record, RecordBatch, WriteRecord};
use data_model::{
    to_micros, BucketInfo, BucketSettings, EntryInfo, Error, FullBucketInfo, QueryOptions, Result,
    SubscribeOptions, TimeInput,
};
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    http::HttpClient,
    query::{query, RecordStream},
    subscribe::subscribe,
    transport::HttpRequest,
};

pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument(format!("{kind} name must not be empty")));
    }
    if name.contains('/') {
        return Err(Error::invalid_argument(format!(
            "{kind} name '{name}' must not contain '/'"
        )));
    }
    Ok(())
}

/// Handle to one bucket. Cheap to clone; clones share the client transport.
#[derive(Clone)]
pub struct Bucket {
    name: String,
    http: HttpClient,
}

impl Bucket {
    pub(crate) fn new(name: impl Into<String>, http: HttpClient) -> Result<Self> {
        let name = name.into();
        validate_name("bucket", &name)?;
        Ok(Self { name, http })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_full_info(&self) -> Result<FullBucketInfo> {
        self.http
            .json(HttpRequest::get(format!("/b/{}", self.name)))
            .await
    }

    pub async fn info(&self) -> Result<BucketInfo> {
        Ok(self.get_full_info().await?.info)
    }

    pub async fn settings(&self) -> Result<BucketSettings> {
        Ok(self.get_full_info().await?.settings)
    }

    pub async fn entries(&self) -> Result<Vec<EntryInfo>> {
        Ok(self.get_full_info().await?.entries)
    }

    /// Remove the bucket with all its entries.
    pub async fn remove(&self) -> Result<()> {
        self.http
            .execute(HttpRequest::delete(format!("/b/{}", self.name)))
            .await?;
        debug!(bucket = %self.name, "bucket removed");
        Ok(())
    }

    /// Write one record with the default content type and no labels.
    pub async fn write(
        &self,
        entry: &str,
        timestamp: impl Into<TimeInput>,
        data: impl Into<PayloadSource>,
    ) -> Result<()> {
        self.write_record(entry, WriteRecord::new(to_micros(timestamp)?, data))
            .await
    }

    pub async fn write_record(&self, entry: &str, record: WriteRecord) -> Result<()> {
        validate_name("entry", entry)?;
        let timestamp = record.timestamp();
        let encoded = single::encode(record)?;
        let request = HttpRequest::post(format!("/b/{}/{entry}", self.name))
            .query("ts", timestamp)
            .headers(encoded.headers)
            .stream(encoded.body, encoded.content_length);
        self.http.execute(request).await?;
        Ok(())
    }

    /// Write the records of `batch` in one request.
    ///
    /// The request fails as a whole only when the server rejects it; records
    /// the server refused one by one are returned keyed by timestamp.
    pub async fn write_batch(&self, entry: &str, batch: Batch) -> Result<BTreeMap<u64, Error>> {
        validate_name("entry", entry)?;
        if batch.is_empty() {
            return Ok(BTreeMap::new());
        }
        let count = batch.len();
        let encoded = batch.encode()?;
        let request = HttpRequest::post(format!("/b/{}/{entry}/batch", self.name))
            .headers(encoded.headers)
            .stream(encoded.body, encoded.content_length);
        let headers = self.http.execute(request).await?;
        let errors = v1::parse_write_errors(&headers)?;
        debug!(bucket = %self.name, %entry, count, failed = errors.len(), "batch written");
        Ok(errors)
    }

    /// Write records of several entries in one request. Refused records are
    /// returned keyed by entry and timestamp.
    pub async fn write_record_batch(
        &self,
        batch: RecordBatch,
    ) -> Result<BTreeMap<(String, u64), Error>> {
        if batch.is_empty() {
            return Ok(BTreeMap::new());
        }
        let count = batch.len();
        let encoded = batch.encode()?;
        let request = HttpRequest::post(format!("/io/{}/write", self.name))
            .headers(encoded.headers)
            .stream(encoded.body, encoded.content_length);
        let headers = self.http.execute(request).await?;
        let errors = v2::parse_write_errors(&headers)?;
        debug!(bucket = %self.name, count, failed = errors.len(), "record batch written");
        Ok(errors)
    }

    /// Read the record of `entry` at `timestamp`. The payload is streamed
    /// from the response as the record is read.
    pub async fn read(&self, entry: &str, timestamp: impl Into<TimeInput>) -> Result<Record> {
        self.read_record(entry, to_micros(timestamp)?, false).await
    }

    /// Metadata of the record of `entry` at `timestamp`, without its payload.
    pub async fn head(&self, entry: &str, timestamp: impl Into<TimeInput>) -> Result<Record> {
        self.read_record(entry, to_micros(timestamp)?, true).await
    }

    async fn read_record(&self, entry: &str, timestamp: u64, head: bool) -> Result<Record> {
        validate_name("entry", entry)?;
        let method = if head { Method::HEAD } else { Method::GET };
        let request =
            HttpRequest::new(method, format!("/b/{}/{entry}", self.name)).query("ts", timestamp);
        let response = self.http.send(request).await?;
        single::decode(
            &response.headers,
            response.body,
            entry,
            head,
            self.http.timeout(),
        )
    }

    /// Lazily stream the records of `entry` matching `options`.
    pub fn query(&self, entry: &str, options: QueryOptions) -> Result<RecordStream> {
        validate_name("entry", entry)?;
        Ok(query(
            self.http.clone(),
            self.name.clone(),
            entry.to_string(),
            options,
        ))
    }

    /// Follow `entry`, yielding matching records as they are written, until
    /// `options.count` records were delivered or `cancel` fires.
    pub fn subscribe(
        &self,
        entry: &str,
        options: SubscribeOptions,
        cancel: CancellationToken,
    ) -> Result<RecordStream> {
        validate_name("entry", entry)?;
        Ok(subscribe(
            self.http.clone(),
            self.name.clone(),
            entry.to_string(),
            options,
            cancel,
        ))
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}
