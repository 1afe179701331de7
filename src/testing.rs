//! In-memory ReductStore used by the tests.
//!
//! Implements [`Transport`] directly, so requests never leave the process:
//! buckets, single and batched writes (v1 and v2), single reads and queries
//! with time bounds, label filters, `each_n`, `each_s`, `limit`, continuous
//! mode and cursor ttl. Responses are framed with the client's own encoders.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use batch_protocol::{
    header::{decode_name, get_header, header_str, insert_header},
    v1, v2, Batch, API_HEADER, ENTRIES_HEADER, ERROR_HEADER, ERROR_PREFIX, LABEL_PREFIX,
    LAST_HEADER, QUERY_ID_HEADER, START_TS_HEADER, TIME_HEADER,
};
use bytes::{Bytes, BytesMut};
use data_model::{
    BucketInfo, BucketList, BucketSettings, EntryInfo, FullBucketInfo, Labels, QueryInfo,
    QueryRequest, Result, ServerInfo, DEFAULT_CONTENT_TYPE,
};
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE},
    StatusCode,
};
use serde::Serialize;
use tokio::time::Instant;

use crate::{
    client::Client,
    config::ClientConfig,
    transport::{Body, HttpRequest, HttpResponse, Transport},
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub data: Bytes,
    pub content_type: String,
    pub labels: Labels,
}

type Entries = BTreeMap<String, BTreeMap<u64, StoredRecord>>;

struct StoredBucket {
    settings: BucketSettings,
    entries: Entries,
}

struct StoredQuery {
    bucket: String,
    entry: String,
    request: QueryRequest,
    next_start: u64,
    matched: u64,
    returned: u64,
    last_each_s: Option<u64>,
    ttl: Duration,
    expires_at: Instant,
}

type Page = Vec<(u64, StoredRecord, Option<(u16, String)>)>;

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, StoredBucket>,
    queries: HashMap<u64, StoredQuery>,
    next_query_id: u64,
    failed_reads: HashMap<(String, String, u64), (u16, String)>,
    requests: Vec<String>,
}

pub struct FakeServer {
    state: Mutex<State>,
    page_limit: usize,
    inline_first_page: bool,
    delay: Option<Duration>,
    replay_from_start: bool,
    evaluate_when: bool,
    api_version: String,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_limit: 100,
            inline_first_page: false,
            delay: None,
            replay_from_start: false,
            evaluate_when: true,
            api_version: "1.13".to_string(),
        }
    }

    /// Records per response of a query.
    pub fn page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit;
        self
    }

    /// Answer query initiation with the first page instead of a query id.
    pub fn inline_first_page(mut self) -> Self {
        self.inline_first_page = true;
        self
    }

    /// Wait before answering any request.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Ignore the start of queries and return records from the beginning.
    pub fn replay_from_start(mut self) -> Self {
        self.replay_from_start = true;
        self
    }

    /// Behave like a server without `when` support: the condition is
    /// accepted and ignored.
    pub fn ignore_when(mut self) -> Self {
        self.evaluate_when = false;
        self
    }

    pub fn api_version(mut self, version: &str) -> Self {
        self.api_version = version.to_string();
        self
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.state.lock().unwrap().buckets.insert(
            bucket.to_string(),
            StoredBucket {
                settings: BucketSettings::default(),
                entries: Entries::new(),
            },
        );
    }

    pub fn insert(
        &self,
        bucket: &str,
        entry: &str,
        timestamp: u64,
        data: &[u8],
        labels: &[(&str, &str)],
    ) {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| StoredBucket {
                settings: BucketSettings::default(),
                entries: Entries::new(),
            });
        stored.entries.entry(entry.to_string()).or_default().insert(
            timestamp,
            StoredRecord {
                data: Bytes::copy_from_slice(data),
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
                labels: labels
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            },
        );
    }

    /// Report the record as failed when a query returns it.
    pub fn fail_read(&self, bucket: &str, entry: &str, timestamp: u64, status: u16, message: &str) {
        self.state.lock().unwrap().failed_reads.insert(
            (bucket.to_string(), entry.to_string(), timestamp),
            (status, message.to_string()),
        );
    }

    /// Forget every open query, as if their ttl elapsed.
    pub fn expire_queries(&self) {
        self.state.lock().unwrap().queries.clear();
    }

    pub fn open_queries(&self) -> usize {
        self.state.lock().unwrap().queries.len()
    }

    /// `"<METHOD> <path>"` of every request received so far.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn records(&self, bucket: &str, entry: &str) -> Vec<(u64, StoredRecord)> {
        let state = self.state.lock().unwrap();
        state
            .buckets
            .get(bucket)
            .and_then(|stored| stored.entries.get(entry))
            .map(|records| records.iter().map(|(ts, r)| (*ts, r.clone())).collect())
            .unwrap_or_default()
    }

    fn server_info(&self) -> HttpResponse {
        let state = self.state.lock().unwrap();
        let infos: Vec<BucketInfo> = state
            .buckets
            .iter()
            .map(|(name, stored)| bucket_info(name, stored))
            .collect();
        json(&ServerInfo {
            version: format!("{}.0", self.api_version),
            bucket_count: infos.len() as u64,
            usage: infos.iter().map(|info| info.size).sum(),
            uptime: 1,
            oldest_record: infos.iter().map(|info| info.oldest_record).min().unwrap_or(0),
            latest_record: infos.iter().map(|info| info.latest_record).max().unwrap_or(0),
            defaults: Default::default(),
        })
    }

    fn list(&self) -> HttpResponse {
        let state = self.state.lock().unwrap();
        json(&BucketList {
            buckets: state
                .buckets
                .iter()
                .map(|(name, stored)| bucket_info(name, stored))
                .collect(),
        })
    }

    fn get_bucket(&self, bucket: &str, head: bool) -> HttpResponse {
        let state = self.state.lock().unwrap();
        let Some(stored) = state.buckets.get(bucket) else {
            return bucket_not_found(bucket);
        };
        if head {
            return empty(StatusCode::OK);
        }
        json(&FullBucketInfo {
            info: bucket_info(bucket, stored),
            settings: stored.settings.clone(),
            entries: stored
                .entries
                .iter()
                .map(|(name, records)| EntryInfo {
                    name: name.clone(),
                    size: records.values().map(|r| r.data.len() as u64).sum(),
                    block_count: 1,
                    record_count: records.len() as u64,
                    oldest_record: records.keys().next().copied().unwrap_or(0),
                    latest_record: records.keys().last().copied().unwrap_or(0),
                })
                .collect(),
        })
    }

    fn create_bucket_route(&self, bucket: &str, body: &Bytes) -> HttpResponse {
        let settings: BucketSettings = if body.is_empty() {
            BucketSettings::default()
        } else {
            match serde_json::from_slice(body) {
                Ok(settings) => settings,
                Err(e) => return error(422, &e.to_string()),
            }
        };
        let mut state = self.state.lock().unwrap();
        if state.buckets.contains_key(bucket) {
            return error(409, &format!("Bucket '{bucket}' already exists"));
        }
        state.buckets.insert(
            bucket.to_string(),
            StoredBucket {
                settings,
                entries: Entries::new(),
            },
        );
        empty(StatusCode::OK)
    }

    fn remove_bucket(&self, bucket: &str) -> HttpResponse {
        match self.state.lock().unwrap().buckets.remove(bucket) {
            Some(_) => empty(StatusCode::OK),
            None => bucket_not_found(bucket),
        }
    }

    fn write_single(
        &self,
        bucket: &str,
        entry: &str,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> HttpResponse {
        let Some(timestamp) = query.get("ts").and_then(|ts| ts.parse::<u64>().ok()) else {
            return error(422, "'ts' parameter is required");
        };
        let content_type = get_header(headers, CONTENT_TYPE.as_str())
            .unwrap()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let labels = headers
            .iter()
            .filter_map(|(name, value)| {
                name.as_str()
                    .strip_prefix(LABEL_PREFIX)
                    .map(|key| (key.to_string(), header_str(key, value).unwrap().to_string()))
            })
            .collect();

        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.buckets.get_mut(bucket) else {
            return bucket_not_found(bucket);
        };
        let records = stored.entries.entry(entry.to_string()).or_default();
        if records.contains_key(&timestamp) {
            return error(409, &conflict(timestamp));
        }
        records.insert(
            timestamp,
            StoredRecord {
                data: body,
                content_type,
                labels,
            },
        );
        empty(StatusCode::OK)
    }

    fn read_single(
        &self,
        bucket: &str,
        entry: &str,
        query: &HashMap<String, String>,
        head: bool,
    ) -> HttpResponse {
        let Some(timestamp) = query.get("ts").and_then(|ts| ts.parse::<u64>().ok()) else {
            return error(422, "'ts' parameter is required");
        };
        let state = self.state.lock().unwrap();
        let Some(record) = state
            .buckets
            .get(bucket)
            .and_then(|stored| stored.entries.get(entry))
            .and_then(|records| records.get(&timestamp))
        else {
            return error(404, &format!("No record with timestamp {timestamp}"));
        };

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, TIME_HEADER, &timestamp.to_string()).unwrap();
        insert_header(&mut headers, CONTENT_TYPE.as_str(), &record.content_type).unwrap();
        insert_header(
            &mut headers,
            CONTENT_LENGTH.as_str(),
            &record.data.len().to_string(),
        )
        .unwrap();
        for (key, value) in &record.labels {
            insert_header(&mut headers, &format!("{LABEL_PREFIX}{key}"), value).unwrap();
        }
        let body = if head { Bytes::new() } else { record.data.clone() };
        respond(StatusCode::OK, headers, body)
    }

    fn write_batch(
        &self,
        bucket: &str,
        entry: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> HttpResponse {
        let records = match v1::decode(headers, entry) {
            Ok(records) => records,
            Err(e) => return error(422, &e.to_string()),
        };
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.buckets.get_mut(bucket) else {
            return bucket_not_found(bucket);
        };
        let stored = stored.entries.entry(entry.to_string()).or_default();

        let mut response = HeaderMap::new();
        let mut offset = 0;
        for record in records {
            let data = body.slice(offset..offset + record.size as usize);
            offset += record.size as usize;
            if stored.contains_key(&record.timestamp) {
                insert_header(
                    &mut response,
                    &format!("{ERROR_PREFIX}{}", record.timestamp),
                    &format!("409,{}", conflict(record.timestamp)),
                )
                .unwrap();
                continue;
            }
            stored.insert(
                record.timestamp,
                StoredRecord {
                    data,
                    content_type: record.content_type,
                    labels: record.labels,
                },
            );
        }
        respond(StatusCode::OK, response, Bytes::new())
    }

    fn write_record_batch(&self, bucket: &str, headers: &HeaderMap, body: Bytes) -> HttpResponse {
        let records = match v2::decode(headers) {
            Ok(records) => records,
            Err(e) => return error(422, &e.to_string()),
        };
        let entries: Vec<String> = get_header(headers, ENTRIES_HEADER)
            .unwrap()
            .unwrap_or_default()
            .split(',')
            .map(|name| decode_name(name).unwrap())
            .collect();
        let start_ts: u64 = get_header(headers, START_TS_HEADER)
            .unwrap()
            .unwrap_or("0")
            .parse()
            .unwrap();

        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.buckets.get_mut(bucket) else {
            return bucket_not_found(bucket);
        };

        let mut response = HeaderMap::new();
        let mut offset = 0;
        for record in records {
            let data = body.slice(offset..offset + record.size as usize);
            offset += record.size as usize;
            let records = stored.entries.entry(record.entry.clone()).or_default();
            if records.contains_key(&record.timestamp) {
                let index = entries.iter().position(|e| *e == record.entry).unwrap();
                insert_header(
                    &mut response,
                    &format!("{ERROR_PREFIX}{index}-{}", record.timestamp - start_ts),
                    &format!("409,{}", conflict(record.timestamp)),
                )
                .unwrap();
                continue;
            }
            records.insert(
                record.timestamp,
                StoredRecord {
                    data,
                    content_type: record.content_type,
                    labels: record.labels,
                },
            );
        }
        if !response.is_empty() {
            for name in [ENTRIES_HEADER, START_TS_HEADER] {
                if let Some(value) = headers.get(name) {
                    response.insert(name, value.clone());
                }
            }
        }
        respond(StatusCode::OK, response, Bytes::new())
    }

    fn start_query(&self, bucket: &str, entry: &str, body: &Bytes) -> HttpResponse {
        let request: QueryRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return error(422, &e.to_string()),
        };
        let head = request.only_metadata.unwrap_or(false);

        let mut state = self.state.lock().unwrap();
        if !state.buckets.contains_key(bucket) {
            return bucket_not_found(bucket);
        }
        state.next_query_id += 1;
        let id = state.next_query_id;
        let ttl = Duration::from_secs(request.ttl.unwrap_or(60));
        let next_start = if self.replay_from_start {
            0
        } else {
            request.start.unwrap_or(0)
        };
        state.queries.insert(
            id,
            StoredQuery {
                bucket: bucket.to_string(),
                entry: entry.to_string(),
                request,
                next_start,
                matched: 0,
                returned: 0,
                last_each_s: None,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );

        if !self.inline_first_page {
            return json(&QueryInfo { id });
        }
        let (page, done) = self.take_page(&mut state, id);
        if page.is_empty() && !done {
            return json(&QueryInfo { id });
        }
        if done {
            state.queries.remove(&id);
        }
        let mut response = batch_response(page, head, done);
        insert_header(&mut response.headers, QUERY_ID_HEADER, &id.to_string()).unwrap();
        response
    }

    fn fetch(&self, query: &HashMap<String, String>, head: bool) -> HttpResponse {
        let Some(id) = query.get("q").and_then(|id| id.parse::<u64>().ok()) else {
            return error(422, "'q' parameter is required");
        };
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let alive = state
            .queries
            .get(&id)
            .is_some_and(|query| query.expires_at > now);
        if !alive {
            state.queries.remove(&id);
            return error(404, &format!("Query {id} not found and it might have expired"));
        }
        if let Some(query) = state.queries.get_mut(&id) {
            query.expires_at = now + query.ttl;
        }

        let (page, done) = self.take_page(&mut state, id);
        if done {
            state.queries.remove(&id);
        }
        if page.is_empty() {
            return empty(StatusCode::NO_CONTENT);
        }
        batch_response(page, head, done)
    }

    /// Next page of the query and whether the query is complete with it.
    fn take_page(&self, state: &mut State, id: u64) -> (Page, bool) {
        let State {
            buckets,
            queries,
            failed_reads,
            ..
        } = state;
        let Some(query) = queries.get_mut(&id) else {
            return (Vec::new(), true);
        };
        let empty_entry = BTreeMap::new();
        let records = buckets
            .get(&query.bucket)
            .and_then(|stored| stored.entries.get(&query.entry))
            .unwrap_or(&empty_entry);
        let request = &query.request;
        let before_stop = |ts: u64| request.stop.map_or(true, |stop| ts < stop);

        let mut page = Vec::new();
        let mut limit_reached = request.limit.is_some_and(|limit| query.returned >= limit);
        for (ts, record) in records.range(query.next_start..) {
            if limit_reached || page.len() >= self.page_limit || !before_stop(*ts) {
                break;
            }
            query.next_start = ts + 1;
            if !self.accepts(request, &record.labels) {
                continue;
            }
            query.matched += 1;
            if let Some(each_n) = request.each_n {
                if (query.matched - 1) % each_n != 0 {
                    continue;
                }
            }
            if let Some(each_s) = request.each_s {
                if let Some(last) = query.last_each_s {
                    if ((ts - last) as f64) < each_s * 1_000_000.0 {
                        continue;
                    }
                }
                query.last_each_s = Some(*ts);
            }

            let failure = failed_reads
                .get(&(query.bucket.clone(), query.entry.clone(), *ts))
                .cloned();
            page.push((*ts, record.clone(), failure));
            query.returned += 1;
            limit_reached = request.limit.is_some_and(|limit| query.returned >= limit);
        }

        let remaining = records
            .range(query.next_start..)
            .next()
            .is_some_and(|(ts, _)| before_stop(*ts));
        let continuous = request.continuous.unwrap_or(false);
        let done = limit_reached || (!continuous && !remaining);
        (page, done)
    }

    fn accepts(&self, request: &QueryRequest, labels: &Labels) -> bool {
        let included = request
            .include
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value));
        let excluded = !request.exclude.is_empty()
            && request
                .exclude
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value));
        let when = !self.evaluate_when
            || request
                .when
                .as_ref()
                .map_or(true, |when| when.matches(labels));
        included && !excluded && when
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let method = request.method.to_string();
        let segments: Vec<String> = request.segments().map(str::to_string).collect();
        let query: HashMap<String, String> = request.query.iter().cloned().collect();
        let headers = request.headers.clone();
        let body = read_body(request.body).await?;
        self.state
            .lock()
            .unwrap()
            .requests
            .push(format!("{method} /{}", segments.join("/")));

        let path: Vec<&str> = segments.iter().map(String::as_str).collect();
        let mut response = match (method.as_str(), path.as_slice()) {
            ("GET", ["info"]) => self.server_info(),
            ("GET", ["list"]) => self.list(),
            ("GET", ["b", bucket]) => self.get_bucket(bucket, false),
            ("HEAD", ["b", bucket]) => self.get_bucket(bucket, true),
            ("POST", ["b", bucket]) => self.create_bucket_route(bucket, &body),
            ("DELETE", ["b", bucket]) => self.remove_bucket(bucket),
            ("POST", ["b", bucket, entry]) => {
                self.write_single(bucket, entry, &query, &headers, body)
            }
            ("GET", ["b", bucket, entry]) => self.read_single(bucket, entry, &query, false),
            ("HEAD", ["b", bucket, entry]) => self.read_single(bucket, entry, &query, true),
            ("POST", ["b", bucket, entry, "batch"]) => {
                self.write_batch(bucket, entry, &headers, body)
            }
            ("POST", ["b", bucket, entry, "q"]) => self.start_query(bucket, entry, &body),
            ("GET", ["b", _, _, "batch"]) => self.fetch(&query, false),
            ("HEAD", ["b", _, _, "batch"]) => self.fetch(&query, true),
            ("POST", ["io", bucket, "write"]) => self.write_record_batch(bucket, &headers, body),
            _ => error(404, "Not found"),
        };
        insert_header(&mut response.headers, API_HEADER, &self.api_version).unwrap();
        Ok(response)
    }
}

pub fn test_client(server: &Arc<FakeServer>) -> Client {
    test_client_with(server, ClientConfig::default())
}

pub fn test_client_with(server: &Arc<FakeServer>, config: ClientConfig) -> Client {
    Client::with_transport(config, server.clone())
}

fn bucket_info(name: &str, stored: &StoredBucket) -> BucketInfo {
    let timestamps = stored.entries.values().flat_map(|records| records.keys());
    BucketInfo {
        name: name.to_string(),
        entry_count: stored.entries.len() as u64,
        size: stored
            .entries
            .values()
            .flat_map(|records| records.values())
            .map(|record| record.data.len() as u64)
            .sum(),
        oldest_record: timestamps.clone().min().copied().unwrap_or(0),
        latest_record: timestamps.max().copied().unwrap_or(0),
    }
}

fn batch_response(page: Page, head: bool, done: bool) -> HttpResponse {
    let mut batch = Batch::new();
    let mut failures = Vec::new();
    for (timestamp, record, failure) in page {
        match failure {
            Some((status, message)) => failures.push((timestamp, status, message)),
            None => {
                batch
                    .add(timestamp, record.data)
                    .unwrap()
                    .content_type(record.content_type)
                    .labels(record.labels);
            }
        }
    }
    let encoded = batch.encode().unwrap();
    let mut headers = encoded.headers;
    for (timestamp, status, message) in failures {
        insert_header(
            &mut headers,
            &format!("{ERROR_PREFIX}{timestamp}"),
            &format!("{status},{message}"),
        )
        .unwrap();
    }
    if done {
        insert_header(&mut headers, LAST_HEADER, "true").unwrap();
    }
    HttpResponse {
        status: StatusCode::OK,
        headers,
        body: if head {
            stream::empty().boxed()
        } else {
            encoded.body
        },
    }
}

async fn read_body(body: Body) -> Result<Bytes> {
    Ok(match body {
        Body::Empty => Bytes::new(),
        Body::Bytes(bytes) => bytes,
        Body::Stream { mut stream, .. } => {
            let mut data = BytesMut::new();
            while let Some(chunk) = stream.try_next().await? {
                data.extend_from_slice(&chunk);
            }
            data.freeze()
        }
    })
}

fn conflict(timestamp: u64) -> String {
    format!("A record with timestamp {timestamp} already exists")
}

fn respond(status: StatusCode, headers: HeaderMap, body: Bytes) -> HttpResponse {
    HttpResponse {
        status,
        headers,
        body: stream::once(async move { Ok(body) }).boxed(),
    }
}

fn empty(status: StatusCode) -> HttpResponse {
    respond(status, HeaderMap::new(), Bytes::new())
}

fn json<T: Serialize>(value: &T) -> HttpResponse {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, CONTENT_TYPE.as_str(), "application/json").unwrap();
    respond(
        StatusCode::OK,
        headers,
        Bytes::from(serde_json::to_vec(value).unwrap()),
    )
}

fn error(status: u16, message: &str) -> HttpResponse {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, ERROR_HEADER, message).unwrap();
    respond(StatusCode::from_u16(status).unwrap(), headers, Bytes::new())
}

fn bucket_not_found(bucket: &str) -> HttpResponse {
    error(404, &format!("Bucket '{bucket}' is not found"))
}
