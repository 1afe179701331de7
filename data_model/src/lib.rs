pub mod condition;
pub mod error;
pub mod query;
pub mod time;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

pub use condition::{Condition, Expression, Operator};
pub use error::{Error, Result};
pub use query::{
    QueryOptions, QueryOptionsBuilder, QueryRequest, SubscribeOptions, SubscribeOptionsBuilder,
};
pub use time::{to_micros, TimeInput};

/// Labels of a record. Keys are unique and iterate in sorted order, which
/// keeps every header the client encodes deterministic.
pub type Labels = BTreeMap<String, String>;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum QuotaType {
    None,
    Fifo,
    Hard,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_block_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_block_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_type: Option<QuotaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub entry_count: u64,
    pub size: u64,
    /// microseconds
    pub oldest_record: u64,
    /// microseconds
    pub latest_record: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
    pub block_count: u64,
    pub record_count: u64,
    pub oldest_record: u64,
    pub latest_record: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullBucketInfo {
    pub info: BucketInfo,
    pub settings: BucketSettings,
    #[serde(default)]
    pub entries: Vec<EntryInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    pub bucket: BucketSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub bucket_count: u64,
    pub usage: u64,
    /// seconds
    pub uptime: u64,
    pub oldest_record: u64,
    pub latest_record: u64,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketList {
    pub buckets: Vec<BucketInfo>,
}

/// Body of a non-inline query initiation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub id: u64,
}
