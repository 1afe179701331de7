use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{condition::Condition, error::Error, Labels};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PAGE_SIZE: u64 = 100;

/// What a query asks for. Built with [`QueryOptionsBuilder`]:
///
/// ```
/// use data_model::{Condition, QueryOptionsBuilder};
///
/// let options = QueryOptionsBuilder::default()
///     .start(1_000u64)
///     .when(Condition::new().gt("score", 10))
///     .each_n(2u64)
///     .build()
///     .unwrap();
/// assert_eq!(options.each_n, Some(2));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Builder)]
#[builder(
    default,
    build_fn(validate = "Self::validate", error = "Error")
)]
pub struct QueryOptions {
    /// Inclusive lower bound in microseconds; open when unset.
    #[builder(setter(into, strip_option))]
    pub start: Option<u64>,
    /// Exclusive upper bound in microseconds; open when unset.
    #[builder(setter(into, strip_option))]
    pub stop: Option<u64>,
    #[builder(setter(into))]
    pub when: Condition,
    /// Evaluate `when` strictly: a missing label is an error on the server
    /// instead of a non-match.
    pub strict: bool,
    #[builder(setter(into))]
    pub include: Labels,
    #[builder(setter(into))]
    pub exclude: Labels,
    /// Return only every Nth matching record, starting with the first.
    #[builder(setter(into, strip_option))]
    pub each_n: Option<u64>,
    /// Return at most one matching record per S seconds window.
    #[builder(setter(into, strip_option))]
    pub each_s: Option<f64>,
    #[builder(setter(into, strip_option))]
    pub limit: Option<u64>,
    /// Lifetime of the server-side cursor between two fetches.
    #[builder(setter(into, strip_option))]
    pub ttl: Option<Duration>,
    /// Fetch metadata only.
    pub head: bool,
    /// Keep the cursor alive when the result runs dry instead of ending.
    pub continuous: bool,
    /// Pause between two fetches of a continuous query that found nothing
    /// new; [`DEFAULT_POLL_INTERVAL`] when unset.
    #[builder(setter(into, strip_option))]
    pub poll_interval: Option<Duration>,
    /// Deadline applied to every network call of the query.
    #[builder(setter(into, strip_option))]
    pub timeout: Option<Duration>,
}

impl QueryOptionsBuilder {
    fn validate(&self) -> Result<(), Error> {
        if let Some(Some(0)) = self.each_n {
            return Err(Error::invalid_argument("each_n must be greater than 0"));
        }
        if let Some(Some(each_s)) = self.each_s {
            if !each_s.is_finite() || each_s <= 0.0 {
                return Err(Error::invalid_argument("each_s must be a positive number"));
            }
        }
        if let Some(Some(poll_interval)) = self.poll_interval {
            if poll_interval.is_zero() {
                return Err(Error::invalid_argument("poll_interval must not be zero"));
            }
        }
        if let (Some(Some(start)), Some(Some(stop))) = (self.start, self.stop) {
            if start > stop {
                return Err(Error::invalid_argument(format!(
                    "start {start} is after stop {stop}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Query,
    Remove,
}

/// JSON body of `POST /b/{bucket}/{entry}/q`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_type: QueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<u64>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub include: Labels,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub exclude: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each_n: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuous: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_metadata: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl From<&QueryOptions> for QueryRequest {
    fn from(options: &QueryOptions) -> Self {
        Self {
            query_type: QueryType::Query,
            start: options.start,
            stop: options.stop,
            include: options.include.clone(),
            exclude: options.exclude.clone(),
            each_s: options.each_s,
            each_n: options.each_n,
            limit: options.limit,
            // the server counts whole seconds; never round a short ttl down to 0
            ttl: options
                .ttl
                .map(|ttl| ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)),
            continuous: options.continuous.then_some(true),
            only_metadata: options.head.then_some(true),
            when: (!options.when.is_empty()).then(|| options.when.clone()),
            strict: (!options.when.is_empty() && options.strict).then_some(true),
        }
    }
}

/// What a subscription follows. Each poll runs a query over
/// `[cursor_time, +inf)` limited to `page_size` records.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "Error"))]
pub struct SubscribeOptions {
    /// First timestamp to deliver; the current time when unset.
    #[builder(default, setter(into, strip_option))]
    pub start: Option<u64>,
    #[builder(default = "DEFAULT_POLL_INTERVAL")]
    pub poll_interval: Duration,
    #[builder(default = "DEFAULT_PAGE_SIZE")]
    pub page_size: u64,
    /// Sent to the server and evaluated again on every received record.
    #[builder(default, setter(into))]
    pub when: Condition,
    #[builder(default, setter(into))]
    pub include: Labels,
    #[builder(default, setter(into))]
    pub exclude: Labels,
    /// Stop after this many records were emitted.
    #[builder(default, setter(into, strip_option))]
    pub count: Option<u64>,
    #[builder(default)]
    pub head: bool,
    #[builder(default, setter(into, strip_option))]
    pub timeout: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
            when: Condition::default(),
            include: Labels::default(),
            exclude: Labels::default(),
            count: None,
            head: false,
            timeout: None,
        }
    }
}

impl SubscribeOptionsBuilder {
    fn validate(&self) -> Result<(), Error> {
        if let Some(0) = self.page_size {
            return Err(Error::invalid_argument("page_size must be greater than 0"));
        }
        if let Some(poll_interval) = self.poll_interval {
            if poll_interval.is_zero() {
                return Err(Error::invalid_argument("poll_interval must not be zero"));
            }
        }
        Ok(())
    }
}

impl SubscribeOptions {
    /// Options of the page query issued from `cursor_time`.
    pub fn page(&self, cursor_time: u64) -> QueryOptions {
        QueryOptions {
            start: Some(cursor_time),
            when: self.when.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            limit: Some(self.page_size),
            head: self.head,
            timeout: self.timeout,
            ..Default::default()
        }
    }
}
