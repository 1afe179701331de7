//! Streaming client for the ReductStore HTTP API.
//!
//! Records are written singly or in batches and read back as lazy streams:
//! [`Bucket::query`] drains a server-side query cursor batch by batch and
//! [`Bucket::subscribe`] keeps polling for records written after it started.
//! Payloads are never buffered as a whole; every [`Record`] reads its own
//! part of the response body when asked to.

pub mod bucket;
pub mod client;
pub mod config;
pub mod http;
pub mod query;
pub mod subscribe;
pub mod tracing;
pub mod transport;

pub use batch_protocol::{
    Batch, PayloadSource, Record, RecordBatch, RecordHeader, RecordStatus, WriteRecord,
};
pub use bucket::Bucket;
pub use client::Client;
pub use config::ClientConfig;
pub use data_model::{
    Condition, Error, Labels, QueryOptions, QueryOptionsBuilder, Result, SubscribeOptions,
    SubscribeOptionsBuilder, TimeInput,
};
pub use query::RecordStream;
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpRequest, HttpResponse, Transport};

#[cfg(test)]
mod testing;
