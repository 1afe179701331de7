//! Query engine: turns a [`QueryOptions`] into a lazy stream of records.
//!
//! A query is opened with `POST /b/{bucket}/{entry}/q`, which answers with the
//! id of a server-side cursor, or with the first (possibly only) batch of the
//! result inline. The cursor is then drained batch by batch with
//! `GET /b/{bucket}/{entry}/batch?q={id}` until a batch is flagged as the
//! last one or the server has no content left. A continuous query never runs
//! dry: an empty fetch is followed by a pause and another fetch.
//!
//! The protocol has no call to release a cursor. A stream dropped half way
//! leaves it to the server, which forgets the cursor once its ttl elapsed.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use batch_protocol::{decode_batch, is_batch, is_last, query_id, DecodeOptions, Record};
use data_model::{
    query::DEFAULT_POLL_INTERVAL, Error, QueryInfo, QueryOptions, QueryRequest, Result,
};
use futures::{stream::BoxStream, StreamExt};
use reduct_utils::StreamGuard;
use reqwest::{Method, StatusCode};
use tracing::debug;

use crate::{
    http::{with_deadline, HttpClient},
    transport::HttpRequest,
};

pub type RecordStream = BoxStream<'static, Result<Record>>;

#[derive(Default)]
struct Cursor {
    id: AtomicU64,
    open: AtomicBool,
}

/// Ttl of a continuous query without an explicit one: long enough to
/// survive the pause between two fetches.
fn continuous_ttl(poll_interval: Duration) -> u64 {
    poll_interval.as_secs_f64().ceil() as u64 * 2 + 1
}

pub(crate) fn query(
    http: HttpClient,
    bucket: String,
    entry: String,
    options: QueryOptions,
) -> RecordStream {
    let cursor = Arc::new(Cursor::default());
    let guarded = cursor.clone();

    let records = async_stream::try_stream! {
        let timeout = options.timeout.or(http.timeout());
        let poll_interval = options.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        let decode = DecodeOptions {
            entry: entry.clone(),
            head: options.head,
            timeout,
        };

        let mut body = QueryRequest::from(&options);
        if options.continuous && body.ttl.is_none() {
            body.ttl = Some(continuous_ttl(poll_interval));
        }
        let request = HttpRequest::post(format!("/b/{bucket}/{entry}/q")).json(&body)?;
        let response = http.send_with_timeout(request, timeout).await?;

        let (id, done) = if is_batch(&response.headers) {
            let done = is_last(&response.headers)?;
            let id = query_id(&response.headers)?;
            debug!(%bucket, %entry, query_id = ?id, done, "query answered inline");
            for record in decode_batch(&response.headers, response.body, &decode)? {
                yield record;
            }
            (id, done)
        } else {
            let info: QueryInfo = with_deadline(timeout, response.json()).await?;
            (Some(info.id), false)
        };

        if !done {
            let id = id.ok_or_else(|| {
                Error::protocol("query response carries neither a query id nor the whole result")
            })?;
            cursor.id.store(id, Ordering::Relaxed);
            cursor.open.store(true, Ordering::Relaxed);
            debug!(%bucket, %entry, query_id = id, "query cursor opened");

            loop {
                let method = if options.head { Method::HEAD } else { Method::GET };
                let request =
                    HttpRequest::new(method, format!("/b/{bucket}/{entry}/batch")).query("q", id);
                let response = match http.send_with_timeout(request, timeout).await {
                    Err(e) if matches!(e.status(), Some(404 | 410)) => {
                        debug!(query_id = id, error = %e, "query cursor expired");
                        Err(Error::CursorExpired(id))
                    }
                    other => other,
                }?;

                if response.status == StatusCode::NO_CONTENT {
                    if !options.continuous {
                        break;
                    }
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }

                let last = is_last(&response.headers)?;
                for record in decode_batch(&response.headers, response.body, &decode)? {
                    yield record;
                }
                if last {
                    break;
                }
            }

            cursor.open.store(false, Ordering::Relaxed);
            debug!(query_id = id, "query exhausted");
        }
    };

    StreamGuard::new(records, move || {
        if guarded.open.load(Ordering::Relaxed) {
            debug!(
                query_id = guarded.id.load(Ordering::Relaxed),
                "query dropped before the end, the server expires its cursor after the ttl"
            );
        }
    })
    .boxed()
}
