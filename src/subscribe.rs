use data_model::SubscribeOptions;
use futures::StreamExt;
use reduct_utils::get_epoch_time_in_us;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    http::HttpClient,
    query::{query, RecordStream},
};

/// Follow an entry: poll for records newer than the last one delivered.
///
/// Every round queries `[cursor_time, +inf)` limited to one page. Each
/// received record moves `cursor_time` past its timestamp, so emitted
/// timestamps strictly increase and a record is never delivered twice, even
/// when a page repeats records the subscription already went past. Records
/// rejected by the `when` predicate still move the cursor. A round that
/// brings nothing new is followed by a pause of `poll_interval`, cut short by
/// `cancel`.
pub(crate) fn subscribe(
    http: HttpClient,
    bucket: String,
    entry: String,
    options: SubscribeOptions,
    cancel: CancellationToken,
) -> RecordStream {
    async_stream::try_stream! {
        let mut cursor_time = options.start.unwrap_or_else(get_epoch_time_in_us);
        let mut emitted = 0u64;
        let reached = |emitted: u64| options.count.is_some_and(|count| emitted >= count);
        debug!(%bucket, %entry, cursor_time, "subscription started");

        'poll: while !cancel.is_cancelled() && !reached(emitted) {
            let mut page = query(
                http.clone(),
                bucket.clone(),
                entry.clone(),
                options.page(cursor_time),
            );

            let mut advanced = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'poll,
                    next = page.next() => next,
                };
                let Some(record) = next else {
                    break;
                };
                let record = record?;

                if record.timestamp() < cursor_time {
                    continue;
                }
                cursor_time = record.timestamp().saturating_add(1);
                advanced = true;

                if !options.when.matches(record.labels()) {
                    continue;
                }
                emitted += 1;
                yield record;
                if reached(emitted) {
                    break 'poll;
                }
            }

            if !advanced {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.poll_interval) => {}
                }
            }
        }
        debug!(%bucket, %entry, emitted, cursor_time, "subscription stopped");
    }
    .boxed()
}
