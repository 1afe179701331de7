use std::{
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::Stream;
use pin_project::{pin_project, pinned_drop};

/// Get the elapsed system time since the Unix Epoch in Microseconds
pub fn get_epoch_time_in_us() -> u64 {
    get_epoch_time().as_micros() as u64
}

fn get_epoch_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// A [`Stream`] wrapper that runs a custom action when dropped, whether the
/// inner stream was exhausted or abandoned half way.
#[pin_project(PinnedDrop)]
pub struct StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    #[pin]
    stream: S,
    on_drop: Option<F>,
}

impl<S, F> StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    pub fn new(stream: S, on_drop: F) -> Self {
        Self {
            stream,
            on_drop: Some(on_drop),
        }
    }
}

impl<S, F> Stream for StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().stream.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}

#[pinned_drop]
impl<S, F> PinnedDrop for StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    fn drop(self: Pin<&mut Self>) {
        if let Some(on_drop) = self.project().on_drop.take() {
            on_drop()
        }
    }
}
