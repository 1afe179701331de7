//! One response body shared by all records of a batch.
//!
//! The header entries and the body are consumed in lockstep: the body holds
//! the payload of record 0, then record 1, and so on. The cursor owns the
//! active record and the bytes it still owns. Reading a later record spills
//! the unread bytes of the records before it, so every record of the batch
//! stays readable in any order. A batch that is read front to back never
//! buffers more than one chunk.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use data_model::{Error, Result};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::ByteStream;

struct Cursor {
    body: ByteStream,
    timeout: Option<Duration>,
    /// Bytes pulled from the body and not handed out yet.
    carry: Bytes,
    sizes: Vec<u64>,
    active: usize,
    remaining: u64,
    spilled: Vec<VecDeque<Bytes>>,
}

impl Cursor {
    async fn read(&mut self, index: usize, max: usize) -> Result<Option<Bytes>> {
        while self.active < index {
            self.spill_active().await?;
        }
        // empty records are skipped, so the cursor may be past `index` now
        if index < self.active {
            return Ok(take_spilled(&mut self.spilled[index], max));
        }
        if self.active >= self.sizes.len() || self.remaining == 0 {
            return Ok(None);
        }

        let want = self.remaining.min(max as u64) as usize;
        let chunk = self.next_chunk(want).await?;
        self.remaining -= chunk.len() as u64;
        if self.remaining == 0 {
            self.advance().await?;
        }
        Ok(Some(chunk))
    }

    async fn spill_active(&mut self) -> Result<()> {
        let index = self.active;
        debug!(
            record = index,
            bytes = self.remaining,
            "spilling unread payload of batched record"
        );
        while self.remaining > 0 {
            let want = usize::try_from(self.remaining).unwrap_or(usize::MAX);
            let chunk = self.next_chunk(want).await?;
            self.remaining -= chunk.len() as u64;
            self.spilled[index].push_back(chunk);
        }
        self.advance().await
    }

    /// Move to the next record that owns bytes. Past the last one the body
    /// must be exhausted.
    async fn advance(&mut self) -> Result<()> {
        self.active += 1;
        while self.active < self.sizes.len() && self.sizes[self.active] == 0 {
            self.active += 1;
        }
        if self.active < self.sizes.len() {
            self.remaining = self.sizes[self.active];
            return Ok(());
        }
        self.remaining = 0;
        self.check_end().await
    }

    async fn check_end(&mut self) -> Result<()> {
        if !self.carry.is_empty() {
            return Err(trailing_bytes());
        }
        loop {
            match self.poll_body().await? {
                None => return Ok(()),
                Some(chunk) if chunk.is_empty() => continue,
                Some(_) => return Err(trailing_bytes()),
            }
        }
    }

    async fn next_chunk(&mut self, max: usize) -> Result<Bytes> {
        while self.carry.is_empty() {
            match self.poll_body().await? {
                Some(chunk) => self.carry = chunk,
                None => {
                    let expected = self.sizes[self.active];
                    return Err(Error::IncompleteRead {
                        expected,
                        received: expected - self.remaining,
                    });
                }
            }
        }
        let take = max.min(self.carry.len());
        Ok(self.carry.split_to(take))
    }

    async fn poll_body(&mut self) -> Result<Option<Bytes>> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.body.next())
                .await
                .map_err(|_| Error::Timeout(timeout))?
                .transpose(),
            None => self.body.next().await.transpose(),
        }
    }
}

fn take_spilled(spilled: &mut VecDeque<Bytes>, max: usize) -> Option<Bytes> {
    let front = spilled.front_mut()?;
    if front.len() <= max {
        return spilled.pop_front();
    }
    Some(front.split_to(max))
}

fn trailing_bytes() -> Error {
    Error::protocol("response body is longer than the sum of the declared record sizes")
}

/// The shared body. Cloned into a [`Slot`] per record.
#[derive(Clone)]
pub(crate) struct Lockstep {
    cursor: Arc<Mutex<Cursor>>,
}

impl Lockstep {
    /// `sizes` are the bytes each record owns in `body`, in body order.
    pub fn new(body: ByteStream, sizes: Vec<u64>, timeout: Option<Duration>) -> Self {
        let active = sizes.iter().position(|size| *size > 0).unwrap_or(sizes.len());
        let remaining = sizes.get(active).copied().unwrap_or(0);
        let spilled = vec![VecDeque::new(); sizes.len()];
        Self {
            cursor: Arc::new(Mutex::new(Cursor {
                body,
                timeout,
                carry: Bytes::new(),
                sizes,
                active,
                remaining,
                spilled,
            })),
        }
    }

    pub fn slot(&self, index: usize) -> Slot {
        Slot {
            lockstep: self.clone(),
            index,
        }
    }
}

/// Payload of one record inside a [`Lockstep`] body.
pub(crate) struct Slot {
    lockstep: Lockstep,
    index: usize,
}

impl Slot {
    pub async fn read(&mut self, max: usize) -> Result<Option<Bytes>> {
        let mut cursor = self.lockstep.cursor.lock().await;
        cursor.read(self.index, max).await
    }
}
