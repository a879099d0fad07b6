//! Pull-based paging over a backend cursor.
//!
//! The cursor owns the checked-out connection, so releasing the connection
//! is dropping the cursor. [`open`] guarantees that happens exactly once:
//! when the backend reports no more rows, when a read fails, or when the
//! consumer drops the stream early.

use std::collections::VecDeque;

use futures_core::future::BoxFuture;
use futures_util::{StreamExt, stream};

use crate::Error;

use super::{Row, RowStream};

pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Backend cursor handing out rows page by page.
pub trait RowCursor: Send + 'static {
    /// Reads at most `max_rows` rows. An empty page means the cursor is
    /// exhausted.
    fn read(&mut self, max_rows: usize) -> BoxFuture<'_, Result<Vec<Row>, Error>>;
}

struct BufferedCursor<C> {
    cursor: Option<C>,
    buffer: VecDeque<Row>,
    chunk_size: usize,
    profile: String,
}

impl<C> BufferedCursor<C> {
    fn release(&mut self, reason: &'static str) {
        if let Some(cursor) = self.cursor.take() {
            drop(cursor);
            tracing::debug!(profile = %self.profile, reason, "release connection");
        }
    }
}

impl<C: RowCursor> BufferedCursor<C> {
    async fn fill(&mut self) -> Result<(), Error> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(());
        };
        match cursor.read(self.chunk_size).await {
            Ok(rows) if rows.is_empty() => {
                self.release("data fetched");
                Ok(())
            }
            Ok(rows) => {
                self.buffer.extend(rows);
                Ok(())
            }
            Err(e) => {
                self.release("errors occurred");
                Err(e)
            }
        }
    }

    async fn next_row(&mut self) -> Option<Result<Row, Error>> {
        if self.buffer.is_empty() {
            if let Err(e) = self.fill().await {
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl<C> Drop for BufferedCursor<C> {
    fn drop(&mut self) {
        self.release("stream dropped before exhaustion");
    }
}

/// Reads the first page eagerly, so execution errors surface here rather
/// than on the first pull, then returns a stream that refills its buffer
/// only once it is drained.
pub async fn open<C: RowCursor>(
    cursor: C,
    chunk_size: usize,
    profile: &str,
) -> Result<RowStream, Error> {
    let mut buffered = BufferedCursor {
        cursor: Some(cursor),
        buffer: VecDeque::new(),
        chunk_size: chunk_size.max(1),
        profile: profile.to_string(),
    };
    buffered.fill().await?;
    Ok(stream::unfold(buffered, |mut buffered| async move {
        let row = buffered.next_row().await?;
        Some((row, buffered))
    })
    .boxed())
}
