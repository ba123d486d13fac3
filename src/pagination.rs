//! Ordered page iteration with bounded concurrency.
//!
//! Up to `concurrency` page fetches run at once, but items always come out
//! in page order: a page that completes early is buffered until every page
//! before it has been yielded.

use std::collections::VecDeque;
use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::{self, FuturesOrdered, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancelable::spawn_cancelable;
use crate::error::ExecError;

/// Identifies a page of a listing.
///
/// A cursor is only meaningful for the filter parameters it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// Offset/limit pagination. Successive pages are known in advance, so
    /// they can be fetched concurrently.
    Offset { offset: u64, limit: u64 },
    /// Opaque server-issued continuation token. Each page reveals the next
    /// cursor, so traversal is sequential.
    Token(String),
}

impl PageCursor {
    /// Cursor of the first page of an offset listing.
    pub fn first_page(limit: u64) -> Self {
        PageCursor::Offset {
            offset: 0,
            limit: limit.max(1),
        }
    }

    fn successor(&self) -> Option<PageCursor> {
        match self {
            PageCursor::Offset { offset, limit } => Some(PageCursor::Offset {
                offset: offset + limit,
                limit: *limit,
            }),
            PageCursor::Token(_) => None,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Next cursor for token pagination; `None` means this is the last page.
    /// Ignored for offset pagination.
    pub next_cursor: Option<PageCursor>,
    /// Total number of items in the listing, when the server reports it.
    pub total_count: Option<u64>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            total_count: None,
        }
    }

    pub fn with_total_count(mut self, total_count: u64) -> Self {
        self.total_count = Some(total_count);
        self
    }

    pub fn with_next_cursor(mut self, cursor: PageCursor) -> Self {
        self.next_cursor = Some(cursor);
        self
    }
}

type PageFuture<T> = BoxFuture<'static, Result<Page<T>, ExecError>>;

/// Lazy, ordered sequence of items produced by fetching pages.
///
/// Not restartable: once consumed, build a new iterator from the same start
/// cursor to traverse again.
pub struct PageIterator<T, F> {
    fetch: F,
    in_flight: FuturesOrdered<PageFuture<T>>,
    issued: VecDeque<PageCursor>,
    next_cursor: Option<PageCursor>,
    ready: VecDeque<T>,
    total_count: Option<u64>,
    concurrency: usize,
    cancel: CancellationToken,
    done: bool,
    pages_fetched: usize,
}

/// Build a [`PageIterator`] starting at `start`.
///
/// `fetch` is called once per page; the returned futures run as separate
/// tasks. The sequence ends after a page shorter than the page limit, a page
/// reaching the reported total, or a token page without a next cursor. Firing
/// `cancel` stops new fetches, aborts the ones in flight and yields a single
/// [`ExecError::Canceled`].
pub fn iterate_pages<T, F, Fut>(
    fetch: F,
    start: PageCursor,
    concurrency: usize,
    cancel: CancellationToken,
) -> PageIterator<T, F>
where
    T: Send + 'static,
    F: FnMut(PageCursor) -> Fut,
    Fut: Future<Output = Result<Page<T>, ExecError>> + Send + 'static,
{
    PageIterator {
        fetch,
        in_flight: FuturesOrdered::new(),
        issued: VecDeque::new(),
        next_cursor: Some(start),
        ready: VecDeque::new(),
        total_count: None,
        concurrency: concurrency.max(1),
        cancel,
        done: false,
        pages_fetched: 0,
    }
}

impl<T, F, Fut> PageIterator<T, F>
where
    T: Send + 'static,
    F: FnMut(PageCursor) -> Fut,
    Fut: Future<Output = Result<Page<T>, ExecError>> + Send + 'static,
{
    /// Next item, `None` once the sequence is over.
    pub async fn next(&mut self) -> Option<Result<T, ExecError>> {
        loop {
            if self.done && self.ready.is_empty() {
                return None;
            }
            if self.cancel.is_cancelled() {
                return Some(Err(self.abort_canceled()));
            }
            if let Some(item) = self.ready.pop_front() {
                return Some(Ok(item));
            }

            self.issue_fetches();
            if self.in_flight.is_empty() {
                self.done = true;
                return None;
            }

            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                page = self.in_flight.next() => Some(page),
            };

            match outcome {
                None => return Some(Err(self.abort_canceled())),
                Some(None) => {
                    self.done = true;
                    return None;
                }
                Some(Some(Ok(page))) => {
                    let Some(cursor) = self.issued.pop_front() else {
                        self.done = true;
                        return None;
                    };
                    self.accept(cursor, page);
                }
                Some(Some(Err(e))) => {
                    debug!("Page fetch failed, aborting iteration: {}", e);
                    self.stop_fetching();
                    self.ready.clear();
                    return Some(Err(e));
                }
            }
        }
    }

    /// Drain the whole sequence into a vector, stopping at the first error.
    pub async fn try_collect(mut self) -> Result<Vec<T>, ExecError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Turn the iterator into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<T, ExecError>> {
        stream::unfold(self, |mut iterator| async move {
            let item = iterator.next().await?;
            Some((item, iterator))
        })
    }

    /// Number of pages fetched to completion so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    fn issue_fetches(&mut self) {
        while !self.done && self.in_flight.len() < self.concurrency {
            let Some(cursor) = self.next_cursor.take() else {
                break;
            };
            if let (PageCursor::Offset { offset, .. }, Some(total)) = (&cursor, self.total_count) {
                if *offset >= total {
                    break;
                }
            }

            self.next_cursor = cursor.successor();
            let (task, _handle) = spawn_cancelable((self.fetch)(cursor.clone()));
            self.issued.push_back(cursor);
            self.in_flight.push_back(Box::pin(async move {
                let page: Result<Page<T>, ExecError> = task.await?;
                page
            }));
        }
    }

    fn accept(&mut self, cursor: PageCursor, page: Page<T>) {
        self.pages_fetched += 1;
        if let Some(total) = page.total_count {
            self.total_count = Some(total);
        }

        let len = page.items.len() as u64;
        let last = match &cursor {
            PageCursor::Offset { offset, limit } => {
                len < *limit || self.total_count.is_some_and(|total| offset + len >= total)
            }
            PageCursor::Token(_) => page.next_cursor.is_none(),
        };

        if !last && matches!(cursor, PageCursor::Token(_)) {
            self.next_cursor = page.next_cursor;
        }
        self.ready.extend(page.items);

        if last {
            debug!("Reached last page after {} pages", self.pages_fetched);
            self.stop_fetching();
        }
    }

    fn stop_fetching(&mut self) {
        // Dropping the pending futures aborts their tasks.
        self.in_flight = FuturesOrdered::new();
        self.issued.clear();
        self.next_cursor = None;
        self.done = true;
    }

    fn abort_canceled(&mut self) -> ExecError {
        debug!("Page iteration canceled");
        self.stop_fetching();
        self.ready.clear();
        ExecError::Canceled
    }
}
