use super::{
    ByteReadableState, ByteStream, DefaultStream, ReadableStream, StreamTypeMarker,
};
use crate::platform::{MaybeSend, SharedPtr};
use crate::streams::{
    promise::{Deferred, DeferredFuture},
    ByobReadResult, ByteView, Locked, StreamError, StreamResult, Unlocked,
};
use futures::{channel::oneshot, stream::Stream, FutureExt};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

pub(crate) type ReadRequest<T> = oneshot::Sender<StreamResult<Option<T>>>;
pub(crate) type ReadIntoRequest = oneshot::Sender<StreamResult<ByobReadResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderKind {
    Default,
    Byob,
}

pub(crate) enum ReaderRequests<T> {
    Default(VecDeque<ReadRequest<T>>),
    Byob(VecDeque<ReadIntoRequest>),
}

impl<T> ReaderRequests<T> {
    pub(crate) fn error_pending(&mut self, error: StreamError) {
        match self {
            ReaderRequests::Default(requests) => {
                for request in requests.drain(..) {
                    let _ = request.send(Err(error.clone()));
                }
            }
            ReaderRequests::Byob(requests) => {
                for request in requests.drain(..) {
                    let _ = request.send(Err(error.clone()));
                }
            }
        }
    }
}

/// The lock held by the current reader.
pub(crate) struct ReaderSlot<T> {
    pub(crate) id: u64,
    pub(crate) closed: Deferred<()>,
    pub(crate) requests: ReaderRequests<T>,
}

impl<T> ReaderSlot<T> {
    pub(crate) fn new(id: u64, kind: ReaderKind, closed: Deferred<()>) -> Self {
        let requests = match kind {
            ReaderKind::Default => ReaderRequests::Default(VecDeque::new()),
            ReaderKind::Byob => ReaderRequests::Byob(VecDeque::new()),
        };
        Self {
            id,
            closed,
            requests,
        }
    }
}

// ----------- Read futures -----------
/// Pending result of [`ReadableStreamDefaultReader::read`]. The read request
/// is registered when the future is created, not when it is first polled.
pub struct ReadFuture<T> {
    receiver: oneshot::Receiver<StreamResult<Option<T>>>,
}

impl<T> Future for ReadFuture<T> {
    type Output = StreamResult<Option<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(StreamError::TaskDropped)))
    }
}

/// Pending result of a BYOB read.
pub struct ByobReadFuture {
    receiver: oneshot::Receiver<StreamResult<ByobReadResult>>,
}

impl Future for ByobReadFuture {
    type Output = StreamResult<ByobReadResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(StreamError::TaskDropped)))
    }
}

// ----------- Default Reader -----------
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static, StreamType = DefaultStream>
where
    StreamType: StreamTypeMarker,
{
    stream: ReadableStream<T, StreamType, Locked>,
    lock_id: u64,
}

impl<T, S> ReadableStreamDefaultReader<T, S>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    pub(crate) fn new(stream: ReadableStream<T, S, Locked>, lock_id: u64) -> Self {
        Self { stream, lock_id }
    }

    /// Resolves when the stream closes, rejects with the stored error when it
    /// errors or with [`StreamError::Released`] once the lock is released.
    pub fn closed(&self) -> DeferredFuture<()> {
        self.stream.ops().reader_closed(self.lock_id).wait()
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> DeferredFuture<()> {
        self.stream.ops().reader_cancel(self.lock_id, reason).wait()
    }

    /// Reads the next chunk; `Ok(None)` once the stream is closed.
    pub fn read(&self) -> ReadFuture<T> {
        let (sender, receiver) = oneshot::channel();
        self.stream.ops().read(self.lock_id, sender);
        ReadFuture { receiver }
    }

    /// Reads until the stream closes and returns every chunk.
    pub async fn read_all(&self) -> StreamResult<Vec<T>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Releases the lock. Pending reads reject with [`StreamError::Released`].
    pub fn release_lock(self) -> ReadableStream<T, S, Unlocked> {
        self.stream.ops().release_reader(self.lock_id);
        self.stream.retag::<Unlocked>()
    }
}

impl<T, S> Drop for ReadableStreamDefaultReader<T, S>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    fn drop(&mut self) {
        // no-op if release_lock already ran
        self.stream.ops().release_reader(self.lock_id);
    }
}

// ----------- BYOB Reader -----------
pub struct ReadableStreamBYOBReader {
    stream: ReadableStream<Vec<u8>, ByteStream, Locked>,
    state: SharedPtr<Mutex<ByteReadableState>>,
    lock_id: u64,
}

impl ReadableStreamBYOBReader {
    pub(crate) fn new(
        stream: ReadableStream<Vec<u8>, ByteStream, Locked>,
        state: SharedPtr<Mutex<ByteReadableState>>,
        lock_id: u64,
    ) -> Self {
        Self {
            stream,
            state,
            lock_id,
        }
    }

    pub fn closed(&self) -> DeferredFuture<()> {
        self.stream.ops().reader_closed(self.lock_id).wait()
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> DeferredFuture<()> {
        self.stream.ops().reader_cancel(self.lock_id, reason).wait()
    }

    /// Reads into `view`, resolving as soon as at least one element is
    /// filled.
    pub fn read(&self, view: ByteView) -> ByobReadFuture {
        self.read_with_min(view, 1)
    }

    /// Reads into `view`, resolving once at least `min` elements are filled
    /// or the stream closes.
    pub fn read_with_min(&self, view: ByteView, min: usize) -> ByobReadFuture {
        let (sender, receiver) = oneshot::channel();
        match validate_read_view(&view, min) {
            Ok(()) => self
                .state
                .lock()
                .byob_read(self.lock_id, view, min, sender),
            Err(error) => {
                let _ = sender.send(Err(error));
            }
        }
        ByobReadFuture { receiver }
    }

    pub fn release_lock(self) -> ReadableStream<Vec<u8>, ByteStream, Unlocked> {
        self.stream.ops().release_reader(self.lock_id);
        self.stream.retag::<Unlocked>()
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        self.stream.ops().release_reader(self.lock_id);
    }
}

fn validate_read_view(view: &ByteView, min: usize) -> StreamResult<()> {
    if view.byte_length() == 0 {
        return Err(StreamError::type_error("view must have non-zero byteLength"));
    }
    if view.buffer_len() == 0 {
        return Err(StreamError::type_error(
            "view's buffer must have non-zero byteLength",
        ));
    }
    if min == 0 {
        return Err(StreamError::type_error("options.min must be greater than 0"));
    }
    if min > view.len() {
        return Err(StreamError::range_error(
            "options.min must be less than or equal to view's length",
        ));
    }
    Ok(())
}

// ----------- Async Iterator -----------
/// `futures::Stream` over a readable stream's chunks, created by
/// [`ReadableStream::values`].
pub struct ReadableStreamAsyncIterator<T: MaybeSend + 'static, StreamType = DefaultStream>
where
    StreamType: StreamTypeMarker,
{
    reader: Option<ReadableStreamDefaultReader<T, StreamType>>,
    pending: Option<ReadFuture<T>>,
    prevent_cancel: bool,
}

impl<T, S> ReadableStreamAsyncIterator<T, S>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    pub(crate) fn new(reader: ReadableStreamDefaultReader<T, S>, prevent_cancel: bool) -> Self {
        Self {
            reader: Some(reader),
            pending: None,
            prevent_cancel,
        }
    }

    /// Stops iterating early: cancels the stream unless `prevent_cancel` was
    /// set, then releases the lock.
    pub async fn return_(mut self) -> StreamResult<()> {
        self.pending = None;
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        if self.prevent_cancel {
            drop(reader);
            return Ok(());
        }
        let canceled = reader.cancel(None);
        drop(reader);
        canceled.await
    }
}

// No field is structurally pinned; `pending` is polled via `poll_unpin`.
impl<T, S> Unpin for ReadableStreamAsyncIterator<T, S>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
}

impl<T, S> Stream for ReadableStreamAsyncIterator<T, S>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    type Item = StreamResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(reader) = this.reader.as_ref() else {
            return Poll::Ready(None);
        };
        let pending = this.pending.get_or_insert_with(|| reader.read());
        let result = match pending.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending = None;
        match result {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => {
                this.reader = None;
                Poll::Ready(None)
            }
            Err(error) => {
                this.reader = None;
                Poll::Ready(Some(Err(error)))
            }
        }
    }
}

impl<T, S> Drop for ReadableStreamAsyncIterator<T, S>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            if !self.prevent_cancel {
                // registered synchronously, so it runs without being awaited
                let _ = reader.cancel(None);
            }
        }
    }
}
