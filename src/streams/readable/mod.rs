//! Readable streams.
//!
//! A [`ReadableStream`] is a handle onto state shared with its controller and
//! with at most one reader. All queue and state transitions happen
//! synchronously under that state's mutex. The underlying source is owned by
//! a driver future (see [`ReadableStreamBuilder::prepare`]) that runs `start`,
//! `pull` and `cancel` when the state asks for them; the mutex is never held
//! while those futures are polled.

mod byte_controller;
mod default_controller;
mod pipe;
mod reader;
mod source;
mod tee;

pub use byte_controller::{ReadableByteStreamController, ReadableStreamBYOBRequest};
pub use default_controller::ReadableStreamDefaultController;
pub use pipe::{PipeBuilder, ReadableWritablePair, StreamPipeOptions};
pub use reader::{
    ByobReadFuture, ReadFuture, ReadableStreamAsyncIterator, ReadableStreamBYOBReader,
    ReadableStreamDefaultReader,
};
pub use source::{AsyncStreamSource, IteratorSource, ReadableByteSource, ReadableSource};
pub use tee::{ByteTeeBuilder, TeeBuilder};

pub(crate) use byte_controller::ByteReadableState;
pub(crate) use default_controller::DefaultReadableState;
pub(crate) use reader::{ReadIntoRequest, ReadRequest, ReaderKind, ReaderRequests, ReaderSlot};

use super::{
    promise::{Deferred, DeferredFuture},
    ByteLengthQueuingStrategy, ByteView, CountQueuingStrategy, Locked, QueuingStrategy,
    StreamError, StreamResult, Unlocked,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr};
use futures::stream::Stream;
use parking_lot::Mutex;
use std::{future::Future, marker::PhantomData, task::Waker};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Stream Type Markers -----------
#[derive(Debug, Clone, Copy)]
pub struct DefaultStream;
#[derive(Debug, Clone, Copy)]
pub struct ByteStream;

pub trait StreamTypeMarker: MaybeSend + MaybeSync + 'static {}

impl StreamTypeMarker for DefaultStream {}
impl StreamTypeMarker for ByteStream {}

// ----------- Shared Core -----------
pub(crate) struct CancelRequest {
    pub(crate) reason: Option<StreamError>,
    pub(crate) done: Deferred<()>,
}

/// Stream-level state shared by both controller kinds.
pub(crate) struct ReadableCore<T> {
    pub(crate) state: StreamState,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) disturbed: bool,
    pub(crate) reader: Option<ReaderSlot<T>>,
    next_lock_id: u64,
    pub(crate) started: bool,
    pub(crate) pulling: bool,
    pub(crate) pull_again: bool,
    pub(crate) close_requested: bool,
    pub(crate) algorithms_cleared: bool,
    /// Set when a pull has been dispatched but not yet picked up by the driver.
    pub(crate) pull_requested: bool,
    pub(crate) cancel_request: Option<CancelRequest>,
    driver: Option<Waker>,
}

impl<T> ReadableCore<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: StreamState::Readable,
            stored_error: None,
            disturbed: false,
            reader: None,
            next_lock_id: 1,
            started: false,
            pulling: false,
            pull_again: false,
            close_requested: false,
            algorithms_cleared: false,
            pull_requested: false,
            cancel_request: None,
            driver: None,
        }
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && self.state == StreamState::Readable
    }

    pub(crate) fn register_driver(&mut self, waker: &Waker) {
        match &self.driver {
            Some(existing) if existing.will_wake(waker) => {}
            _ => self.driver = Some(waker.clone()),
        }
    }

    pub(crate) fn wake_driver(&mut self) {
        if let Some(waker) = self.driver.take() {
            waker.wake();
        }
    }

    pub(crate) fn is_reader(&self, lock_id: u64) -> bool {
        matches!(&self.reader, Some(slot) if slot.id == lock_id)
    }

    pub(crate) fn has_default_reader(&self) -> bool {
        matches!(
            &self.reader,
            Some(ReaderSlot {
                requests: ReaderRequests::Default(_),
                ..
            })
        )
    }

    pub(crate) fn has_byob_reader(&self) -> bool {
        matches!(
            &self.reader,
            Some(ReaderSlot {
                requests: ReaderRequests::Byob(_),
                ..
            })
        )
    }

    pub(crate) fn num_read_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Default(requests),
                ..
            }) => requests.len(),
            _ => 0,
        }
    }

    pub(crate) fn num_read_into_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Byob(requests),
                ..
            }) => requests.len(),
            _ => 0,
        }
    }

    pub(crate) fn add_read_request(&mut self, request: ReadRequest<T>) {
        match &mut self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Default(requests),
                ..
            }) => requests.push_back(request),
            _ => {
                let _ = request.send(Err(StreamError::Released));
            }
        }
    }

    pub(crate) fn add_read_into_request(&mut self, request: ReadIntoRequest) {
        match &mut self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Byob(requests),
                ..
            }) => requests.push_back(request),
            _ => {
                let _ = request.send(Err(StreamError::Released));
            }
        }
    }

    pub(crate) fn pop_read_request(&mut self) -> Option<ReadRequest<T>> {
        match &mut self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Default(requests),
                ..
            }) => requests.pop_front(),
            _ => None,
        }
    }

    /// Settles the oldest default read request.
    pub(crate) fn fulfill_read_request(&mut self, chunk: T, done: bool) {
        if let Some(request) = self.pop_read_request() {
            let _ = request.send(Ok(if done { None } else { Some(chunk) }));
        }
    }

    /// Settles the oldest BYOB read request, handing the buffer back.
    pub(crate) fn fulfill_read_into_request(&mut self, view: ByteView, done: bool) {
        if let Some(ReaderSlot {
            requests: ReaderRequests::Byob(requests),
            ..
        }) = &mut self.reader
        {
            if let Some(request) = requests.pop_front() {
                let _ = request.send(Ok(super::ByobReadResult {
                    value: Some(view),
                    done,
                }));
            }
        }
    }

    pub(crate) fn acquire(&mut self, kind: ReaderKind) -> StreamResult<u64> {
        if self.reader.is_some() {
            return Err(StreamError::Locked);
        }
        let id = self.next_lock_id;
        self.next_lock_id += 1;

        let closed = Deferred::new();
        match self.state {
            StreamState::Readable => {}
            StreamState::Closed => {
                closed.resolve(());
            }
            StreamState::Errored => {
                closed.reject(self.stored_error.clone().unwrap_or(StreamError::Closed));
            }
        }
        self.reader = Some(ReaderSlot::new(id, kind, closed));
        trace!(lock_id = id, ?kind, "reader acquired");
        Ok(id)
    }

    /// Detaches the reader and rejects whatever it still has outstanding.
    pub(crate) fn release(&mut self) {
        if let Some(mut slot) = self.reader.take() {
            trace!(lock_id = slot.id, "reader released");
            slot.closed.reject(StreamError::Released);
            slot.requests.error_pending(StreamError::Released);
        }
    }

    pub(crate) fn reader_closed(&self, lock_id: u64) -> Deferred<()> {
        match &self.reader {
            Some(slot) if slot.id == lock_id => slot.closed.clone(),
            _ => Deferred::rejected(StreamError::Released),
        }
    }

    pub(crate) fn close(&mut self) {
        if self.state != StreamState::Readable {
            return;
        }
        trace!("readable stream closed");
        self.state = StreamState::Closed;
        if let Some(slot) = &mut self.reader {
            slot.closed.resolve(());
            if let ReaderRequests::Default(requests) = &mut slot.requests {
                for request in requests.drain(..) {
                    let _ = request.send(Ok(None));
                }
            }
        }
        self.wake_driver();
    }

    pub(crate) fn error(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        trace!(%error, "readable stream errored");
        self.state = StreamState::Errored;
        self.stored_error = Some(error.clone());
        if let Some(slot) = &mut self.reader {
            slot.closed.reject(error.clone());
            slot.requests.error_pending(error);
        }
        self.wake_driver();
    }

    pub(crate) fn clear_algorithms(&mut self) {
        self.algorithms_cleared = true;
        self.pull_requested = false;
        self.wake_driver();
    }

    fn stored_error_or_closed(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Closed)
    }
}

/// Per-controller hooks the shared stream algorithms call into.
pub(crate) trait ReadableController: MaybeSend + 'static {
    type Chunk: MaybeSend + 'static;

    fn core(&self) -> &ReadableCore<Self::Chunk>;
    fn core_mut(&mut self) -> &mut ReadableCore<Self::Chunk>;
    fn desired_size(&self) -> Option<f64>;
    /// Serves a default read while the stream is readable.
    fn pull_steps(&mut self, request: ReadRequest<Self::Chunk>);
    /// Drops queued data ahead of the cancel algorithm.
    fn cancel_steps(&mut self);
    fn release_steps(&mut self);
    /// Errors the stream if it is still readable.
    fn error_controller(&mut self, error: StreamError);
}

pub(crate) fn should_call_pull<C: ReadableController + ?Sized>(controller: &C) -> bool {
    let core = controller.core();
    if !core.can_close_or_enqueue() || !core.started || core.algorithms_cleared {
        return false;
    }
    if core.num_read_requests() > 0 || core.num_read_into_requests() > 0 {
        return true;
    }
    controller.desired_size().map_or(false, |size| size > 0.0)
}

pub(crate) fn call_pull_if_needed<C: ReadableController + ?Sized>(controller: &mut C) {
    if !should_call_pull(controller) {
        return;
    }
    let core = controller.core_mut();
    if core.pulling {
        core.pull_again = true;
        return;
    }
    core.pulling = true;
    core.pull_requested = true;
    trace!("pull dispatched");
    core.wake_driver();
}

fn cancel_stream<C: ReadableController + ?Sized>(
    controller: &mut C,
    reason: Option<StreamError>,
) -> Deferred<()> {
    let core = controller.core_mut();
    core.disturbed = true;
    match core.state {
        StreamState::Closed => return Deferred::resolved(()),
        StreamState::Errored => return Deferred::rejected(core.stored_error_or_closed()),
        StreamState::Readable => {}
    }
    debug!(reason = ?reason, "canceling readable stream");
    core.close();
    if let Some(ReaderSlot {
        requests: ReaderRequests::Byob(requests),
        ..
    }) = &mut core.reader
    {
        for request in requests.drain(..) {
            let _ = request.send(Ok(super::ByobReadResult {
                value: None,
                done: true,
            }));
        }
    }

    controller.cancel_steps();
    let core = controller.core_mut();
    let done = Deferred::new();
    if core.algorithms_cleared {
        done.resolve(());
    } else {
        core.cancel_request = Some(CancelRequest {
            reason,
            done: done.clone(),
        });
        core.clear_algorithms();
    }
    done
}

// ----------- Type-erased access -----------
/// Stream operations that do not depend on the controller kind.
pub(crate) trait ReadableStreamOps<T>: MaybeSend + MaybeSync {
    fn state(&self) -> StreamState;
    fn stored_error(&self) -> Option<StreamError>;
    fn locked(&self) -> bool;
    fn disturbed(&self) -> bool;
    fn acquire_default_reader(&self) -> StreamResult<u64>;
    fn is_reader(&self, lock_id: u64) -> bool;
    fn release_reader(&self, lock_id: u64);
    fn read(&self, lock_id: u64, request: ReadRequest<T>);
    fn cancel(&self, reason: Option<StreamError>) -> Deferred<()>;
    fn reader_cancel(&self, lock_id: u64, reason: Option<StreamError>) -> Deferred<()>;
    fn reader_closed(&self, lock_id: u64) -> Deferred<()>;
}

impl<C: ReadableController> ReadableStreamOps<C::Chunk> for Mutex<C>
where
    Mutex<C>: MaybeSend + MaybeSync,
{
    fn state(&self) -> StreamState {
        self.lock().core().state
    }

    fn stored_error(&self) -> Option<StreamError> {
        self.lock().core().stored_error.clone()
    }

    fn locked(&self) -> bool {
        self.lock().core().reader.is_some()
    }

    fn disturbed(&self) -> bool {
        self.lock().core().disturbed
    }

    fn acquire_default_reader(&self) -> StreamResult<u64> {
        self.lock().core_mut().acquire(ReaderKind::Default)
    }

    fn is_reader(&self, lock_id: u64) -> bool {
        self.lock().core().is_reader(lock_id)
    }

    fn release_reader(&self, lock_id: u64) {
        let mut controller = self.lock();
        if !controller.core().is_reader(lock_id) {
            return;
        }
        controller.release_steps();
        controller.core_mut().release();
    }

    fn read(&self, lock_id: u64, request: ReadRequest<C::Chunk>) {
        let mut controller = self.lock();
        let core = controller.core_mut();
        if !core.is_reader(lock_id) {
            let _ = request.send(Err(StreamError::Released));
            return;
        }
        core.disturbed = true;
        let state = core.state;
        match state {
            StreamState::Closed => {
                let _ = request.send(Ok(None));
            }
            StreamState::Errored => {
                let _ = request.send(Err(controller.core().stored_error_or_closed()));
            }
            StreamState::Readable => controller.pull_steps(request),
        }
    }

    fn cancel(&self, reason: Option<StreamError>) -> Deferred<()> {
        cancel_stream(&mut *self.lock(), reason)
    }

    fn reader_cancel(&self, lock_id: u64, reason: Option<StreamError>) -> Deferred<()> {
        let mut controller = self.lock();
        if !controller.core().is_reader(lock_id) {
            return Deferred::rejected(StreamError::Released);
        }
        cancel_stream(&mut *controller, reason)
    }

    fn reader_closed(&self, lock_id: u64) -> Deferred<()> {
        self.lock().core().reader_closed(lock_id)
    }
}

// ----------- ReadableStream -----------
pub struct ReadableStream<T, StreamType = DefaultStream, LockState = Unlocked>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    ops: SharedPtr<dyn ReadableStreamOps<T>>,
    // Present for byte streams only
    byte_state: Option<SharedPtr<Mutex<ByteReadableState>>>,
    _marker: PhantomData<(StreamType, LockState)>,
}

impl<T, S, L> Clone for ReadableStream<T, S, L>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    fn clone(&self) -> Self {
        Self {
            ops: self.ops.clone(),
            byte_state: self.byte_state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, S, L> ReadableStream<T, S, L>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    pub(crate) fn from_ops(
        ops: SharedPtr<dyn ReadableStreamOps<T>>,
        byte_state: Option<SharedPtr<Mutex<ByteReadableState>>>,
    ) -> Self {
        Self {
            ops,
            byte_state,
            _marker: PhantomData,
        }
    }

    pub(crate) fn retag<L2>(&self) -> ReadableStream<T, S, L2> {
        ReadableStream::from_ops(self.ops.clone(), self.byte_state.clone())
    }

    pub(crate) fn ops(&self) -> &SharedPtr<dyn ReadableStreamOps<T>> {
        &self.ops
    }

    pub fn locked(&self) -> bool {
        self.ops.locked()
    }

    pub(crate) fn state(&self) -> StreamState {
        self.ops.state()
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.ops.stored_error()
    }

    /// Whether the stream has ever been read from or canceled.
    pub fn is_disturbed(&self) -> bool {
        self.ops.disturbed()
    }
}

impl<T, S> ReadableStream<T, S, Unlocked>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    /// Cancels the stream. Rejects with [`StreamError::Locked`] while a
    /// reader holds the lock.
    pub fn cancel(&self, reason: Option<StreamError>) -> DeferredFuture<()> {
        if self.ops.locked() {
            return Deferred::rejected(StreamError::Locked).wait();
        }
        self.ops.cancel(reason).wait()
    }

    pub fn get_reader(
        &self,
    ) -> StreamResult<(ReadableStream<T, S, Locked>, ReadableStreamDefaultReader<T, S>)> {
        let lock_id = self.ops.acquire_default_reader()?;
        let locked = self.retag::<Locked>();
        Ok((locked.clone(), ReadableStreamDefaultReader::new(locked, lock_id)))
    }

    /// Async iteration over the remaining chunks. Dropping the iterator
    /// before the end cancels the stream unless `prevent_cancel` is set.
    pub fn values(&self, prevent_cancel: bool) -> StreamResult<ReadableStreamAsyncIterator<T, S>> {
        let (_locked, reader) = self.get_reader()?;
        Ok(ReadableStreamAsyncIterator::new(reader, prevent_cancel))
    }
}

impl ReadableStream<Vec<u8>, ByteStream, Unlocked> {
    pub fn get_byob_reader(
        &self,
    ) -> StreamResult<(ReadableStream<Vec<u8>, ByteStream, Locked>, ReadableStreamBYOBReader)> {
        let state = self.byte_state()?;
        let lock_id = state.lock().core_mut().acquire(ReaderKind::Byob)?;
        let locked = self.retag::<Locked>();
        Ok((
            locked.clone(),
            ReadableStreamBYOBReader::new(locked, state.clone(), lock_id),
        ))
    }
}

impl<L> ReadableStream<Vec<u8>, ByteStream, L> {
    pub(crate) fn byte_state(&self) -> StreamResult<&SharedPtr<Mutex<ByteReadableState>>> {
        self.byte_state
            .as_ref()
            .ok_or_else(|| StreamError::type_error("not a readable byte stream"))
    }
}

// ----------- Construction -----------
impl<T> ReadableStream<T, DefaultStream, Unlocked>
where
    T: MaybeSend + 'static,
{
    pub(crate) fn new_default_parts<Source>(
        source: Source,
        strategy: BoxedStrategy<T>,
    ) -> (
        Self,
        ReadableStreamDefaultController<T>,
        impl Future<Output = ()> + MaybeSend + 'static,
    )
    where
        Source: ReadableSource<T>,
    {
        let (stream, controller) = Self::with_default_controller(strategy);
        let driver = Self::drive_default_source(source, &controller);
        (stream, controller, driver)
    }

    /// Stream and controller without a source yet; see
    /// [`Self::drive_default_source`].
    pub(crate) fn with_default_controller(
        strategy: BoxedStrategy<T>,
    ) -> (Self, ReadableStreamDefaultController<T>) {
        let state = SharedPtr::new(Mutex::new(DefaultReadableState::new(strategy)));
        let controller = ReadableStreamDefaultController::new(state.clone());
        let ops: SharedPtr<dyn ReadableStreamOps<T>> = state;
        (ReadableStream::from_ops(ops, None), controller)
    }

    pub(crate) fn drive_default_source<Source>(
        source: Source,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = ()> + MaybeSend + 'static
    where
        Source: ReadableSource<T>,
    {
        source::drive_default_source(source, controller.shared(), controller.clone())
    }

    /// Returns a builder for this readable stream
    pub fn builder<Source>(source: Source) -> ReadableStreamBuilder<T, Source, DefaultStream>
    where
        Source: ReadableSource<T>,
    {
        ReadableStreamBuilder::new(source)
    }

    /// Create from Vec - shortcut for `ReadableStream::from_iterator(vec.into_iter())`
    pub fn from_vec(
        vec: Vec<T>,
    ) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>, DefaultStream> {
        ReadableStreamBuilder::new(IteratorSource::new(vec.into_iter()))
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>, DefaultStream>
    where
        I: Iterator<Item = T> + MaybeSend + 'static,
    {
        ReadableStreamBuilder::new(IteratorSource::new(iter))
    }

    pub fn from_stream<St>(
        stream: St,
    ) -> ReadableStreamBuilder<T, AsyncStreamSource<St>, DefaultStream>
    where
        St: Stream<Item = T> + Unpin + MaybeSend + 'static,
    {
        ReadableStreamBuilder::new(AsyncStreamSource::new(stream))
    }
}

impl ReadableStream<Vec<u8>, ByteStream, Unlocked> {
    pub(crate) fn new_byte_parts<Source>(
        source: Source,
        high_water_mark: usize,
        auto_allocate_chunk_size: Option<usize>,
    ) -> (
        Self,
        ReadableByteStreamController,
        impl Future<Output = ()> + MaybeSend + 'static,
    )
    where
        Source: ReadableByteSource,
    {
        let (stream, controller) =
            Self::with_byte_controller(high_water_mark, auto_allocate_chunk_size);
        let driver = Self::drive_byte_source(source, &controller);
        (stream, controller, driver)
    }

    pub(crate) fn with_byte_controller(
        high_water_mark: usize,
        auto_allocate_chunk_size: Option<usize>,
    ) -> (Self, ReadableByteStreamController) {
        let state = SharedPtr::new(Mutex::new(ByteReadableState::new(
            high_water_mark,
            auto_allocate_chunk_size,
        )));
        let controller = ReadableByteStreamController::new(state.clone());
        let ops: SharedPtr<dyn ReadableStreamOps<Vec<u8>>> = state.clone();
        (ReadableStream::from_ops(ops, Some(state)), controller)
    }

    pub(crate) fn drive_byte_source<Source>(
        source: Source,
        controller: &ReadableByteStreamController,
    ) -> impl Future<Output = ()> + MaybeSend + 'static
    where
        Source: ReadableByteSource,
    {
        source::drive_byte_source(source, controller.shared(), controller.clone())
    }

    /// Returns a builder for byte streams
    pub fn builder_bytes<Source>(source: Source) -> ReadableStreamBuilder<Vec<u8>, Source, ByteStream>
    where
        Source: ReadableByteSource,
    {
        ReadableStreamBuilder::new_bytes(source)
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableStreamBuilder<T, Source, StreamType = DefaultStream>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    source: Source,
    strategy: BoxedStrategy<T>,
    auto_allocate_chunk_size: Option<usize>,
    _phantom: PhantomData<StreamType>,
}

impl<T, Source> ReadableStreamBuilder<T, Source, DefaultStream>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1)),
            auto_allocate_chunk_size: None,
            _phantom: PhantomData,
        }
    }

    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<T, DefaultStream, Unlocked>,
        impl Future<Output = ()> + MaybeSend + 'static,
    ) {
        let (stream, _controller, driver) =
            ReadableStream::new_default_parts(self.source, self.strategy);
        (stream, driver)
    }

    /// Spawn the driver with the given spawn function
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T, DefaultStream, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

impl<Source> ReadableStreamBuilder<Vec<u8>, Source, ByteStream>
where
    Source: ReadableByteSource,
{
    fn new_bytes(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(ByteLengthQueuingStrategy::new(0)),
            auto_allocate_chunk_size: None,
            _phantom: PhantomData,
        }
    }

    /// Queue limit in bytes. Defaults to 0.
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.strategy = Box::new(ByteLengthQueuingStrategy::new(high_water_mark));
        self
    }

    /// Buffer size allocated for default reads so the source always sees a
    /// BYOB request. Zero disables auto-allocation.
    pub fn auto_allocate_chunk_size(mut self, size: usize) -> Self {
        self.auto_allocate_chunk_size = (size > 0).then_some(size);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<Vec<u8>, ByteStream, Unlocked>,
        impl Future<Output = ()> + MaybeSend + 'static,
    ) {
        let (stream, _controller, driver) = ReadableStream::new_byte_parts(
            self.source,
            self.strategy.high_water_mark(),
            self.auto_allocate_chunk_size,
        );
        (stream, driver)
    }

    /// Spawn the driver with the given spawn function
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<Vec<u8>, ByteStream, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn reads_items_sequentially_from_iterator() {
        let data = vec![1, 2, 3, 4, 5];
        let stream = ReadableStream::from_iterator(data.clone().into_iter()).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();

        for expected in data {
            assert_eq!(reader.read().await.unwrap(), Some(expected));
        }

        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn transitions_to_closed_state_after_exhaustion() {
        let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
        let (locked, reader) = stream.get_reader().unwrap();
        assert_eq!(locked.state(), StreamState::Readable);

        while reader.read().await.unwrap().is_some() {}

        reader.closed().await.unwrap();
        assert_eq!(locked.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn handles_empty_stream_immediately() {
        let empty: Vec<i32> = vec![];
        let stream = ReadableStream::from_iterator(empty.into_iter()).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), None);
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn enforces_stream_locking_correctly() {
        let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);

        assert!(!stream.locked());
        let (locked, reader) = stream.get_reader().unwrap();
        assert!(stream.locked());
        assert!(locked.locked());
        assert!(matches!(stream.get_reader(), Err(StreamError::Locked)));

        let unlocked = reader.release_lock();
        assert!(!unlocked.locked());
        let (_locked, reader) = unlocked.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn reads_from_async_stream_source() {
        let source = stream::iter(vec!["a", "b", "c"]);
        let stream = ReadableStream::from_stream(source).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        assert_eq!(reader.read_all().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancel_on_locked_stream_is_rejected() {
        let stream = ReadableStream::from_vec(vec![1]).spawn(tokio::spawn);
        let (_locked, _reader) = stream.get_reader().unwrap();
        assert!(matches!(stream.cancel(None).await, Err(StreamError::Locked)));
    }

    #[tokio::test]
    async fn cancel_closes_stream_and_resolves_pending_reads() {
        struct Never;
        impl ReadableSource<u8> for Never {
            async fn pull(
                &mut self,
                _controller: &mut ReadableStreamDefaultController<u8>,
            ) -> StreamResult<()> {
                futures::future::pending().await
            }
        }

        let stream = ReadableStream::builder(Never).spawn(tokio::spawn);
        let (locked, reader) = stream.get_reader().unwrap();
        let pending = reader.read();
        reader.cancel(Some("stop".into())).await.unwrap();
        assert_eq!(pending.await.unwrap(), None);
        reader.closed().await.unwrap();
        assert!(locked.is_disturbed());
    }

    #[tokio::test]
    async fn dropping_the_driver_errors_the_stream() {
        let (stream, driver) = ReadableStream::from_vec(vec![1, 2]).prepare();
        drop(driver);
        let (_locked, reader) = stream.get_reader().unwrap();
        let result = timeout(Duration::from_secs(1), reader.read()).await.unwrap();
        assert!(matches!(result, Err(StreamError::TaskDropped)));
    }

    #[tokio::test]
    async fn values_iterates_and_releases_the_lock() {
        let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
        let collected: Vec<i32> = stream
            .values(false)
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec![1, 2, 3]);
        assert!(!stream.locked());
    }
}
