//! Writable streams.
//!
//! State lives in a [`WritableInner`] behind a mutex shared by the stream
//! handle, the writer and the controller. Writes are queued with their size,
//! and the sink runs on a driver future (see [`WritableStreamBuilder::prepare`])
//! that executes one sink operation at a time.

use super::{
    promise::{Deferred, DeferredFuture},
    queue::SizedQueue,
    AbortController, AbortSignal, CountQueuingStrategy, Locked, QueuingStrategy, StreamError,
    StreamResult, Unlocked,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr};
use futures::{
    channel::oneshot,
    future::{self, poll_fn},
    FutureExt,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Erroring,
    Closed,
    Errored,
}

type WriteRequest = oneshot::Sender<StreamResult<()>>;

enum WriteRecord<T> {
    /// `None` while the chunk is with the sink.
    Chunk(Option<T>),
    Close,
}

enum SinkOp<T> {
    Write(T),
    Close,
    Abort(Option<StreamError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Write,
    Close,
    Abort,
}

struct PendingAbort {
    done: Deferred<()>,
    reason: Option<StreamError>,
    was_already_erroring: bool,
}

struct WriterSlot {
    id: u64,
    ready: Deferred<()>,
    closed: Deferred<()>,
}

impl WriterSlot {
    fn ensure_ready_rejected(&mut self, error: StreamError) {
        if !self.ready.reject(error.clone()) {
            self.ready = Deferred::rejected(error);
        }
    }

    fn ensure_closed_rejected(&mut self, error: StreamError) {
        if !self.closed.reject(error.clone()) {
            self.closed = Deferred::rejected(error);
        }
    }
}

pub(crate) struct WritableInner<T> {
    state: WritableState,
    stored_error: Option<StreamError>,
    writer: Option<WriterSlot>,
    next_lock_id: u64,
    backpressure: bool,
    write_requests: VecDeque<WriteRequest>,
    in_flight_write: Option<WriteRequest>,
    close_request: Option<Deferred<()>>,
    in_flight_close: Option<Deferred<()>>,
    pending_abort: Option<PendingAbort>,
    in_flight_abort: Option<Deferred<()>>,
    queue: SizedQueue<WriteRecord<T>>,
    strategy: BoxedStrategy<T>,
    high_water_mark: f64,
    abort_controller: AbortController,
    started: bool,
    algorithms_cleared: bool,
    op: Option<SinkOp<T>>,
    in_progress: Option<OpKind>,
    driver_gone: bool,
    driver: Option<Waker>,
}

impl<T: MaybeSend + 'static> WritableInner<T> {
    fn new(strategy: BoxedStrategy<T>) -> Self {
        let high_water_mark = strategy.high_water_mark() as f64;
        let mut inner = Self {
            state: WritableState::Writable,
            stored_error: None,
            writer: None,
            next_lock_id: 1,
            backpressure: false,
            write_requests: VecDeque::new(),
            in_flight_write: None,
            close_request: None,
            in_flight_close: None,
            pending_abort: None,
            in_flight_abort: None,
            queue: SizedQueue::new(),
            strategy,
            high_water_mark,
            abort_controller: AbortController::new(),
            started: false,
            algorithms_cleared: false,
            op: None,
            in_progress: None,
            driver_gone: false,
            driver: None,
        };
        let backpressure = inner.get_backpressure();
        inner.update_backpressure(backpressure);
        inner
    }

    fn register_driver(&mut self, waker: &Waker) {
        match &self.driver {
            Some(existing) if existing.will_wake(waker) => {}
            _ => self.driver = Some(waker.clone()),
        }
    }

    fn wake_driver(&mut self) {
        if let Some(waker) = self.driver.take() {
            waker.wake();
        }
    }

    fn is_writer(&self, lock_id: u64) -> bool {
        matches!(&self.writer, Some(slot) if slot.id == lock_id)
    }

    fn stored_error_or_aborted(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or(StreamError::Aborted(None))
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn desired_size(&self) -> f64 {
        self.high_water_mark - self.queue.total_size()
    }

    fn get_backpressure(&self) -> bool {
        self.desired_size() <= 0.0
    }

    fn update_backpressure(&mut self, backpressure: bool) {
        if let Some(writer) = &mut self.writer {
            if backpressure != self.backpressure {
                if backpressure {
                    writer.ready = Deferred::new();
                } else {
                    writer.ready.resolve(());
                }
            }
        }
        self.backpressure = backpressure;
    }

    fn clear_algorithms(&mut self) {
        self.algorithms_cleared = true;
        self.wake_driver();
    }

    fn dispatch(&mut self, op: SinkOp<T>) {
        let kind = match &op {
            SinkOp::Write(_) => OpKind::Write,
            SinkOp::Close => OpKind::Close,
            SinkOp::Abort(_) => OpKind::Abort,
        };
        if self.driver_gone {
            self.finish_op(kind, Err(StreamError::TaskDropped));
            return;
        }
        self.in_progress = Some(kind);
        self.op = Some(op);
        self.wake_driver();
    }

    fn finish_op(&mut self, kind: OpKind, result: StreamResult<()>) {
        match kind {
            OpKind::Write => self.write_finished(result),
            OpKind::Close => self.close_finished(result),
            OpKind::Abort => self.abort_finished(result),
        }
    }

    // ----------- Erroring -----------
    fn start_erroring(&mut self, reason: StreamError) {
        trace!(%reason, "writable stream erroring");
        self.state = WritableState::Erroring;
        self.stored_error = Some(reason.clone());
        if let Some(writer) = &mut self.writer {
            writer.ensure_ready_rejected(reason);
        }
        if !self.has_operation_in_flight() && self.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        trace!("writable stream errored");
        self.state = WritableState::Errored;
        self.queue.reset();
        let error = self.stored_error_or_aborted();
        for request in self.write_requests.drain(..) {
            let _ = request.send(Err(error.clone()));
        }

        let Some(abort) = self.pending_abort.take() else {
            self.reject_close_and_closed();
            return;
        };
        if abort.was_already_erroring || self.algorithms_cleared {
            if abort.was_already_erroring {
                abort.done.reject(error);
            } else {
                abort.done.resolve(());
            }
            self.reject_close_and_closed();
            return;
        }

        self.in_flight_abort = Some(abort.done);
        self.dispatch(SinkOp::Abort(abort.reason));
        self.clear_algorithms();
    }

    fn reject_close_and_closed(&mut self) {
        let error = self.stored_error_or_aborted();
        if let Some(close) = self.close_request.take() {
            close.reject(error.clone());
        }
        if let Some(writer) = &mut self.writer {
            writer.closed.reject(error);
        }
        self.wake_driver();
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.start_erroring(error);
        } else {
            self.finish_erroring();
        }
    }

    pub(crate) fn error_if_needed(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.clear_algorithms();
            self.start_erroring(error);
        }
    }

    // ----------- Operations -----------
    fn abort(&mut self, reason: Option<StreamError>) -> Deferred<()> {
        if matches!(self.state, WritableState::Closed | WritableState::Errored) {
            return Deferred::resolved(());
        }
        debug!(reason = ?reason, "aborting writable stream");
        self.abort_controller.abort(reason.clone());
        if let Some(pending) = &self.pending_abort {
            return pending.done.clone();
        }

        let was_already_erroring = self.state == WritableState::Erroring;
        let reason = if was_already_erroring { None } else { reason };
        let done = Deferred::new();
        self.pending_abort = Some(PendingAbort {
            done: done.clone(),
            reason: reason.clone(),
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(reason.unwrap_or(StreamError::Aborted(None)));
        }
        done
    }

    fn close_error(&self) -> Option<StreamError> {
        if self.close_queued_or_in_flight() {
            return Some(StreamError::Closing);
        }
        match self.state {
            WritableState::Closed => Some(StreamError::Closed),
            WritableState::Errored => Some(StreamError::type_error(
                "The stream is errored and cannot be closed",
            )),
            _ => None,
        }
    }

    fn close(&mut self) -> Deferred<()> {
        if let Some(error) = self.close_error() {
            return Deferred::rejected(error);
        }
        let done = Deferred::new();
        self.close_request = Some(done.clone());
        if self.backpressure && self.state == WritableState::Writable {
            if let Some(writer) = &self.writer {
                writer.ready.resolve(());
            }
        }
        // zero is always a valid size
        let _ = self.queue.enqueue(WriteRecord::Close, 0.0);
        self.advance_queue();
        done
    }

    fn write(&mut self, chunk: T, request: WriteRequest) {
        let size = self.strategy.size(&chunk);
        let rejection = match self.state {
            WritableState::Errored => Some(self.stored_error_or_aborted()),
            _ if self.close_queued_or_in_flight() => Some(StreamError::Closing),
            WritableState::Closed => Some(StreamError::Closed),
            WritableState::Erroring => Some(self.stored_error_or_aborted()),
            WritableState::Writable => None,
        };
        if let Some(error) = rejection {
            let _ = request.send(Err(error));
            return;
        }

        self.write_requests.push_back(request);
        if let Err(error) = self.queue.enqueue(WriteRecord::Chunk(Some(chunk)), size) {
            self.error_if_needed(error);
            return;
        }
        if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
            let backpressure = self.get_backpressure();
            self.update_backpressure(backpressure);
        }
        self.advance_queue();
    }

    fn advance_queue(&mut self) {
        if !self.started || self.has_operation_in_flight() {
            return;
        }
        if self.state == WritableState::Erroring {
            self.finish_erroring();
            return;
        }
        let next = match self.queue.peek_mut() {
            None => return,
            Some(WriteRecord::Close) => None,
            Some(WriteRecord::Chunk(chunk)) => match chunk.take() {
                Some(chunk) => Some(chunk),
                None => return,
            },
        };
        match next {
            None => self.process_close(),
            Some(chunk) => self.process_write(chunk),
        }
    }

    fn process_close(&mut self) {
        self.in_flight_close = self.close_request.take();
        self.queue.dequeue();
        trace!("closing writable sink");
        self.dispatch(SinkOp::Close);
        self.clear_algorithms();
    }

    fn process_write(&mut self, chunk: T) {
        self.in_flight_write = self.write_requests.pop_front();
        self.dispatch(SinkOp::Write(chunk));
    }

    // ----------- Sink completions -----------
    fn start_finished(&mut self, result: StreamResult<()>) {
        self.started = true;
        match result {
            Ok(()) => {
                trace!("writable sink started");
                self.advance_queue();
            }
            Err(error) => self.deal_with_rejection(error),
        }
    }

    fn write_finished(&mut self, result: StreamResult<()>) {
        self.in_progress = None;
        match result {
            Ok(()) => {
                if let Some(request) = self.in_flight_write.take() {
                    let _ = request.send(Ok(()));
                }
                self.queue.dequeue();
                if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
                    let backpressure = self.get_backpressure();
                    self.update_backpressure(backpressure);
                }
                self.advance_queue();
            }
            Err(error) => {
                if self.state == WritableState::Writable {
                    self.clear_algorithms();
                }
                if let Some(request) = self.in_flight_write.take() {
                    let _ = request.send(Err(error.clone()));
                }
                self.deal_with_rejection(error);
            }
        }
    }

    fn close_finished(&mut self, result: StreamResult<()>) {
        self.in_progress = None;
        match result {
            Ok(()) => {
                if let Some(close) = self.in_flight_close.take() {
                    close.resolve(());
                }
                if self.state == WritableState::Erroring {
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort.take() {
                        abort.done.resolve(());
                    }
                }
                trace!("writable stream closed");
                self.state = WritableState::Closed;
                if let Some(writer) = &self.writer {
                    writer.closed.resolve(());
                }
                self.wake_driver();
            }
            Err(error) => {
                if let Some(close) = self.in_flight_close.take() {
                    close.reject(error.clone());
                }
                if let Some(abort) = self.pending_abort.take() {
                    abort.done.reject(error.clone());
                }
                self.deal_with_rejection(error);
            }
        }
    }

    fn abort_finished(&mut self, result: StreamResult<()>) {
        self.in_progress = None;
        if let Some(done) = self.in_flight_abort.take() {
            done.settle(result);
        }
        self.reject_close_and_closed();
    }

    // ----------- Writer lock -----------
    fn acquire_writer(&mut self) -> StreamResult<u64> {
        if self.writer.is_some() {
            return Err(StreamError::Locked);
        }
        let id = self.next_lock_id;
        self.next_lock_id += 1;

        let (ready, closed) = match self.state {
            WritableState::Writable => {
                let ready = if !self.close_queued_or_in_flight() && self.backpressure {
                    Deferred::new()
                } else {
                    Deferred::resolved(())
                };
                (ready, Deferred::new())
            }
            WritableState::Erroring => (
                Deferred::rejected(self.stored_error_or_aborted()),
                Deferred::new(),
            ),
            WritableState::Closed => (Deferred::resolved(()), Deferred::resolved(())),
            WritableState::Errored => {
                let error = self.stored_error_or_aborted();
                (Deferred::rejected(error.clone()), Deferred::rejected(error))
            }
        };
        self.writer = Some(WriterSlot { id, ready, closed });
        trace!(lock_id = id, "writer acquired");
        Ok(id)
    }

    fn release_writer(&mut self, lock_id: u64) {
        if !self.is_writer(lock_id) {
            return;
        }
        if let Some(mut slot) = self.writer.take() {
            trace!(lock_id, "writer released");
            slot.ensure_ready_rejected(StreamError::Released);
            slot.ensure_closed_rejected(StreamError::Released);
        }
    }

    fn writer_ready(&self, lock_id: u64) -> Deferred<()> {
        match &self.writer {
            Some(slot) if slot.id == lock_id => slot.ready.clone(),
            _ => Deferred::rejected(StreamError::Released),
        }
    }

    fn writer_closed(&self, lock_id: u64) -> Deferred<()> {
        match &self.writer {
            Some(slot) if slot.id == lock_id => slot.closed.clone(),
            _ => Deferred::rejected(StreamError::Released),
        }
    }

    fn writer_desired_size(&self) -> Option<f64> {
        match self.state {
            WritableState::Errored | WritableState::Erroring => None,
            WritableState::Closed => Some(0.0),
            WritableState::Writable => Some(self.desired_size()),
        }
    }

    fn close_with_error_propagation(&mut self) -> Deferred<()> {
        if self.close_queued_or_in_flight() || self.state == WritableState::Closed {
            return Deferred::resolved(());
        }
        if self.state == WritableState::Errored {
            return Deferred::rejected(self.stored_error_or_aborted());
        }
        self.close()
    }
}

// ----------- Driver -----------
fn next_op<T: MaybeSend + 'static>(
    shared: &SharedPtr<Mutex<WritableInner<T>>>,
) -> impl Future<Output = Option<SinkOp<T>>> + '_ {
    poll_fn(move |cx| {
        let mut inner = shared.lock();
        if let Some(op) = inner.op.take() {
            return Poll::Ready(Some(op));
        }
        let settled = matches!(inner.state, WritableState::Closed | WritableState::Errored);
        if inner.in_progress.is_none() && (inner.algorithms_cleared || settled) {
            return Poll::Ready(None);
        }
        inner.register_driver(cx.waker());
        Poll::Pending
    })
}

/// Fails whatever the sink still owed if the driver goes away early.
struct SinkDriverGuard<T: MaybeSend + 'static> {
    shared: SharedPtr<Mutex<WritableInner<T>>>,
}

impl<T: MaybeSend + 'static> Drop for SinkDriverGuard<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.driver_gone = true;
        inner.op = None;
        if let Some(kind) = inner.in_progress.take() {
            warn!(?kind, "writable stream driver dropped during a sink operation");
            inner.finish_op(kind, Err(StreamError::TaskDropped));
        }
        if matches!(
            inner.state,
            WritableState::Writable | WritableState::Erroring
        ) {
            warn!("writable stream driver dropped before the stream finished");
            inner.started = true;
            inner.deal_with_rejection(StreamError::TaskDropped);
        }
    }
}

fn drive_sink<T, S>(
    sink: S,
    shared: SharedPtr<Mutex<WritableInner<T>>>,
    mut controller: WritableStreamDefaultController,
) -> impl Future<Output = ()> + MaybeSend + 'static
where
    T: MaybeSend + 'static,
    S: WritableSink<T>,
{
    let guard = SinkDriverGuard {
        shared: shared.clone(),
    };

    async move {
        let _guard = guard;
        let mut sink = Some(sink);

        let started = match sink.as_mut() {
            Some(sink) => sink.start(&mut controller).await,
            None => Ok(()),
        };
        shared.lock().start_finished(started);

        while let Some(op) = next_op(&shared).await {
            match op {
                SinkOp::Write(chunk) => {
                    let result = match sink.as_mut() {
                        Some(sink) => sink.write(chunk, &mut controller).await,
                        None => Err(StreamError::Closed),
                    };
                    shared.lock().write_finished(result);
                }
                SinkOp::Close => {
                    let result = match sink.take() {
                        Some(sink) => sink.close().await,
                        None => Ok(()),
                    };
                    shared.lock().close_finished(result);
                }
                SinkOp::Abort(reason) => {
                    let result = match sink.as_mut() {
                        Some(sink) => sink.abort(reason).await,
                        None => Ok(()),
                    };
                    shared.lock().abort_finished(result);
                }
            }
        }
        trace!("writable stream driver finished");
    }
}

// ----------- Sink trait -----------
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink. Never called again before the returned
    /// future completes.
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink once every queued write has finished
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink. Runs after any in-flight write settles.
    fn abort(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

// ----------- Controller -----------
trait WritableControllerOps: MaybeSend + MaybeSync {
    fn error(&self, error: StreamError);
    fn state(&self) -> (WritableState, Option<StreamError>);
}

impl<T: MaybeSend + 'static> WritableControllerOps for Mutex<WritableInner<T>>
where
    Mutex<WritableInner<T>>: MaybeSend + MaybeSync,
{
    fn error(&self, error: StreamError) {
        self.lock().error_if_needed(error);
    }

    fn state(&self) -> (WritableState, Option<StreamError>) {
        let inner = self.lock();
        (inner.state, inner.stored_error.clone())
    }
}

#[derive(Clone)]
pub struct WritableStreamDefaultController {
    ops: SharedPtr<dyn WritableControllerOps>,
    signal: AbortSignal,
}

impl WritableStreamDefaultController {
    /// Errors the stream unless it is already closing down. Queued writes
    /// are rejected once the in-flight one settles.
    pub fn error(&self, error: StreamError) {
        self.ops.error(error);
    }

    /// Fires when the stream is aborted.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Returns `true` if the stream has been aborted.
    ///
    /// This is a synchronous check of the abort flag.
    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }

    /// Returns a future that resolves once the stream is aborted.
    ///
    /// Sink implementors can `select!` on this future alongside their write
    /// work so they stop promptly if the stream aborts:
    ///
    /// ```no_run
    /// # use lws_streams::{StreamError, StreamResult, WritableStreamDefaultController};
    /// # async fn write(controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
    /// tokio::select! {
    ///     _ = controller.abort_future() => Err(StreamError::Aborted(None)),
    ///     _ = async { /* do actual I/O */ } => Ok(()),
    /// }
    /// # }
    /// ```
    pub fn abort_future(&self) -> impl Future<Output = ()> + 'static {
        self.signal.aborted().map(|_| ())
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns the abort reason as the error.
    /// Otherwise, returns the result of the future wrapped in `Ok`.
    pub fn with_abort<F, T>(&self, fut: F) -> impl Future<Output = Result<T, StreamError>>
    where
        F: Future<Output = T>,
    {
        self.signal.race(fut)
    }

    pub(crate) fn stream_state(&self) -> (WritableState, Option<StreamError>) {
        self.ops.state()
    }
}

// ----------- WritableStream -----------
pub struct WritableStream<T: MaybeSend + 'static, LockState = Unlocked> {
    inner: SharedPtr<Mutex<WritableInner<T>>>,
    _state: PhantomData<LockState>,
}

impl<T: MaybeSend + 'static, L> Clone for WritableStream<T, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _state: PhantomData,
        }
    }
}

impl<T: MaybeSend + 'static, L> WritableStream<T, L> {
    fn retag<L2>(&self) -> WritableStream<T, L2> {
        WritableStream {
            inner: self.inner.clone(),
            _state: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    pub(crate) fn state(&self) -> WritableState {
        self.inner.lock().state
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.inner.lock().stored_error.clone()
    }

    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        self.inner.lock().close_queued_or_in_flight()
    }

    /// Errors a still-writable stream from outside the sink.
    pub(crate) fn error_if_needed(&self, error: StreamError) {
        self.inner.lock().error_if_needed(error);
    }
}

impl<T: MaybeSend + 'static> WritableStream<T, Unlocked> {
    /// Aborts the stream. Rejects with [`StreamError::Locked`] while a
    /// writer holds the lock.
    pub fn abort(&self, reason: Option<StreamError>) -> DeferredFuture<()> {
        let mut inner = self.inner.lock();
        if inner.writer.is_some() {
            return Deferred::rejected(StreamError::Locked).wait();
        }
        inner.abort(reason).wait()
    }

    /// Closes the stream after queued writes finish.
    pub fn close(&self) -> DeferredFuture<()> {
        let mut inner = self.inner.lock();
        if inner.writer.is_some() {
            return Deferred::rejected(StreamError::Locked).wait();
        }
        inner.close().wait()
    }

    pub fn get_writer(
        &self,
    ) -> StreamResult<(WritableStream<T, Locked>, WritableStreamDefaultWriter<T>)> {
        let lock_id = self.inner.lock().acquire_writer()?;
        let locked = self.retag::<Locked>();
        Ok((
            locked.clone(),
            WritableStreamDefaultWriter::new(locked, lock_id),
        ))
    }
}

impl<T: MaybeSend + 'static> WritableStream<T, Unlocked> {
    pub(crate) fn new_parts<Sink>(
        sink: Sink,
        strategy: BoxedStrategy<T>,
    ) -> (
        Self,
        WritableStreamDefaultController,
        impl Future<Output = ()> + MaybeSend + 'static,
    )
    where
        Sink: WritableSink<T>,
    {
        let (stream, controller) = Self::with_controller(strategy);
        let driver = stream.drive_sink(sink, &controller);
        (stream, controller, driver)
    }

    /// Stream and controller without a sink yet; see [`Self::drive_sink`].
    pub(crate) fn with_controller(
        strategy: BoxedStrategy<T>,
    ) -> (Self, WritableStreamDefaultController) {
        let inner = WritableInner::new(strategy);
        let signal = inner.abort_controller.signal();
        let inner = SharedPtr::new(Mutex::new(inner));
        let ops: SharedPtr<dyn WritableControllerOps> = inner.clone();
        let stream = WritableStream {
            inner,
            _state: PhantomData,
        };
        (stream, WritableStreamDefaultController { ops, signal })
    }

    pub(crate) fn drive_sink<Sink>(
        &self,
        sink: Sink,
        controller: &WritableStreamDefaultController,
    ) -> impl Future<Output = ()> + MaybeSend + 'static
    where
        Sink: WritableSink<T>,
    {
        drive_sink(sink, self.inner.clone(), controller.clone())
    }

    /// Returns a builder for this writable stream
    pub fn builder<Sink>(sink: Sink) -> WritableStreamBuilder<T, Sink>
    where
        Sink: WritableSink<T>,
    {
        WritableStreamBuilder::new(sink)
    }
}

// ----------- Writer -----------
/// Pending result of [`WritableStreamDefaultWriter::write`]. The chunk is
/// queued when the future is created.
pub struct WriteFuture {
    receiver: oneshot::Receiver<StreamResult<()>>,
}

impl Future for WriteFuture {
    type Output = StreamResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(StreamError::TaskDropped)))
    }
}

pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static> {
    stream: WritableStream<T, Locked>,
    lock_id: u64,
    // used by the futures::Sink adapter
    last_write: Option<WriteFuture>,
    closing: Option<DeferredFuture<()>>,
}

impl<T: MaybeSend + 'static> WritableStreamDefaultWriter<T> {
    fn new(stream: WritableStream<T, Locked>, lock_id: u64) -> Self {
        Self {
            stream,
            lock_id,
            last_write: None,
            closing: None,
        }
    }

    /// Queues a chunk for writing and returns a future that resolves when
    /// the sink has processed it.
    ///
    /// Calling `write()` repeatedly without awaiting it or [`ready()`]
    /// queues without bound. Await `ready()` first, or use
    /// [`enqueue_when_ready()`], to respect backpressure.
    ///
    /// [`ready()`]: Self::ready
    /// [`enqueue_when_ready()`]: Self::enqueue_when_ready
    pub fn write(&self, chunk: T) -> WriteFuture {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.stream.inner.lock();
        if inner.is_writer(self.lock_id) {
            inner.write(chunk, sender);
        } else {
            let _ = sender.send(Err(StreamError::Released));
        }
        WriteFuture { receiver }
    }

    /// Waits for the stream to be ready (no backpressure), then queues the
    /// chunk without waiting for the sink to process it.
    ///
    /// This helper is not part of the WHATWG interface; it wraps the common
    /// pattern of awaiting `ready()` before each write.
    pub async fn enqueue_when_ready(&self, chunk: T) -> StreamResult<()> {
        self.ready().await?;
        let _write = self.write(chunk);
        Ok(())
    }

    /// Closes the stream after every queued write. Rejects with
    /// [`StreamError::Closing`] or [`StreamError::Closed`] if a close was
    /// already requested.
    pub fn close(&self) -> DeferredFuture<()> {
        let mut inner = self.stream.inner.lock();
        if !inner.is_writer(self.lock_id) {
            return Deferred::rejected(StreamError::Released).wait();
        }
        inner.close().wait()
    }

    pub fn abort(&self, reason: Option<StreamError>) -> DeferredFuture<()> {
        let mut inner = self.stream.inner.lock();
        if !inner.is_writer(self.lock_id) {
            return Deferred::rejected(StreamError::Released).wait();
        }
        inner.abort(reason).wait()
    }

    /// Resolves when the stream has room in its queue.
    pub fn ready(&self) -> DeferredFuture<()> {
        self.stream.inner.lock().writer_ready(self.lock_id).wait()
    }

    pub fn closed(&self) -> DeferredFuture<()> {
        self.stream.inner.lock().writer_closed(self.lock_id).wait()
    }

    /// `None` while erroring or errored, `0` once closed.
    pub fn desired_size(&self) -> Option<f64> {
        let inner = self.stream.inner.lock();
        if !inner.is_writer(self.lock_id) {
            return None;
        }
        inner.writer_desired_size()
    }

    /// Closes unless the stream is already closing, closed or errored.
    pub(crate) fn close_with_error_propagation(&self) -> DeferredFuture<()> {
        let mut inner = self.stream.inner.lock();
        if !inner.is_writer(self.lock_id) {
            return Deferred::rejected(StreamError::Released).wait();
        }
        inner.close_with_error_propagation().wait()
    }

    pub(crate) fn stream(&self) -> &WritableStream<T, Locked> {
        &self.stream
    }

    /// Releases the lock. A pending `ready` or `closed` rejects with
    /// [`StreamError::Released`].
    pub fn release_lock(self) -> WritableStream<T, Unlocked> {
        self.stream.inner.lock().release_writer(self.lock_id);
        self.stream.retag::<Unlocked>()
    }
}

impl<T: MaybeSend + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        // no-op if release_lock already ran
        self.stream.inner.lock().release_writer(self.lock_id);
    }
}

impl<T: MaybeSend + 'static> futures::Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.ready().poll_unpin(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let write = this.write(item);
        this.last_write = Some(write);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        // writes settle in order, so the last one settling means all have
        match this.last_write.as_mut() {
            Some(write) => {
                let result = futures::ready!(write.poll_unpin(cx));
                this.last_write = None;
                Poll::Ready(result)
            }
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        futures::ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();
        if this.closing.is_none() {
            this.closing = Some(this.close());
        }
        match this.closing.as_mut() {
            Some(closing) => closing.poll_unpin(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

// ----------- Builder -----------
pub struct WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
{
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(
        self,
    ) -> (
        WritableStream<T, Unlocked>,
        impl Future<Output = ()> + MaybeSend + 'static,
    ) {
        let (stream, _controller, driver) = WritableStream::new_parts(self.sink, self.strategy);
        (stream, driver)
    }

    /// Spawn the driver with the given spawn function
    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}
