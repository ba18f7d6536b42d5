//! Transform streams.
//!
//! A [`TransformStream`] is a writable side whose sink feeds a [`Transformer`]
//! and a readable side the transformer enqueues into. The sides share one
//! backpressure flag: writes wait while the readable side is full, and a pull
//! on the readable side releases them.

use super::{
    promise::Deferred,
    readable::{
        DefaultStream, ReadableSource, ReadableStream, ReadableStreamDefaultController,
        StreamState,
    },
    writable::{WritableSink, WritableState, WritableStream, WritableStreamDefaultController},
    CountQueuingStrategy, QueuingStrategy, StreamError, StreamResult, Unlocked,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use futures::{
    future::{self, FutureExt},
    lock::Mutex as AsyncMutex,
};
use parking_lot::Mutex;
use std::{future::Future, marker::PhantomData};
use tracing::{debug, trace};

// ----------- Transformer trait -----------
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>: MaybeSend + 'static {
    /// Called once when the transform stream is created
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called when the readable side is canceled or the writable side is
    /// aborted. Runs at most once, and never after `flush`.
    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

/// Passes every chunk through unchanged.
pub struct IdentityTransformer<T> {
    _phantom: PhantomData<fn(T) -> T>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MaybeSend + 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        controller: &mut TransformStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(controller.enqueue(chunk))
    }
}

// ----------- Shared state -----------
/// Settled by whichever of flush, cancel or abort runs first.
enum Finish {
    Started(Deferred<()>),
    Existing(Deferred<()>),
}

struct TransformState {
    backpressure: bool,
    backpressure_change: Deferred<()>,
    started: Deferred<()>,
    finish: Option<Deferred<()>>,
}

impl TransformState {
    fn new() -> Self {
        Self {
            // writes wait for the first pull
            backpressure: true,
            backpressure_change: Deferred::new(),
            started: Deferred::new(),
            finish: None,
        }
    }

    fn set_backpressure(&mut self, backpressure: bool) {
        self.backpressure_change.resolve(());
        self.backpressure_change = Deferred::new();
        self.backpressure = backpressure;
    }

    fn begin_finish(&mut self) -> Finish {
        match &self.finish {
            Some(done) => Finish::Existing(done.clone()),
            None => {
                let done = Deferred::new();
                self.finish = Some(done.clone());
                Finish::Started(done)
            }
        }
    }
}

// ----------- Controller -----------
/// Handle given to a [`Transformer`] for feeding the readable side.
pub struct TransformStreamDefaultController<O: MaybeSend + 'static> {
    readable: ReadableStreamDefaultController<O>,
    writable: WritableStreamDefaultController,
    state: SharedPtr<Mutex<TransformState>>,
}

impl<O: MaybeSend + 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
            state: self.state.clone(),
        }
    }
}

impl<O: MaybeSend + 'static> TransformStreamDefaultController<O> {
    /// Enqueue to readable side
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        if !self.readable.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "Readable side is not in a state that permits enqueue",
            ));
        }
        if let Err(error) = self.readable.enqueue(chunk) {
            self.error_writable_and_unblock_write(error.clone());
            return Err(error);
        }

        let backpressure = self.readable.has_backpressure();
        let mut state = self.state.lock();
        if backpressure != state.backpressure && backpressure {
            state.set_backpressure(true);
        }
        Ok(())
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) {
        trace!(%error, "transform stream errored");
        self.readable.error(error.clone());
        self.error_writable_and_unblock_write(error);
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) {
        trace!("transform stream terminated");
        let _ = self.readable.close();
        self.error_writable_and_unblock_write(StreamError::Terminated);
    }

    /// Get desired size to fill the readable side of the stream's internal queue
    pub fn desired_size(&self) -> Option<f64> {
        self.readable.desired_size()
    }

    fn error_writable_and_unblock_write(&self, error: StreamError) {
        self.writable.error(error);
        self.unblock_write();
    }

    fn unblock_write(&self) {
        let mut state = self.state.lock();
        if state.backpressure {
            state.set_backpressure(false);
        }
    }
}

// ----------- Sides -----------
struct TransformSink<I, O, Tr>
where
    O: MaybeSend + 'static,
{
    transformer: SharedPtr<AsyncMutex<Tr>>,
    controller: TransformStreamDefaultController<O>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, Tr> TransformSink<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn perform_transform(&mut self, chunk: I) -> StreamResult<()> {
        let result = {
            let mut transformer = self.transformer.lock().await;
            transformer.transform(chunk, &mut self.controller).await
        };
        if let Err(error) = &result {
            self.controller.error(error.clone());
        }
        result
    }
}

impl<I, O, Tr> WritableSink<I> for TransformSink<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn start(&mut self, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        let result = {
            let mut transformer = self.transformer.lock().await;
            transformer.start(&mut self.controller).await
        };
        let started = self.controller.state.lock().started.clone();
        started.settle(result.clone());
        result
    }

    async fn write(
        &mut self,
        chunk: I,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        let change = {
            let state = self.controller.state.lock();
            state
                .backpressure
                .then(|| state.backpressure_change.clone())
        };
        if let Some(change) = change {
            change.wait().await?;
            if let (WritableState::Erroring, stored) = self.controller.writable.stream_state() {
                return Err(stored.unwrap_or(StreamError::Aborted(None)));
            }
        }
        self.perform_transform(chunk).await
    }

    async fn close(self) -> StreamResult<()> {
        let finish = self.controller.state.lock().begin_finish();
        let done = match finish {
            Finish::Started(done) => done,
            Finish::Existing(done) => return done.wait().await,
        };
        let mut controller = self.controller.clone();
        let flushed = {
            let mut transformer = self.transformer.lock().await;
            transformer.flush(&mut controller).await
        };
        let result = match flushed {
            Ok(()) => match controller.readable.stream_state() {
                (StreamState::Errored, stored) => Err(stored.unwrap_or(StreamError::Closed)),
                _ => {
                    trace!("transform stream flushed");
                    let _ = controller.readable.close();
                    Ok(())
                }
            },
            Err(error) => {
                controller.readable.error(error.clone());
                Err(error)
            }
        };
        done.settle(result.clone());
        result
    }

    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let finish = self.controller.state.lock().begin_finish();
        let done = match finish {
            Finish::Started(done) => done,
            Finish::Existing(done) => return done.wait().await,
        };
        debug!(reason = ?reason, "transform stream writable side aborted");
        let canceled = {
            let mut transformer = self.transformer.lock().await;
            transformer.cancel(reason.clone()).await
        };
        let readable = &self.controller.readable;
        let result = match canceled {
            Ok(()) => match readable.stream_state() {
                (StreamState::Errored, stored) => Err(stored.unwrap_or(StreamError::Closed)),
                _ => {
                    readable.error(reason.unwrap_or(StreamError::Aborted(None)));
                    Ok(())
                }
            },
            Err(error) => {
                readable.error(error.clone());
                Err(error)
            }
        };
        done.settle(result.clone());
        result
    }
}

struct TransformSource<I, O, Tr>
where
    O: MaybeSend + 'static,
{
    transformer: SharedPtr<AsyncMutex<Tr>>,
    controller: TransformStreamDefaultController<O>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, Tr> ReadableSource<O> for TransformSource<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn start(&mut self, _controller: &mut ReadableStreamDefaultController<O>) -> StreamResult<()> {
        let started = self.controller.state.lock().started.clone();
        started.wait().await
    }

    /// Releases a waiting write and resolves once backpressure changes again.
    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<O>) -> StreamResult<()> {
        let change = {
            let mut state = self.controller.state.lock();
            state.set_backpressure(false);
            state.backpressure_change.clone()
        };
        change.wait().await
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let finish = self.controller.state.lock().begin_finish();
        let done = match finish {
            Finish::Started(done) => done,
            Finish::Existing(done) => return done.wait().await,
        };
        debug!(reason = ?reason, "transform stream readable side canceled");
        let canceled = {
            let mut transformer = self.transformer.lock().await;
            transformer.cancel(reason.clone()).await
        };
        let controller = &self.controller;
        let result = match canceled {
            Ok(()) => match controller.writable.stream_state() {
                (WritableState::Errored, stored) => Err(stored.unwrap_or(StreamError::Closed)),
                _ => {
                    controller
                        .error_writable_and_unblock_write(reason.unwrap_or(StreamError::Canceled));
                    Ok(())
                }
            },
            Err(error) => {
                controller.error_writable_and_unblock_write(error.clone());
                Err(error)
            }
        };
        done.settle(result.clone());
        result
    }
}

// ----------- TransformStream -----------
/// A connected writable/readable pair.
pub struct TransformStream<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStream<O, DefaultStream, Unlocked>,
    writable: WritableStream<I, Unlocked>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    /// Returns a builder for this transform stream
    pub fn builder<Tr>(transformer: Tr) -> TransformStreamBuilder<I, O, Tr>
    where
        Tr: Transformer<I, O>,
    {
        TransformStreamBuilder::new(transformer)
    }

    /// Get the readable side
    pub fn readable(&self) -> ReadableStream<O, DefaultStream, Unlocked> {
        self.readable.clone()
    }

    /// Get the writable side
    pub fn writable(&self) -> WritableStream<I, Unlocked> {
        self.writable.clone()
    }

    /// Split into both sides
    pub fn split(
        self,
    ) -> (
        ReadableStream<O, DefaultStream, Unlocked>,
        WritableStream<I, Unlocked>,
    ) {
        (self.readable, self.writable)
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// A builder for a transform stream that passes chunks through unchanged.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer<T>> {
        TransformStreamBuilder::new(IdentityTransformer::new())
    }
}

// ----------- Builder -----------
pub struct TransformStreamBuilder<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
{
    transformer: Tr,
    writable_strategy: BoxedStrategy<I>,
    readable_strategy: BoxedStrategy<O>,
}

impl<I, O, Tr> TransformStreamBuilder<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    fn new(transformer: Tr) -> Self {
        Self {
            transformer,
            writable_strategy: Box::new(CountQueuingStrategy::new(1)),
            readable_strategy: Box::new(CountQueuingStrategy::new(0)),
        }
    }

    /// Strategy for the writable side. Defaults to a count of 1.
    pub fn writable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<I> + MaybeSend + 'static,
    {
        self.writable_strategy = Box::new(strategy);
        self
    }

    /// Strategy for the readable side. Defaults to a count of 0.
    pub fn readable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<O> + MaybeSend + 'static,
    {
        self.readable_strategy = Box::new(strategy);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(
        self,
    ) -> (
        TransformStream<I, O>,
        impl Future<Output = ()> + MaybeSend + 'static,
    ) {
        let transformer = SharedPtr::new(AsyncMutex::new(self.transformer));
        let (readable, readable_controller) =
            ReadableStream::with_default_controller(self.readable_strategy);
        let (writable, writable_controller) = WritableStream::with_controller(self.writable_strategy);
        let controller = TransformStreamDefaultController {
            readable: readable_controller.clone(),
            writable: writable_controller.clone(),
            state: SharedPtr::new(Mutex::new(TransformState::new())),
        };

        let sink = TransformSink {
            transformer: transformer.clone(),
            controller: controller.clone(),
            _input: PhantomData,
        };
        let source = TransformSource {
            transformer,
            controller,
            _input: PhantomData,
        };
        let writable_driver = writable.drive_sink(sink, &writable_controller);
        let readable_driver = ReadableStream::drive_default_source(source, &readable_controller);
        let driver = future::join(writable_driver, readable_driver).map(|_| ());

        (TransformStream { readable, writable }, driver)
    }

    /// Spawn the driver with the given spawn function
    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}
