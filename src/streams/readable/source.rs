use super::{
    call_pull_if_needed, ByteReadableState, CancelRequest, DefaultReadableState,
    ReadableByteStreamController, ReadableController, ReadableStreamDefaultController,
    StreamState,
};
use crate::platform::{MaybeSend, SharedPtr};
use crate::streams::{promise::Deferred, StreamError, StreamResult};
use futures::{
    future::{self, poll_fn, Either},
    pin_mut,
    stream::{Stream, StreamExt},
};
use parking_lot::Mutex;
use std::future::Future;
use std::task::Poll;
use tracing::{trace, warn};

// ----------- Source Traits -----------
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called once when the stream is canceled. An in-flight `pull` is
    /// dropped before this runs.
    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

/// Source for byte streams. `pull` should prefer
/// [`ReadableByteStreamController::byob_request`] when one is present and
/// fall back to [`ReadableByteStreamController::enqueue`].
pub trait ReadableByteSource: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- Example Source Implementations  -----------
pub struct IteratorSource<I: MaybeSend + 'static> {
    iter: Option<I>,
}

impl<I: MaybeSend + 'static> IteratorSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter: Some(iter) }
    }
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
    T: MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        match self.iter.as_mut().and_then(Iterator::next) {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }

    async fn cancel(&mut self, _reason: Option<StreamError>) -> StreamResult<()> {
        self.iter = None;
        Ok(())
    }
}

pub struct AsyncStreamSource<S: MaybeSend + 'static> {
    stream: Option<S>,
}

impl<S: MaybeSend + 'static> AsyncStreamSource<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

impl<S, T> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
    T: MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        let next = match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        };
        match next {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }

    async fn cancel(&mut self, _reason: Option<StreamError>) -> StreamResult<()> {
        self.stream = None;
        Ok(())
    }
}

// ----------- Driver -----------
pub(crate) enum DriverCommand {
    Pull,
    Cancel(CancelRequest),
    Finished,
}

fn next_command<C: ReadableController>(
    shared: &SharedPtr<Mutex<C>>,
) -> impl Future<Output = DriverCommand> + '_ {
    poll_fn(move |cx| {
        let mut controller = shared.lock();
        let core = controller.core_mut();
        if let Some(request) = core.cancel_request.take() {
            return Poll::Ready(DriverCommand::Cancel(request));
        }
        if core.pull_requested {
            core.pull_requested = false;
            return Poll::Ready(DriverCommand::Pull);
        }
        if core.algorithms_cleared || core.state != StreamState::Readable {
            return Poll::Ready(DriverCommand::Finished);
        }
        core.register_driver(cx.waker());
        Poll::Pending
    })
}

fn cancel_requested<C: ReadableController>(
    shared: &SharedPtr<Mutex<C>>,
) -> impl Future<Output = ()> + Unpin + '_ {
    poll_fn(move |cx| {
        let mut controller = shared.lock();
        let core = controller.core_mut();
        if core.cancel_request.is_some() {
            Poll::Ready(())
        } else {
            core.register_driver(cx.waker());
            Poll::Pending
        }
    })
}

fn start_finished<C: ReadableController>(shared: &SharedPtr<Mutex<C>>, result: StreamResult<()>) {
    let mut controller = shared.lock();
    match result {
        Ok(()) => {
            trace!("readable source started");
            controller.core_mut().started = true;
            call_pull_if_needed(&mut *controller);
        }
        Err(error) => controller.error_controller(error),
    }
}

fn pull_finished<C: ReadableController>(shared: &SharedPtr<Mutex<C>>, result: StreamResult<()>) {
    let mut controller = shared.lock();
    match result {
        Ok(()) => {
            let core = controller.core_mut();
            core.pulling = false;
            if core.pull_again {
                core.pull_again = false;
                call_pull_if_needed(&mut *controller);
            }
        }
        Err(error) => controller.error_controller(error),
    }
}

/// Errors the stream if the driver goes away while it is still readable, so
/// readers do not wait forever on a source nobody runs.
struct DriverGuard<C: ReadableController> {
    shared: SharedPtr<Mutex<C>>,
    cancel: Option<Deferred<()>>,
}

impl<C: ReadableController> Drop for DriverGuard<C> {
    fn drop(&mut self) {
        if let Some(done) = self.cancel.take() {
            if done.reject(StreamError::TaskDropped) {
                warn!("readable stream driver dropped while canceling");
            }
        }
        let mut controller = self.shared.lock();
        if let Some(request) = controller.core_mut().cancel_request.take() {
            request.done.reject(StreamError::TaskDropped);
        }
        if controller.core().state == StreamState::Readable {
            warn!("readable stream driver dropped before the stream finished");
            controller.error_controller(StreamError::TaskDropped);
        }
    }
}

/// The algorithm calls a driver needs, for either controller kind.
trait UnderlyingSource<Controller>: MaybeSend + 'static {
    fn start_algorithm(
        &mut self,
        controller: &mut Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;
    fn pull_algorithm(
        &mut self,
        controller: &mut Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;
    fn cancel_algorithm(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;
}

impl<T: MaybeSend + 'static, S: ReadableSource<T>>
    UnderlyingSource<ReadableStreamDefaultController<T>> for S
{
    fn start_algorithm(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        ReadableSource::start(self, controller)
    }

    fn pull_algorithm(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        ReadableSource::pull(self, controller)
    }

    fn cancel_algorithm(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        ReadableSource::cancel(self, reason)
    }
}

/// Byte sources run through the same driver as default ones.
struct ByteSourceAlgorithms<S>(S);

impl<S: ReadableByteSource> UnderlyingSource<ReadableByteStreamController>
    for ByteSourceAlgorithms<S>
{
    fn start_algorithm(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.start(controller)
    }

    fn pull_algorithm(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.pull(controller)
    }

    fn cancel_algorithm(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.cancel(reason)
    }
}

pub(crate) fn drive_default_source<T, S>(
    source: S,
    shared: SharedPtr<Mutex<DefaultReadableState<T>>>,
    controller: ReadableStreamDefaultController<T>,
) -> impl Future<Output = ()> + MaybeSend + 'static
where
    T: MaybeSend + 'static,
    S: ReadableSource<T>,
{
    drive(source, shared, controller)
}

pub(crate) fn drive_byte_source<S>(
    source: S,
    shared: SharedPtr<Mutex<ByteReadableState>>,
    controller: ReadableByteStreamController,
) -> impl Future<Output = ()> + MaybeSend + 'static
where
    S: ReadableByteSource,
{
    drive(ByteSourceAlgorithms(source), shared, controller)
}

fn drive<C, Ctl, S>(
    mut source: S,
    shared: SharedPtr<Mutex<C>>,
    mut controller: Ctl,
) -> impl Future<Output = ()> + MaybeSend + 'static
where
    C: ReadableController,
    Ctl: MaybeSend + 'static,
    S: UnderlyingSource<Ctl>,
{
    // Created outside the async block so dropping an unpolled driver still
    // releases waiting readers.
    let mut guard = DriverGuard {
        shared: shared.clone(),
        cancel: None,
    };

    async move {
        let started = {
            let start = source.start_algorithm(&mut controller);
            pin_mut!(start);
            match future::select(start, cancel_requested(&shared)).await {
                Either::Left((result, _)) => Some(result),
                Either::Right(_) => None,
            }
        };
        if let Some(result) = started {
            start_finished(&shared, result);
        }

        loop {
            match next_command(&shared).await {
                DriverCommand::Pull => {
                    let pulled = {
                        let pull = source.pull_algorithm(&mut controller);
                        pin_mut!(pull);
                        match future::select(pull, cancel_requested(&shared)).await {
                            Either::Left((result, _)) => Some(result),
                            // the pull is dropped; the cancel is served next
                            Either::Right(_) => None,
                        }
                    };
                    if let Some(result) = pulled {
                        pull_finished(&shared, result);
                    }
                }
                DriverCommand::Cancel(request) => {
                    guard.cancel = Some(request.done.clone());
                    let result = source.cancel_algorithm(request.reason).await;
                    request.done.settle(result);
                    return;
                }
                DriverCommand::Finished => {
                    trace!("readable stream driver finished");
                    return;
                }
            }
        }
    }
}
