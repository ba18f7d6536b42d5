//! Teeing a readable stream into two branches.
//!
//! A coordinator future owns the upstream reader and both branch
//! controllers. Branch sources only record pull and cancel requests in a
//! shared [`TeeState`] and wake the coordinator; every upstream read and
//! every enqueue into a branch happens on the coordinator.

use super::{
    ByteStream, DefaultStream, ReadableByteSource, ReadableByteStreamController, ReadableSource,
    ReadableStream, ReadableStreamBYOBReader, ReadableStreamDefaultController,
    ReadableStreamDefaultReader,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use crate::streams::{
    promise::{Deferred, DeferredFuture},
    ByobReadResult, ByteView, CountQueuingStrategy, QueuingStrategy, StreamError, StreamResult,
    Unlocked,
};
use futures::{
    future::{self, poll_fn, Either},
    FutureExt,
};
use parking_lot::Mutex;
use std::{future::Future, marker::PhantomData, task::Poll, task::Waker};
use tracing::{debug, trace, warn};

// ----------- Shared Coordination State -----------
struct TeeState {
    pull_requested: [bool; 2],
    canceled: [bool; 2],
    reasons: [Option<StreamError>; 2],
    /// Composite reason, set once both branches are canceled.
    cancel_source: Option<StreamError>,
    cancel_done: Deferred<()>,
    coordinator: Option<Waker>,
}

impl TeeState {
    fn new() -> Self {
        Self {
            pull_requested: [false; 2],
            canceled: [false; 2],
            reasons: [None, None],
            cancel_source: None,
            cancel_done: Deferred::new(),
            coordinator: None,
        }
    }

    fn wake(&mut self) {
        if let Some(waker) = self.coordinator.take() {
            waker.wake();
        }
    }

    fn request_pull(&mut self, branch: usize) {
        self.pull_requested[branch] = true;
        self.wake();
    }

    fn cancel_branch(&mut self, branch: usize, reason: Option<StreamError>) -> Deferred<()> {
        if !self.canceled[branch] {
            self.canceled[branch] = true;
            self.reasons[branch] = reason;
            if self.canceled[0] && self.canceled[1] {
                let [first, second] = std::mem::take(&mut self.reasons);
                debug!("both tee branches canceled; canceling the source");
                self.cancel_source = Some(StreamError::Composite(vec![first, second]));
                self.wake();
            }
        }
        self.cancel_done.clone()
    }

    /// A chunk satisfies any pull that was requested while it was read.
    fn take_canceled(&mut self) -> [bool; 2] {
        self.pull_requested = [false; 2];
        self.canceled
    }

    fn both_canceled(&self) -> bool {
        self.canceled[0] && self.canceled[1]
    }
}

type SharedTee = SharedPtr<Mutex<TeeState>>;

enum TeeEvent {
    Pull(usize),
    CancelSource(StreamError),
    UpstreamClosed(StreamResult<()>),
}

fn next_event<'a>(
    shared: &'a SharedTee,
    closed: &'a mut DeferredFuture<()>,
) -> impl Future<Output = TeeEvent> + 'a {
    poll_fn(move |cx| {
        {
            let mut state = shared.lock();
            if let Some(reason) = state.cancel_source.take() {
                return Poll::Ready(TeeEvent::CancelSource(reason));
            }
            if let Some(branch) = (0..2).find(|&branch| state.pull_requested[branch]) {
                state.pull_requested[branch] = false;
                return Poll::Ready(TeeEvent::Pull(branch));
            }
            state.coordinator = Some(cx.waker().clone());
        }
        closed.poll_unpin(cx).map(TeeEvent::UpstreamClosed)
    })
}

fn cancel_requested(shared: &SharedTee) -> impl Future<Output = StreamError> + '_ {
    poll_fn(move |cx| {
        let mut state = shared.lock();
        match state.cancel_source.take() {
            Some(reason) => Poll::Ready(reason),
            None => {
                state.coordinator = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    })
}

/// What the coordinator does after an upstream read settles.
enum Step {
    Continue,
    Finished,
}

/// Settles the source-cancel result every canceled branch is waiting on.
async fn cancel_upstream(shared: &SharedTee, cancel: DeferredFuture<()>) {
    let result = cancel.await;
    shared.lock().cancel_done.settle(result);
}

// ----------- Default Tee -----------
struct TeeBranchSource<T> {
    shared: SharedTee,
    branch: usize,
    _chunk: PhantomData<fn() -> T>,
}

impl<T: MaybeSend + 'static> ReadableSource<T> for TeeBranchSource<T> {
    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        self.shared.lock().request_pull(self.branch);
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let done = self.shared.lock().cancel_branch(self.branch, reason);
        done.wait().await
    }
}

struct TeeCoordinator<T: MaybeSend + 'static> {
    reader: ReadableStreamDefaultReader<T, DefaultStream>,
    shared: SharedTee,
    branches: [ReadableStreamDefaultController<T>; 2],
}

impl<T: Clone + MaybeSend + 'static> TeeCoordinator<T> {
    async fn run(self) {
        let mut closed = self.reader.closed();
        loop {
            match next_event(&self.shared, &mut closed).await {
                TeeEvent::CancelSource(reason) => {
                    cancel_upstream(&self.shared, self.reader.cancel(Some(reason))).await;
                    return;
                }
                TeeEvent::UpstreamClosed(result) => {
                    self.finish(result);
                    return;
                }
                TeeEvent::Pull(_) => {
                    let read = self.reader.read();
                    let step = match future::select(read, cancel_requested(&self.shared)).await {
                        Either::Left((Ok(Some(chunk)), _)) => {
                            self.distribute(chunk);
                            Step::Continue
                        }
                        Either::Left((Ok(None), _)) => {
                            self.finish(Ok(()));
                            Step::Finished
                        }
                        Either::Left((Err(error), _)) => {
                            self.finish(Err(error));
                            Step::Finished
                        }
                        Either::Right((reason, _)) => {
                            cancel_upstream(&self.shared, self.reader.cancel(Some(reason))).await;
                            Step::Finished
                        }
                    };
                    if let Step::Finished = step {
                        return;
                    }
                }
            }
        }
    }

    fn distribute(&self, chunk: T) {
        let canceled = self.shared.lock().take_canceled();
        trace!("tee distributing chunk");
        // Errors mean the branch is already closed or errored.
        match canceled {
            [false, false] => {
                let _ = self.branches[0].enqueue(chunk.clone());
                let _ = self.branches[1].enqueue(chunk);
            }
            [false, true] => {
                let _ = self.branches[0].enqueue(chunk);
            }
            [true, false] => {
                let _ = self.branches[1].enqueue(chunk);
            }
            [true, true] => {}
        }
    }

    fn finish(&self, result: StreamResult<()>) {
        let mut state = self.shared.lock();
        match result {
            Ok(()) => {
                for (branch, controller) in self.branches.iter().enumerate() {
                    if !state.canceled[branch] {
                        let _ = controller.close();
                    }
                }
            }
            Err(error) => {
                debug!(%error, "tee source errored");
                for controller in &self.branches {
                    controller.error(error.clone());
                }
            }
        }
        if !state.both_canceled() {
            state.cancel_done.resolve(());
        }
        state.wake();
    }
}

impl<T: MaybeSend + 'static> Drop for TeeCoordinator<T> {
    fn drop(&mut self) {
        let abandoned = self.shared.lock().cancel_done.reject(StreamError::TaskDropped);
        let mut errored = false;
        for controller in &self.branches {
            if controller.can_close_or_enqueue() {
                controller.error(StreamError::TaskDropped);
                errored = true;
            }
        }
        if abandoned && errored {
            warn!("tee future dropped before the source finished");
        }
    }
}

/// Builds the two branches of [`ReadableStream::tee`].
///
/// Every chunk read from the source is cloned into each branch that has not
/// been canceled. The source is read only as fast as the faster branch
/// pulls, so the slower branch's queue grows without bound.
pub struct TeeBuilder<T: MaybeSend + 'static> {
    stream: ReadableStream<T, DefaultStream, Unlocked>,
    branch1_strategy: BoxedStrategy<T>,
    branch2_strategy: BoxedStrategy<T>,
}

impl<T: Clone + MaybeSend + 'static> TeeBuilder<T> {
    fn new(stream: ReadableStream<T, DefaultStream, Unlocked>) -> Self {
        Self {
            stream,
            branch1_strategy: Box::new(CountQueuingStrategy::new(1)),
            branch2_strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub fn branch1_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + 'static,
    {
        self.branch1_strategy = Box::new(strategy);
        self
    }

    pub fn branch2_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + 'static,
    {
        self.branch2_strategy = Box::new(strategy);
        self
    }

    /// Uses `strategy` for both branches.
    pub fn strategy<S>(self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + Clone + MaybeSend + 'static,
    {
        self.branch1_strategy(strategy.clone()).branch2_strategy(strategy)
    }

    /// Locks the source and returns both branches with the future that
    /// drives them. Fails with [`StreamError::Locked`] if the source is
    /// already locked.
    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<T, DefaultStream, Unlocked>,
        ReadableStream<T, DefaultStream, Unlocked>,
        impl Future<Output = ()> + MaybeSend + 'static,
    )> {
        let (_locked, reader) = self.stream.get_reader()?;
        let shared = SharedPtr::new(Mutex::new(TeeState::new()));

        let (branch1, controller1) = ReadableStream::with_default_controller(self.branch1_strategy);
        let (branch2, controller2) = ReadableStream::with_default_controller(self.branch2_strategy);
        let driver1 = ReadableStream::drive_default_source(
            TeeBranchSource {
                shared: shared.clone(),
                branch: 0,
                _chunk: PhantomData,
            },
            &controller1,
        );
        let driver2 = ReadableStream::drive_default_source(
            TeeBranchSource {
                shared: shared.clone(),
                branch: 1,
                _chunk: PhantomData,
            },
            &controller2,
        );
        let coordinator = TeeCoordinator {
            reader,
            shared,
            branches: [controller1, controller2],
        };

        let fut = future::join3(coordinator.run(), driver1, driver2).map(|_| ());
        Ok((branch1, branch2, fut))
    }

    pub fn spawn<F, R>(
        self,
        spawn_fn: F,
    ) -> StreamResult<(
        ReadableStream<T, DefaultStream, Unlocked>,
        ReadableStream<T, DefaultStream, Unlocked>,
    )>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (branch1, branch2, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok((branch1, branch2))
    }
}

impl<T: Clone + MaybeSend + 'static> ReadableStream<T, DefaultStream, Unlocked> {
    /// Splits the stream into two branches that each see every chunk.
    ///
    /// ```no_run
    /// # async fn demo() -> lws_streams::StreamResult<()> {
    /// use lws_streams::ReadableStream;
    ///
    /// let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
    /// let (left, right) = stream.tee().spawn(tokio::spawn)?;
    /// let (_locked, reader) = left.get_reader()?;
    /// assert_eq!(reader.read_all().await?, vec![1, 2, 3]);
    /// # drop(right);
    /// # Ok(())
    /// # }
    /// ```
    pub fn tee(&self) -> TeeBuilder<T> {
        TeeBuilder::new(self.clone())
    }
}

// ----------- Byte Tee -----------
struct ByteTeeBranchSource {
    shared: SharedTee,
    branch: usize,
}

impl ReadableByteSource for ByteTeeBranchSource {
    async fn pull(&mut self, _controller: &mut ReadableByteStreamController) -> StreamResult<()> {
        self.shared.lock().request_pull(self.branch);
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let done = self.shared.lock().cancel_branch(self.branch, reason);
        done.wait().await
    }
}

enum Upstream {
    Default(ReadableStreamDefaultReader<Vec<u8>, ByteStream>),
    Byob(ReadableStreamBYOBReader),
}

impl Upstream {
    fn closed(&self) -> DeferredFuture<()> {
        match self {
            Upstream::Default(reader) => reader.closed(),
            Upstream::Byob(reader) => reader.closed(),
        }
    }

    fn cancel(&self, reason: Option<StreamError>) -> DeferredFuture<()> {
        match self {
            Upstream::Default(reader) => reader.cancel(reason),
            Upstream::Byob(reader) => reader.cancel(reason),
        }
    }
}

struct ByteTeeCoordinator {
    stream: ReadableStream<Vec<u8>, ByteStream, Unlocked>,
    /// `None` only while switching between reader kinds.
    reader: Option<Upstream>,
    shared: SharedTee,
    branches: [ReadableByteStreamController; 2],
}

impl ByteTeeCoordinator {
    async fn run(mut self) {
        loop {
            let mut closed = match &self.reader {
                Some(reader) => reader.closed(),
                None => return,
            };
            let event = next_event(&self.shared, &mut closed).await;
            let step = match event {
                TeeEvent::CancelSource(reason) => {
                    self.cancel_source(reason).await;
                    Step::Finished
                }
                TeeEvent::UpstreamClosed(result) => {
                    self.finish(result);
                    Step::Finished
                }
                TeeEvent::Pull(branch) => match self.branches[branch].byob_request() {
                    None => self.pull_with_default_reader().await,
                    Some(request) => self.pull_with_byob_reader(branch, request).await,
                },
            };
            if let Step::Finished = step {
                return;
            }
        }
    }

    async fn cancel_source(&self, reason: StreamError) {
        if let Some(reader) = &self.reader {
            cancel_upstream(&self.shared, reader.cancel(Some(reason))).await;
        }
    }

    fn default_read(&mut self) -> StreamResult<super::ReadFuture<Vec<u8>>> {
        if !matches!(self.reader, Some(Upstream::Default(_))) {
            trace!("tee switching source to a default reader");
            self.reader = None;
            let (_locked, reader) = self.stream.get_reader()?;
            self.reader = Some(Upstream::Default(reader));
        }
        match &self.reader {
            Some(Upstream::Default(reader)) => Ok(reader.read()),
            _ => Err(StreamError::Released),
        }
    }

    fn byob_read(&mut self, view: ByteView) -> StreamResult<super::ByobReadFuture> {
        if !matches!(self.reader, Some(Upstream::Byob(_))) {
            trace!("tee switching source to a BYOB reader");
            self.reader = None;
            let (_locked, reader) = self.stream.get_byob_reader()?;
            self.reader = Some(Upstream::Byob(reader));
        }
        match &self.reader {
            Some(Upstream::Byob(reader)) => Ok(reader.read(view)),
            _ => Err(StreamError::Released),
        }
    }

    async fn pull_with_default_reader(&mut self) -> Step {
        let read = match self.default_read() {
            Ok(read) => read,
            Err(error) => {
                self.finish(Err(error));
                return Step::Finished;
            }
        };
        match future::select(read, cancel_requested(&self.shared)).await {
            Either::Left((Ok(Some(chunk)), _)) => {
                let canceled = self.shared.lock().take_canceled();
                match canceled {
                    [false, false] => {
                        let _ = self.branches[0].enqueue(chunk.clone());
                        let _ = self.branches[1].enqueue(chunk);
                    }
                    [false, true] => {
                        let _ = self.branches[0].enqueue(chunk);
                    }
                    [true, false] => {
                        let _ = self.branches[1].enqueue(chunk);
                    }
                    [true, true] => {}
                }
                Step::Continue
            }
            Either::Left((Ok(None), _)) => {
                self.finish(Ok(()));
                Step::Finished
            }
            Either::Left((Err(error), _)) => {
                self.finish(Err(error));
                Step::Finished
            }
            Either::Right((reason, _)) => {
                self.cancel_source(reason).await;
                Step::Finished
            }
        }
    }

    async fn pull_with_byob_reader(
        &mut self,
        branch: usize,
        request: super::ReadableStreamBYOBRequest,
    ) -> Step {
        let other = 1 - branch;
        // The branch's read was released or canceled since it asked.
        let Ok(view) = request.take_view() else {
            return Step::Continue;
        };
        let read = match self.byob_read(view) {
            Ok(read) => read,
            Err(error) => {
                self.finish(Err(error));
                return Step::Finished;
            }
        };
        match future::select(read, cancel_requested(&self.shared)).await {
            Either::Left((Ok(ByobReadResult { value, done }), _)) => {
                let canceled = self.shared.lock().take_canceled();
                let (byob_canceled, other_canceled) = (canceled[branch], canceled[other]);
                if !done {
                    if let Some(view) = value {
                        let copy = ByteView::new(view.as_bytes().to_vec());
                        if !byob_canceled {
                            let _ = request.respond_with_new_view(view);
                        }
                        if !other_canceled {
                            let _ = self.branches[other].enqueue(copy);
                        }
                    }
                    return Step::Continue;
                }
                if !byob_canceled {
                    let _ = self.branches[branch].close();
                }
                if !other_canceled {
                    let _ = self.branches[other].close();
                }
                if let Some(view) = value {
                    if !byob_canceled {
                        let _ = request.respond_with_new_view(view);
                    }
                }
                let mut state = self.shared.lock();
                if !state.both_canceled() {
                    state.cancel_done.resolve(());
                }
                Step::Finished
            }
            Either::Left((Err(error), _)) => {
                self.finish(Err(error));
                Step::Finished
            }
            Either::Right((reason, _)) => {
                self.cancel_source(reason).await;
                Step::Finished
            }
        }
    }

    fn finish(&self, result: StreamResult<()>) {
        let mut state = self.shared.lock();
        match result {
            Ok(()) => {
                for (branch, controller) in self.branches.iter().enumerate() {
                    if !state.canceled[branch] {
                        let _ = controller.close();
                    }
                }
            }
            Err(error) => {
                debug!(%error, "byte tee source errored");
                for controller in &self.branches {
                    controller.error(error.clone());
                }
            }
        }
        if !state.both_canceled() {
            state.cancel_done.resolve(());
        }
        state.wake();
    }
}

impl Drop for ByteTeeCoordinator {
    fn drop(&mut self) {
        let abandoned = self.shared.lock().cancel_done.reject(StreamError::TaskDropped);
        let mut errored = false;
        for controller in &self.branches {
            if controller.can_close_or_enqueue() {
                controller.error(StreamError::TaskDropped);
                errored = true;
            }
        }
        if abandoned && errored {
            warn!("byte tee future dropped before the source finished");
        }
    }
}

/// Builds the two byte-stream branches of a byte stream's `tee`.
///
/// A branch with a pending BYOB read has the source read straight into its
/// buffer; the other branch gets a copy. Neither branch ever shares a
/// buffer with the other.
pub struct ByteTeeBuilder {
    stream: ReadableStream<Vec<u8>, ByteStream, Unlocked>,
}

type ByteBranch = ReadableStream<Vec<u8>, ByteStream, Unlocked>;

impl ByteTeeBuilder {
    pub fn prepare(
        self,
    ) -> StreamResult<(ByteBranch, ByteBranch, impl Future<Output = ()> + MaybeSend + 'static)> {
        let (_locked, reader) = self.stream.get_reader()?;
        let shared = SharedPtr::new(Mutex::new(TeeState::new()));

        let (branch1, controller1) = ReadableStream::with_byte_controller(0, None);
        let (branch2, controller2) = ReadableStream::with_byte_controller(0, None);
        let driver1 = ReadableStream::drive_byte_source(
            ByteTeeBranchSource {
                shared: shared.clone(),
                branch: 0,
            },
            &controller1,
        );
        let driver2 = ReadableStream::drive_byte_source(
            ByteTeeBranchSource {
                shared: shared.clone(),
                branch: 1,
            },
            &controller2,
        );
        let coordinator = ByteTeeCoordinator {
            stream: self.stream,
            reader: Some(Upstream::Default(reader)),
            shared,
            branches: [controller1, controller2],
        };

        let fut = future::join3(coordinator.run(), driver1, driver2).map(|_| ());
        Ok((branch1, branch2, fut))
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<(ByteBranch, ByteBranch)>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (branch1, branch2, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok((branch1, branch2))
    }
}

impl ReadableStream<Vec<u8>, ByteStream, Unlocked> {
    /// Splits a byte stream into two byte streams. Both branches support
    /// BYOB readers.
    pub fn tee(&self) -> ByteTeeBuilder {
        ByteTeeBuilder {
            stream: self.clone(),
        }
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn splits_into_identical_branches() {
        let stream = ReadableStream::from_vec(vec![1, 2, 3, 4]).spawn(tokio::spawn);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();
        assert!(stream.locked());

        let (_l1, reader1) = branch1.get_reader().unwrap();
        let (_l2, reader2) = branch2.get_reader().unwrap();
        let (first, second) = tokio::join!(reader1.read_all(), reader2.read_all());
        assert_eq!(first.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(second.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn branches_share_cloned_handles() {
        let chunk = Arc::new(String::from("shared"));
        let stream = ReadableStream::from_vec(vec![chunk.clone()]).spawn(tokio::spawn);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

        let (_l1, reader1) = branch1.get_reader().unwrap();
        let (_l2, reader2) = branch2.get_reader().unwrap();
        let first = reader1.read().await.unwrap().unwrap();
        let second = reader2.read().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &chunk));
    }

    #[tokio::test]
    async fn slow_branch_still_sees_every_chunk() {
        let stream = ReadableStream::from_vec((0..20).collect::<Vec<u32>>()).spawn(tokio::spawn);
        let (fast, slow) = stream.tee().spawn(tokio::spawn).unwrap();

        let fast_task = tokio::spawn(async move {
            let (_locked, reader) = fast.get_reader().unwrap();
            reader.read_all().await.unwrap()
        });
        let slow_task = tokio::spawn(async move {
            let (_locked, reader) = slow.get_reader().unwrap();
            let mut chunks = Vec::new();
            while let Some(chunk) = reader.read().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(2)).await;
                chunks.push(chunk);
            }
            chunks
        });

        let expected: Vec<u32> = (0..20).collect();
        assert_eq!(fast_task.await.unwrap(), expected);
        assert_eq!(slow_task.await.unwrap(), expected);
    }

    struct CountingSource {
        next: u32,
        end: u32,
        cancels: Arc<AtomicUsize>,
        reason: Arc<Mutex<Option<StreamError>>>,
    }

    impl CountingSource {
        fn new(end: u32) -> (Self, Arc<AtomicUsize>, Arc<Mutex<Option<StreamError>>>) {
            let cancels = Arc::new(AtomicUsize::new(0));
            let reason = Arc::new(Mutex::new(None));
            let source = Self {
                next: 0,
                end,
                cancels: cancels.clone(),
                reason: reason.clone(),
            };
            (source, cancels, reason)
        }
    }

    impl ReadableSource<u32> for CountingSource {
        async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            if self.next == self.end {
                return controller.close();
            }
            controller.enqueue(self.next)?;
            self.next += 1;
            Ok(())
        }

        async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            *self.reason.lock() = reason;
            Ok(())
        }
    }

    #[tokio::test]
    async fn canceling_one_branch_leaves_the_other_reading() {
        let (source, cancels, _reason) = CountingSource::new(4);
        let stream = ReadableStream::builder(source).spawn(tokio::spawn);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

        let cancel = branch2.cancel(Some("not needed".into()));
        let (_locked, reader) = branch1.get_reader().unwrap();
        assert_eq!(reader.read_all().await.unwrap(), vec![0, 1, 2, 3]);

        // settles once the source has finished
        timeout(Duration::from_secs(1), cancel).await.unwrap().unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn canceling_both_branches_cancels_the_source_once() {
        let (source, cancels, reason) = CountingSource::new(u32::MAX);
        let stream = ReadableStream::builder(source).spawn(tokio::spawn);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

        let first = branch1.cancel(Some("first".into()));
        let second = branch2.cancel(Some("second".into()));
        let (first, second) = timeout(Duration::from_secs(1), future::join(first, second))
            .await
            .unwrap();
        first.unwrap();
        second.unwrap();

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        let reason = reason.lock().clone().unwrap();
        assert!(matches!(&reason, StreamError::Composite(reasons) if reasons.len() == 2));
        assert_eq!(reason.to_string(), "[first, second]");
    }

    struct FailingSource;

    impl ReadableSource<u32> for FailingSource {
        async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn source_error_errors_both_branches() {
        let stream = ReadableStream::builder(FailingSource).spawn(tokio::spawn);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

        let (_l1, reader1) = branch1.get_reader().unwrap();
        let (_l2, reader2) = branch2.get_reader().unwrap();
        assert_eq!(reader1.read().await.unwrap_err().to_string(), "boom");
        assert_eq!(reader2.read().await.unwrap_err().to_string(), "boom");
        assert!(reader2.closed().await.is_err());
    }

    #[tokio::test]
    async fn tee_of_locked_stream_fails() {
        let stream = ReadableStream::from_vec(vec![1]).spawn(tokio::spawn);
        let (_locked, _reader) = stream.get_reader().unwrap();
        assert!(matches!(stream.tee().prepare(), Err(StreamError::Locked)));
    }

    #[tokio::test]
    async fn dropping_the_tee_future_errors_the_branches() {
        let stream = ReadableStream::from_vec(vec![1, 2]).spawn(tokio::spawn);
        let (branch1, _branch2, fut) = stream.tee().prepare().unwrap();
        drop(fut);

        let (_locked, reader) = branch1.get_reader().unwrap();
        assert!(matches!(reader.read().await, Err(StreamError::TaskDropped)));
    }

    /// Enqueues `chunks` in order, then closes.
    struct ByteChunks {
        chunks: VecDeque<Vec<u8>>,
        cancels: Arc<AtomicUsize>,
    }

    impl ReadableByteSource for ByteChunks {
        async fn pull(&mut self, controller: &mut ReadableByteStreamController) -> StreamResult<()> {
            match self.chunks.pop_front() {
                Some(chunk) => controller.enqueue(chunk),
                None => controller.close(),
            }
        }

        async fn cancel(&mut self, _reason: Option<StreamError>) -> StreamResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn byte_stream(chunks: &[&[u8]]) -> (ReadableStream<Vec<u8>, ByteStream>, Arc<AtomicUsize>) {
        let cancels = Arc::new(AtomicUsize::new(0));
        let source = ByteChunks {
            chunks: chunks.iter().map(|chunk| chunk.to_vec()).collect(),
            cancels: cancels.clone(),
        };
        (ReadableStream::builder_bytes(source).spawn(tokio::spawn), cancels)
    }

    #[tokio::test]
    async fn byte_tee_copies_chunks_into_both_branches() {
        let (stream, _cancels) = byte_stream(&[&[1, 2, 3], &[4, 5]]);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

        let (_l1, reader1) = branch1.get_reader().unwrap();
        let (_l2, reader2) = branch2.get_reader().unwrap();
        let (first, second) = tokio::join!(reader1.read_all(), reader2.read_all());
        assert_eq!(first.unwrap().concat(), vec![1, 2, 3, 4, 5]);
        assert_eq!(second.unwrap().concat(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn byte_tee_serves_byob_and_default_readers() {
        let (stream, _cancels) = byte_stream(&[&[1, 2, 3], &[4, 5]]);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

        let default_task = tokio::spawn(async move {
            let (_locked, reader) = branch1.get_reader().unwrap();
            reader.read_all().await.unwrap().concat()
        });
        let byob_task = tokio::spawn(async move {
            let (_locked, reader) = branch2.get_byob_reader().unwrap();
            let mut bytes = Vec::new();
            loop {
                let result = reader.read(ByteView::zeroed(2)).await.unwrap();
                let view = result.value.unwrap();
                assert!(view.len() <= 2);
                bytes.extend_from_slice(view.as_bytes());
                if result.done {
                    break;
                }
            }
            bytes
        });

        let default_bytes = timeout(Duration::from_secs(1), default_task).await.unwrap().unwrap();
        let byob_bytes = timeout(Duration::from_secs(1), byob_task).await.unwrap().unwrap();
        assert_eq!(default_bytes, vec![1, 2, 3, 4, 5]);
        assert_eq!(byob_bytes, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn byte_tee_cancels_the_source_after_both_branches() {
        let (stream, cancels) = byte_stream(&[&[1], &[2], &[3]]);
        let (branch1, branch2) = stream.tee().spawn(tokio::spawn).unwrap();

        let first = branch1.cancel(None);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
        let second = branch2.cancel(None);
        let (first, second) = timeout(Duration::from_secs(1), future::join(first, second))
            .await
            .unwrap();
        first.unwrap();
        second.unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
