use super::{
    call_pull_if_needed, should_call_pull, ReadRequest, ReadableController, ReadableCore,
    StreamState,
};
use crate::platform::{BoxedStrategy, MaybeSend, SharedPtr};
use crate::streams::{queue::SizedQueue, StreamError, StreamResult};
use parking_lot::Mutex;

/// Object-mode controller state.
pub(crate) struct DefaultReadableState<T> {
    core: ReadableCore<T>,
    queue: SizedQueue<T>,
    strategy: BoxedStrategy<T>,
    high_water_mark: f64,
}

impl<T: MaybeSend + 'static> DefaultReadableState<T> {
    pub(crate) fn new(strategy: BoxedStrategy<T>) -> Self {
        let high_water_mark = strategy.high_water_mark() as f64;
        Self {
            core: ReadableCore::new(),
            queue: SizedQueue::new(),
            strategy,
            high_water_mark,
        }
    }

    pub(crate) fn enqueue(&mut self, chunk: T) -> StreamResult<()> {
        if !self.core.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits enqueue",
            ));
        }

        if self.core.num_read_requests() > 0 {
            self.core.fulfill_read_request(chunk, false);
        } else {
            let size = self.strategy.size(&chunk);
            if let Err(error) = self.queue.enqueue(chunk, size) {
                self.error_controller(error.clone());
                return Err(error);
            }
        }

        call_pull_if_needed(self);
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if !self.core.can_close_or_enqueue() {
            return;
        }
        self.core.close_requested = true;
        if self.queue.is_empty() {
            self.core.clear_algorithms();
            self.core.close();
        }
    }

    /// True when a pull would not be issued right now.
    pub(crate) fn has_backpressure(&self) -> bool {
        !should_call_pull(self)
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.core.can_close_or_enqueue()
    }
}

impl<T: MaybeSend + 'static> ReadableController for DefaultReadableState<T> {
    type Chunk = T;

    fn core(&self) -> &ReadableCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReadableCore<T> {
        &mut self.core
    }

    fn desired_size(&self) -> Option<f64> {
        match self.core.state {
            StreamState::Errored => None,
            StreamState::Closed => Some(0.0),
            StreamState::Readable => Some(self.high_water_mark - self.queue.total_size()),
        }
    }

    fn pull_steps(&mut self, request: ReadRequest<T>) {
        match self.queue.dequeue() {
            Some(chunk) => {
                if self.core.close_requested && self.queue.is_empty() {
                    self.core.clear_algorithms();
                    self.core.close();
                } else {
                    call_pull_if_needed(self);
                }
                let _ = request.send(Ok(Some(chunk)));
            }
            None => {
                self.core.add_read_request(request);
                call_pull_if_needed(self);
            }
        }
    }

    fn cancel_steps(&mut self) {
        self.queue.reset();
    }

    fn release_steps(&mut self) {}

    fn error_controller(&mut self, error: StreamError) {
        if self.core.state != StreamState::Readable {
            return;
        }
        self.queue.reset();
        self.core.clear_algorithms();
        self.core.error(error);
    }
}

/// Handle given to a [`super::ReadableSource`] for feeding its stream.
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    state: SharedPtr<Mutex<DefaultReadableState<T>>>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(state: SharedPtr<Mutex<DefaultReadableState<T>>>) -> Self {
        Self { state }
    }

    pub(crate) fn shared(&self) -> SharedPtr<Mutex<DefaultReadableState<T>>> {
        self.state.clone()
    }

    /// `None` once errored, `0` once closed, else high-water mark minus the
    /// queued size.
    pub fn desired_size(&self) -> Option<f64> {
        self.state.lock().desired_size()
    }

    /// Closes the stream once queued chunks are read. Closing twice is a
    /// no-op.
    pub fn close(&self) -> StreamResult<()> {
        self.state.lock().close();
        Ok(())
    }

    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.state.lock().enqueue(chunk)
    }

    pub fn error(&self, error: StreamError) {
        self.state.lock().error_controller(error);
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.state.lock().has_backpressure()
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.state.lock().can_close_or_enqueue()
    }

    pub(crate) fn stream_state(&self) -> (StreamState, Option<StreamError>) {
        let state = self.state.lock();
        (state.core.state, state.core.stored_error.clone())
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::super::{ReadableSource, ReadableStream};
    use super::*;
    use crate::streams::{CountQueuingStrategy, QueuingStrategy};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    struct CountingSource {
        pulls: Arc<AtomicUsize>,
        next: u32,
        limit: u32,
    }

    impl ReadableSource<u32> for CountingSource {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<u32>,
        ) -> StreamResult<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.next == self.limit {
                controller.close()?;
            } else {
                controller.enqueue(self.next)?;
                self.next += 1;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn fills_up_to_high_water_mark_without_reads() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let stream = ReadableStream::builder(CountingSource {
            pulls: pulls.clone(),
            next: 0,
            limit: 100,
        })
        .strategy(CountQueuingStrategy::new(3))
        .spawn(tokio::spawn);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pulls.load(Ordering::SeqCst), 3);

        let (_locked, reader) = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pulls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn close_waits_for_queue_to_drain() {
        struct Eager;
        impl ReadableSource<&'static str> for Eager {
            async fn start(
                &mut self,
                controller: &mut ReadableStreamDefaultController<&'static str>,
            ) -> StreamResult<()> {
                controller.enqueue("a")?;
                controller.enqueue("b")?;
                controller.close()?;
                // closing twice is fine
                controller.close()?;
                assert!(controller.enqueue("c").is_err());
                Ok(())
            }

            async fn pull(
                &mut self,
                _controller: &mut ReadableStreamDefaultController<&'static str>,
            ) -> StreamResult<()> {
                Ok(())
            }
        }

        let stream = ReadableStream::builder(Eager)
            .strategy(CountQueuingStrategy::new(10))
            .spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some("a"));
        assert_eq!(reader.read().await.unwrap(), Some("b"));
        assert_eq!(reader.read().await.unwrap(), None);
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_chunk_size_errors_the_stream() {
        struct NegativeSize;
        impl QueuingStrategy<i32> for NegativeSize {
            fn size(&self, _chunk: &i32) -> f64 {
                -1.0
            }
            fn high_water_mark(&self) -> usize {
                1
            }
        }

        struct Source;
        impl ReadableSource<i32> for Source {
            async fn pull(
                &mut self,
                controller: &mut ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                let result = controller.enqueue(1);
                assert!(matches!(result, Err(StreamError::Range(_))));
                assert_eq!(controller.desired_size(), None);
                Ok(())
            }
        }

        let stream = ReadableStream::builder(Source)
            .strategy(NegativeSize)
            .spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        assert!(matches!(reader.read().await, Err(StreamError::Range(_))));
        assert!(matches!(reader.closed().await, Err(StreamError::Range(_))));
    }

    #[tokio::test]
    async fn pull_failure_errors_pending_reads() {
        struct Failing;
        impl ReadableSource<i32> for Failing {
            async fn pull(
                &mut self,
                _controller: &mut ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                Err("boom".into())
            }
        }

        let stream = ReadableStream::builder(Failing).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        let again = reader.read().await.unwrap_err();
        assert_eq!(again.to_string(), "boom");
    }

    #[tokio::test]
    async fn desired_size_tracks_queue() {
        struct Idle;
        impl ReadableSource<u8> for Idle {
            async fn pull(
                &mut self,
                _controller: &mut ReadableStreamDefaultController<u8>,
            ) -> StreamResult<()> {
                Ok(())
            }
        }

        let (stream, controller, driver) = ReadableStream::new_default_parts(
            Idle,
            Box::new(CountQueuingStrategy::new(2)),
        );
        tokio::spawn(driver);
        assert_eq!(controller.desired_size(), Some(2.0));
        controller.enqueue(1).unwrap();
        assert_eq!(controller.desired_size(), Some(1.0));
        controller.enqueue(2).unwrap();
        controller.enqueue(3).unwrap();
        assert_eq!(controller.desired_size(), Some(-1.0));

        controller.close().unwrap();
        let (_locked, reader) = stream.get_reader().unwrap();
        assert_eq!(reader.read_all().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(controller.desired_size(), Some(0.0));

        controller.error("late".into());
        assert_eq!(controller.desired_size(), Some(0.0));
    }
}
