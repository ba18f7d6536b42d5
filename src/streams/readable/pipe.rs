//! Piping a readable stream into a writable stream.

use super::{
    DefaultStream, ReadableStream, ReadableStreamDefaultReader, StreamState, StreamTypeMarker,
};
use crate::platform::{MaybeSend, PlatformFuture};
use crate::streams::{
    AbortSignal, Locked, StreamError, StreamResult, TransformStream, Unlocked, WritableState,
    WritableStream, WritableStreamDefaultWriter, WriteFuture,
};
use futures::{
    future::{self, poll_fn, Either},
    pin_mut, FutureExt,
};
use std::{future::Future, task::Poll};
use tracing::debug;

/// Options for [`ReadableStream::pipe_to`] and
/// [`ReadableStream::pipe_through`].
#[derive(Debug, Clone, Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    /// Stops the pipe; the source is canceled and the destination aborted
    /// with the signal's reason unless prevented.
    pub signal: Option<AbortSignal>,
}

/// A writable side and the readable side its chunks come out of.
pub struct ReadableWritablePair<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    pub readable: ReadableStream<O, DefaultStream, Unlocked>,
    pub writable: WritableStream<I, Unlocked>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> From<TransformStream<I, O>>
    for ReadableWritablePair<I, O>
{
    fn from(transform: TransformStream<I, O>) -> Self {
        let (readable, writable) = transform.split();
        Self { readable, writable }
    }
}

#[derive(Debug)]
enum Shutdown {
    Aborted(StreamError),
    SourceErrored(StreamError),
    DestErrored(StreamError),
    SourceClosed,
    DestClosed,
}

struct Pipe<T: MaybeSend + 'static, S: StreamTypeMarker> {
    source: ReadableStream<T, S, Locked>,
    reader: ReadableStreamDefaultReader<T, S>,
    writer: WritableStreamDefaultWriter<T>,
    options: StreamPipeOptions,
}

impl<T: MaybeSend + 'static, S: StreamTypeMarker> Pipe<T, S> {
    fn acquire(
        source: &ReadableStream<T, S, Unlocked>,
        destination: &WritableStream<T, Unlocked>,
        options: StreamPipeOptions,
    ) -> StreamResult<Self> {
        if destination.locked() {
            return Err(StreamError::Locked);
        }
        let (source, reader) = source.get_reader()?;
        let (_locked, writer) = destination.get_writer()?;
        Ok(Self {
            source,
            reader,
            writer,
            options,
        })
    }

    async fn run(self) -> StreamResult<()> {
        let (shutdown, last_write) = self.pump().await;
        debug!(?shutdown, "pipe shutting down");
        let result = self.shut_down(shutdown, last_write).await;
        let Pipe { reader, writer, .. } = self;
        writer.release_lock();
        reader.release_lock();
        result
    }

    fn check(&self) -> Option<Shutdown> {
        if let Some(signal) = &self.options.signal {
            if signal.is_aborted() {
                let reason = signal.reason().unwrap_or(StreamError::Aborted(None));
                return Some(Shutdown::Aborted(reason));
            }
        }
        let dest = self.writer.stream();
        if self.source.state() == StreamState::Errored {
            let error = self.source.stored_error().unwrap_or(StreamError::TaskDropped);
            return Some(Shutdown::SourceErrored(error));
        }
        if matches!(dest.state(), WritableState::Erroring | WritableState::Errored) {
            let error = dest.stored_error().unwrap_or(StreamError::TaskDropped);
            return Some(Shutdown::DestErrored(error));
        }
        if self.source.state() == StreamState::Closed {
            return Some(Shutdown::SourceClosed);
        }
        if dest.close_queued_or_in_flight() || dest.state() == WritableState::Closed {
            return Some(Shutdown::DestClosed);
        }
        None
    }

    /// Moves chunks until a shutdown condition holds. Writes are not awaited;
    /// the last one is returned so shutdown can wait for it.
    async fn pump(&self) -> (Shutdown, Option<WriteFuture>) {
        let mut source_closed = self.reader.closed();
        let mut dest_closed = self.writer.closed();
        let mut aborted = self
            .options
            .signal
            .as_ref()
            .map(|signal| Box::pin(signal.aborted()));
        let mut last_write = None;

        loop {
            if let Some(shutdown) = self.check() {
                return (shutdown, last_write);
            }

            let progress = async {
                // a rejected ready means the destination is erroring
                self.writer.ready().await.ok()?;
                self.reader.read().await.ok().flatten()
            };
            let changed = poll_fn(|cx| {
                let source = source_closed.poll_unpin(cx).is_ready();
                let dest = dest_closed.poll_unpin(cx).is_ready();
                let signal = aborted
                    .as_mut()
                    .is_some_and(|aborted| aborted.as_mut().poll(cx).is_ready());
                if source || dest || signal {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            });
            pin_mut!(progress);

            if let Either::Left((Some(chunk), _)) = future::select(progress, changed).await {
                last_write = Some(self.writer.write(chunk));
            }
        }
    }

    async fn shut_down(
        &self,
        shutdown: Shutdown,
        last_write: Option<WriteFuture>,
    ) -> StreamResult<()> {
        let options = &self.options;
        match shutdown {
            Shutdown::Aborted(error) => {
                let abort_dest = !options.prevent_abort
                    && self.writer.stream().state() == WritableState::Writable;
                let cancel_source =
                    !options.prevent_cancel && self.source.state() == StreamState::Readable;
                let reason = error.clone();
                self.with_action(Some(error), last_write, || async move {
                    let abort = async {
                        if abort_dest {
                            self.writer.abort(Some(reason.clone())).await
                        } else {
                            Ok(())
                        }
                    };
                    let cancel = async {
                        if cancel_source {
                            self.reader.cancel(Some(reason.clone())).await
                        } else {
                            Ok(())
                        }
                    };
                    let (aborted, canceled) = future::join(abort, cancel).await;
                    aborted.and(canceled)
                })
                .await
            }
            Shutdown::SourceErrored(error) if !options.prevent_abort => {
                let reason = error.clone();
                self.with_action(Some(error), last_write, || self.writer.abort(Some(reason)))
                    .await
            }
            Shutdown::DestErrored(error) if !options.prevent_cancel => {
                let reason = error.clone();
                self.with_action(Some(error), last_write, || self.reader.cancel(Some(reason)))
                    .await
            }
            Shutdown::SourceClosed if !options.prevent_close => {
                self.with_action(None, last_write, || {
                    self.writer.close_with_error_propagation()
                })
                .await
            }
            Shutdown::DestClosed if !options.prevent_cancel => {
                let error = dest_closed_error();
                let reason = error.clone();
                self.with_action(Some(error), last_write, || self.reader.cancel(Some(reason)))
                    .await
            }
            Shutdown::SourceErrored(error) | Shutdown::DestErrored(error) => {
                self.wait_for_pending_writes(last_write).await;
                Err(error)
            }
            Shutdown::SourceClosed => {
                self.wait_for_pending_writes(last_write).await;
                Ok(())
            }
            Shutdown::DestClosed => {
                self.wait_for_pending_writes(last_write).await;
                Err(dest_closed_error())
            }
        }
    }

    /// Runs `action` once pending writes have finished. The action's own
    /// failure wins over `original`.
    async fn with_action<A, F>(
        &self,
        original: Option<StreamError>,
        last_write: Option<WriteFuture>,
        action: A,
    ) -> StreamResult<()>
    where
        A: FnOnce() -> F,
        F: Future<Output = StreamResult<()>>,
    {
        self.wait_for_pending_writes(last_write).await;
        action().await?;
        match original {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn wait_for_pending_writes(&self, last_write: Option<WriteFuture>) {
        let dest = self.writer.stream();
        if dest.state() != WritableState::Writable || dest.close_queued_or_in_flight() {
            return;
        }
        // writes settle in order
        if let Some(write) = last_write {
            let _ = write.await;
        }
    }
}

fn dest_closed_error() -> StreamError {
    StreamError::type_error(
        "the destination writable stream closed before all data could be piped to it",
    )
}

impl<T, S> ReadableStream<T, S, Unlocked>
where
    T: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    /// Pipes every chunk into `destination`, honoring its backpressure.
    ///
    /// Both streams are locked before this returns; a locked source or
    /// destination makes the returned future fail with
    /// [`StreamError::Locked`]. The future must be polled for the pipe to
    /// make progress, and resolves once both locks are released.
    ///
    /// ```no_run
    /// # async fn demo() -> lws_streams::StreamResult<()> {
    /// use lws_streams::{ReadableStream, StreamPipeOptions, WritableStream, WritableSink};
    ///
    /// struct Print;
    /// impl WritableSink<u32> for Print {
    ///     async fn write(
    ///         &mut self,
    ///         chunk: u32,
    ///         _controller: &mut lws_streams::WritableStreamDefaultController,
    ///     ) -> lws_streams::StreamResult<()> {
    ///         println!("{chunk}");
    ///         Ok(())
    ///     }
    /// }
    ///
    /// let source = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
    /// let sink = WritableStream::builder(Print).spawn(tokio::spawn);
    /// source.pipe_to(&sink, StreamPipeOptions::default()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn pipe_to(
        &self,
        destination: &WritableStream<T, Unlocked>,
        options: StreamPipeOptions,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let pipe = Pipe::acquire(self, destination, options);
        async move { pipe?.run().await }
    }

    /// Pipes into `pair.writable` and hands back `pair.readable`.
    ///
    /// Fails with [`StreamError::Locked`] if this stream or the pair's
    /// writable side is locked.
    pub fn pipe_through<O>(
        &self,
        pair: impl Into<ReadableWritablePair<T, O>>,
        options: StreamPipeOptions,
    ) -> StreamResult<PipeBuilder<T, O, S>>
    where
        O: MaybeSend + 'static,
    {
        let pair = pair.into();
        if pair.readable.locked() {
            return Err(StreamError::Locked);
        }
        let pipe = Pipe::acquire(self, &pair.writable, options)?;
        Ok(PipeBuilder {
            readable: pair.readable,
            pipe,
        })
    }
}

/// The readable end of [`ReadableStream::pipe_through`] and the pipe
/// feeding it.
pub struct PipeBuilder<T: MaybeSend + 'static, O: MaybeSend + 'static, S: StreamTypeMarker> {
    readable: ReadableStream<O, DefaultStream, Unlocked>,
    pipe: Pipe<T, S>,
}

impl<T, O, S> PipeBuilder<T, O, S>
where
    T: MaybeSend + 'static,
    O: MaybeSend + 'static,
    S: StreamTypeMarker,
{
    /// Returns the readable side and the pipe future without spawning it.
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<O, DefaultStream, Unlocked>,
        impl Future<Output = StreamResult<()>> + MaybeSend + 'static,
    ) {
        (self.readable, self.pipe.run())
    }

    /// Spawns the pipe. Its result is only logged; errors reach the readable
    /// side through the pair.
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<O, DefaultStream, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (readable, pipe) = self.prepare();
        spawn_fn(Box::pin(pipe.map(|result| {
            if let Err(error) = result {
                debug!(%error, "pipe_through finished with an error");
            }
        })));
        readable
    }
}
