//! End-to-end properties of the stream engine, driven on tokio.
#![cfg(feature = "send")]

use lws_streams::{
    queue::SizedQueue, ByteView, ReadableByteSource, ReadableByteStreamController, ReadableSource,
    ReadableStream, ReadableStreamDefaultController, StreamError, StreamPipeOptions, StreamResult,
    TransformStream, WritableSink, WritableStream, WritableStreamDefaultController,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::timeout;

#[derive(Clone, Default)]
struct ArraySink {
    chunks: Arc<Mutex<Vec<u32>>>,
    closed: Arc<AtomicBool>,
}

impl WritableSink<u32> for ArraySink {
    async fn write(
        &mut self,
        chunk: u32,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        self.chunks.lock().push(chunk);
        Ok(())
    }

    async fn close(self) -> StreamResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn queue_total_tracks_entry_sizes() {
    let mut queue = SizedQueue::new();
    let mut sizes = std::collections::VecDeque::new();
    let mut rng = StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d);
    for step in 0..500u32 {
        if rng.gen_range(0..3) == 0 {
            if queue.dequeue().is_some() {
                sizes.pop_front();
            }
        } else {
            let size = rng.gen_range(0.0..1000.0) / 7.0;
            queue.enqueue(step, size).unwrap();
            sizes.push_back(size);
        }
        let expected: f64 = sizes.iter().sum();
        assert!((queue.total_size() - expected).abs() < 1e-6);
        assert_eq!(queue.len(), sizes.len());
    }
}

#[tokio::test]
async fn piping_an_array_reproduces_it_and_closes_both_ends() {
    let source = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
    let sink = ArraySink::default();
    let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);

    timeout(
        Duration::from_secs(1),
        source.pipe_to(&dest, StreamPipeOptions::default()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(*sink.chunks.lock(), vec![1, 2, 3]);
    assert!(sink.closed.load(Ordering::SeqCst));
    let (_locked, reader) = source.get_reader().unwrap();
    assert_eq!(reader.read().await.unwrap(), None);
}

struct Counter {
    next: u32,
    cancels: Arc<AtomicUsize>,
}

impl ReadableSource<u32> for Counter {
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
        if self.next == 10 {
            return controller.close();
        }
        controller.enqueue(self.next)?;
        self.next += 1;
        Ok(())
    }

    async fn cancel(&mut self, _reason: Option<StreamError>) -> StreamResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn canceled_tee_branch_does_not_starve_the_other() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let source = ReadableStream::builder(Counter {
        next: 0,
        cancels: cancels.clone(),
    })
    .spawn(tokio::spawn);
    let (branch1, branch2) = source.tee().spawn(tokio::spawn).unwrap();

    let canceled = branch1.cancel(None);
    let (_locked, reader) = branch2.get_reader().unwrap();
    assert_eq!(reader.read_all().await.unwrap(), (0..10).collect::<Vec<_>>());
    timeout(Duration::from_secs(1), canceled).await.unwrap().unwrap();
    assert_eq!(cancels.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn canceling_both_tee_branches_cancels_upstream_once() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let source = ReadableStream::builder(Counter {
        next: 0,
        cancels: cancels.clone(),
    })
    .spawn(tokio::spawn);
    let (branch1, branch2) = source.tee().spawn(tokio::spawn).unwrap();

    let (first, second) = tokio::join!(branch1.cancel(None), branch2.cancel(None));
    first.unwrap();
    second.unwrap();
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
}

/// Records when each write starts and ends.
#[derive(Clone, Default)]
struct TimelineSink {
    events: Arc<Mutex<Vec<(u32, &'static str)>>>,
}

impl WritableSink<u32> for TimelineSink {
    async fn write(
        &mut self,
        chunk: u32,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        self.events.lock().push((chunk, "start"));
        tokio::time::sleep(Duration::from_millis(u64::from(5 - chunk))).await;
        self.events.lock().push((chunk, "end"));
        Ok(())
    }
}

#[tokio::test]
async fn writes_commit_one_at_a_time_in_issue_order() {
    let sink = TimelineSink::default();
    let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);
    let (_locked, writer) = dest.get_writer().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let writes: Vec<_> = (0..5)
        .map(|n| {
            let write = writer.write(n);
            let order = order.clone();
            async move {
                write.await.unwrap();
                order.lock().push(n);
            }
        })
        .collect();
    futures::future::join_all(writes).await;

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    let expected: Vec<(u32, &str)> = (0..5).flat_map(|n| [(n, "start"), (n, "end")]).collect();
    assert_eq!(*sink.events.lock(), expected);
}

/// Hands out one byte per pull.
struct Trickle {
    remaining: Vec<u8>,
}

impl ReadableByteSource for Trickle {
    async fn pull(&mut self, controller: &mut ReadableByteStreamController) -> StreamResult<()> {
        if self.remaining.is_empty() {
            return controller.close();
        }
        let byte = self.remaining.remove(0);
        match controller.byob_request() {
            Some(request) => request.fill(&[byte]).map(|_| ()),
            None => controller.enqueue(vec![byte]),
        }
    }
}

#[tokio::test]
async fn byob_read_waits_for_min_elements() {
    let stream = ReadableStream::builder_bytes(Trickle {
        remaining: vec![1, 2, 3, 4, 5],
    })
    .spawn(tokio::spawn);
    let (_locked, reader) = stream.get_byob_reader().unwrap();

    let result = reader.read_with_min(ByteView::zeroed(4), 3).await.unwrap();
    let view = result.value.unwrap();
    assert!(!result.done);
    assert!(view.len() >= 3);
    assert_eq!(view.as_bytes(), &[1, 2, 3, 4][..view.len()]);

    let mut rest = Vec::new();
    loop {
        let result = reader.read(ByteView::zeroed(4)).await.unwrap();
        let view = result.value.unwrap();
        if result.done {
            assert!(view.is_empty());
            break;
        }
        rest.extend_from_slice(view.as_bytes());
    }
    let mut all = view.as_bytes().to_vec();
    all.extend(rest);
    assert_eq!(all, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn identity_transform_round_trips_repeatedly() {
    for _ in 0..5 {
        let transform = TransformStream::<&str, &str>::identity().spawn(tokio::spawn);
        let (_wl, writer) = transform.writable().get_writer().unwrap();
        let (_rl, reader) = transform.readable().get_reader().unwrap();

        let writing = async {
            for chunk in ["a", "b", "c"] {
                writer.write(chunk).await.unwrap();
            }
            writer.close().await.unwrap();
        };
        let (_, read) = tokio::join!(writing, reader.read_all());
        assert_eq!(read.unwrap(), vec!["a", "b", "c"]);
    }
}

#[tokio::test]
async fn repeated_close_never_settles_twice() {
    let sink = ArraySink::default();
    let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);
    let (_locked, writer) = dest.get_writer().unwrap();

    let first = writer.close();
    let second = writer.close();
    first.await.unwrap();
    assert!(matches!(
        second.await,
        Err(StreamError::Closing) | Err(StreamError::Closed)
    ));
    assert!(matches!(writer.close().await, Err(StreamError::Closed)));
    writer.closed().await.unwrap();

    let released = writer.release_lock();
    assert!(!released.locked());
    assert!(released.get_writer().is_ok());
}

#[tokio::test]
async fn controller_close_is_idempotent_for_readers() {
    struct CloseTwice;
    impl ReadableSource<u32> for CloseTwice {
        async fn start(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            controller.enqueue(1)?;
            controller.close()?;
            controller.close()?;
            Ok(())
        }

        async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            Ok(())
        }
    }

    let stream = ReadableStream::builder(CloseTwice).spawn(tokio::spawn);
    let (_locked, reader) = stream.get_reader().unwrap();
    assert_eq!(reader.read_all().await.unwrap(), vec![1]);
    reader.closed().await.unwrap();
    assert_eq!(reader.read().await.unwrap(), None);
}
