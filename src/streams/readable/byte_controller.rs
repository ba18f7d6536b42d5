//! Byte stream controller.
//!
//! Reads on a byte stream are served either from the byte queue or by a
//! pull-into descriptor: a caller-owned buffer the source writes into
//! through a [`ReadableStreamBYOBRequest`]. Default reads only get a
//! descriptor when `auto_allocate_chunk_size` is set.

use super::{
    call_pull_if_needed, ReadIntoRequest, ReadRequest, ReadableController, ReadableCore,
    StreamState,
};
use crate::platform::SharedPtr;
use crate::streams::{queue::SizedQueue, ByobReadResult, ByteView, StreamError, StreamResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

const INSUFFICIENT_BYTES: &str = "Insufficient bytes to fill elements in the given buffer";

/// A queued byte range. Partially read chunks advance `byte_offset`.
struct ByteChunk {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
}

impl ByteChunk {
    fn bytes(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    fn into_vec(self) -> Vec<u8> {
        if self.byte_offset == 0 && self.byte_length == self.buffer.len() {
            self.buffer
        } else {
            self.bytes().to_vec()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullIntoKind {
    Default,
    Byob,
    /// The reader that issued the read released its lock.
    None,
}

struct PullIntoDescriptor {
    buffer: Vec<u8>,
    buffer_byte_length: usize,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    element_size: usize,
    kind: PullIntoKind,
    /// The buffer was moved out through `take_view` and has not come back.
    detached: bool,
}

impl PullIntoDescriptor {
    fn filled_view(self) -> ByteView {
        ByteView::from_parts(
            self.buffer,
            self.byte_offset,
            self.bytes_filled,
            self.element_size,
        )
    }

    fn unfilled(&mut self) -> &mut [u8] {
        let start = self.byte_offset + self.bytes_filled;
        let end = self.byte_offset + self.byte_length;
        &mut self.buffer[start..end]
    }
}

/// Copies queued bytes into `descriptor`. Returns true once it holds at
/// least its minimum fill, rounded down to whole elements.
fn fill_from_queue(
    queue: &mut SizedQueue<ByteChunk>,
    descriptor: &mut PullIntoDescriptor,
) -> bool {
    let queued = queue.total_size() as usize;
    let max_bytes_to_copy = queued.min(descriptor.byte_length - descriptor.bytes_filled);
    let max_bytes_filled = descriptor.bytes_filled + max_bytes_to_copy;
    let max_aligned_bytes = max_bytes_filled - max_bytes_filled % descriptor.element_size;

    let mut remaining = max_bytes_to_copy;
    let mut ready = false;
    if max_aligned_bytes >= descriptor.minimum_fill {
        remaining = max_aligned_bytes - descriptor.bytes_filled;
        ready = true;
    }

    while remaining > 0 {
        let Some(head) = queue.peek_mut() else {
            break;
        };
        let count = remaining.min(head.byte_length);
        let dest = descriptor.byte_offset + descriptor.bytes_filled;
        descriptor.buffer[dest..dest + count]
            .copy_from_slice(&head.buffer[head.byte_offset..head.byte_offset + count]);
        if head.byte_length == count {
            queue.dequeue();
        } else {
            head.byte_offset += count;
            head.byte_length -= count;
            queue.consume_head(count as f64);
        }
        descriptor.bytes_filled += count;
        remaining -= count;
    }
    ready
}

/// Byte-mode controller state.
pub(crate) struct ByteReadableState {
    core: ReadableCore<Vec<u8>>,
    queue: SizedQueue<ByteChunk>,
    high_water_mark: f64,
    auto_allocate_chunk_size: Option<usize>,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    byob_request: Option<u64>,
    /// A request whose descriptor the close already committed.
    committed_on_close: Option<u64>,
    next_request_id: u64,
}

impl ByteReadableState {
    pub(crate) fn new(high_water_mark: usize, auto_allocate_chunk_size: Option<usize>) -> Self {
        Self {
            core: ReadableCore::new(),
            queue: SizedQueue::new(),
            high_water_mark: high_water_mark as f64,
            auto_allocate_chunk_size,
            pending_pull_intos: VecDeque::new(),
            byob_request: None,
            committed_on_close: None,
            next_request_id: 1,
        }
    }

    fn queued_bytes(&self) -> usize {
        self.queue.total_size() as usize
    }

    fn enqueue_chunk_to_queue(&mut self, buffer: Vec<u8>, byte_offset: usize, byte_length: usize) {
        let chunk = ByteChunk {
            buffer,
            byte_offset,
            byte_length,
        };
        // byte counts are always valid sizes
        let _ = self.queue.enqueue(chunk, byte_length as f64);
    }

    fn enqueue_cloned_chunk_to_queue(&mut self, bytes: &[u8]) {
        self.enqueue_chunk_to_queue(bytes.to_vec(), 0, bytes.len());
    }

    fn invalidate_byob_request(&mut self) {
        self.byob_request = None;
    }

    fn clear_pending_pull_intos(&mut self) {
        self.invalidate_byob_request();
        self.pending_pull_intos.clear();
    }

    /// Moves whatever a released reader's descriptor received into the queue.
    fn enqueue_detached_pull_into_to_queue(&mut self) {
        if let Some(descriptor) = self.pending_pull_intos.pop_front() {
            if descriptor.bytes_filled > 0 {
                let start = descriptor.byte_offset;
                self.enqueue_cloned_chunk_to_queue(
                    &descriptor.buffer[start..start + descriptor.bytes_filled],
                );
            }
        }
    }

    fn handle_queue_drain(&mut self) {
        if self.core.state != StreamState::Readable {
            return;
        }
        if self.queue.is_empty() && self.core.close_requested {
            self.core.clear_algorithms();
            self.core.close();
        } else {
            call_pull_if_needed(self);
        }
    }

    fn fill_read_request_from_queue(&mut self, request: ReadRequest<Vec<u8>>) {
        match self.queue.dequeue() {
            Some(chunk) => {
                self.handle_queue_drain();
                let _ = request.send(Ok(Some(chunk.into_vec())));
            }
            None => self.core.add_read_request(request),
        }
    }

    fn process_read_requests_using_queue(&mut self) {
        while !self.queue.is_empty() {
            let Some(request) = self.core.pop_read_request() else {
                return;
            };
            self.fill_read_request_from_queue(request);
        }
    }

    fn process_pull_into_descriptors_using_queue(&mut self) -> Vec<PullIntoDescriptor> {
        let mut filled = Vec::new();
        while !self.queue.is_empty() {
            let Some(descriptor) = self.pending_pull_intos.front_mut() else {
                break;
            };
            if fill_from_queue(&mut self.queue, descriptor) {
                if let Some(descriptor) = self.pending_pull_intos.pop_front() {
                    filled.push(descriptor);
                }
            }
        }
        filled
    }

    fn commit_pull_into_descriptor(&mut self, descriptor: PullIntoDescriptor) {
        let done = self.core.state == StreamState::Closed;
        match descriptor.kind {
            PullIntoKind::Default => {
                let bytes = descriptor.filled_view().into_bytes();
                self.core.fulfill_read_request(bytes, done);
            }
            PullIntoKind::Byob => {
                self.core
                    .fulfill_read_into_request(descriptor.filled_view(), done);
            }
            PullIntoKind::None => {}
        }
    }

    fn commit_pull_into_descriptors(&mut self, descriptors: Vec<PullIntoDescriptor>) {
        for descriptor in descriptors {
            self.commit_pull_into_descriptor(descriptor);
        }
    }

    pub(crate) fn enqueue(&mut self, chunk: ByteView) -> StreamResult<()> {
        if chunk.byte_length() == 0 {
            return Err(StreamError::type_error("chunk must have non-zero byteLength"));
        }
        if self.core.close_requested {
            return Err(StreamError::type_error("stream is closed or draining"));
        }
        if self.core.state != StreamState::Readable {
            return Err(StreamError::type_error(
                "The stream is not in the readable state and cannot be enqueued to",
            ));
        }

        if let Some(head) = self.pending_pull_intos.front() {
            if head.detached {
                return Err(StreamError::type_error(
                    "The BYOB request's buffer has been detached and so cannot be filled with an enqueued chunk",
                ));
            }
            let released = head.kind == PullIntoKind::None;
            self.invalidate_byob_request();
            if released {
                self.enqueue_detached_pull_into_to_queue();
            }
        }

        let byte_offset = chunk.byte_offset();
        let byte_length = chunk.byte_length();
        let buffer = chunk.into_buffer();

        if self.core.has_default_reader() {
            self.process_read_requests_using_queue();
            if self.core.num_read_requests() == 0 {
                self.enqueue_chunk_to_queue(buffer, byte_offset, byte_length);
            } else {
                // an auto-allocated descriptor is superseded by the chunk
                self.pending_pull_intos.pop_front();
                let chunk = ByteChunk {
                    buffer,
                    byte_offset,
                    byte_length,
                };
                self.core.fulfill_read_request(chunk.into_vec(), false);
            }
        } else if self.core.has_byob_reader() {
            self.enqueue_chunk_to_queue(buffer, byte_offset, byte_length);
            let filled = self.process_pull_into_descriptors_using_queue();
            self.commit_pull_into_descriptors(filled);
        } else {
            self.enqueue_chunk_to_queue(buffer, byte_offset, byte_length);
        }

        call_pull_if_needed(self);
        Ok(())
    }

    /// Closes the stream, or defers until queued bytes are read.
    ///
    /// Pending BYOB reads are committed as done unless the source has taken
    /// the head buffer with `take_view`; in that case the close completes
    /// when it hands a zero-length view back with `respond_with_new_view`.
    /// A zero-length response to a request committed here is accepted.
    pub(crate) fn close(&mut self) -> StreamResult<()> {
        if !self.core.can_close_or_enqueue() {
            return Ok(());
        }
        if !self.queue.is_empty() {
            self.core.close_requested = true;
            return Ok(());
        }
        if let Some(head) = self.pending_pull_intos.front() {
            if head.bytes_filled % head.element_size != 0 {
                let error = StreamError::type_error(INSUFFICIENT_BYTES);
                self.error_controller(error.clone());
                return Err(error);
            }
        }

        self.core.clear_algorithms();
        self.core.close();

        let head_detached = self
            .pending_pull_intos
            .front()
            .map_or(true, |head| head.detached);
        if !head_detached {
            self.committed_on_close = self.byob_request.take();
            self.respond_in_closed_state();
        }
        Ok(())
    }

    pub(crate) fn byob_read(
        &mut self,
        lock_id: u64,
        view: ByteView,
        min: usize,
        request: ReadIntoRequest,
    ) {
        if !self.core.is_reader(lock_id) {
            let _ = request.send(Err(StreamError::Released));
            return;
        }
        self.core.disturbed = true;
        if self.core.state == StreamState::Errored {
            let error = self.core.stored_error.clone().unwrap_or(StreamError::Closed);
            let _ = request.send(Err(error));
            return;
        }

        let element_size = view.element_size();
        let byte_offset = view.byte_offset();
        let byte_length = view.byte_length();
        let buffer = view.into_buffer();
        let mut descriptor = PullIntoDescriptor {
            buffer_byte_length: buffer.len(),
            buffer,
            byte_offset,
            byte_length,
            bytes_filled: 0,
            minimum_fill: min * element_size,
            element_size,
            kind: PullIntoKind::Byob,
            detached: false,
        };

        if !self.pending_pull_intos.is_empty() {
            self.pending_pull_intos.push_back(descriptor);
            self.core.add_read_into_request(request);
            return;
        }

        if self.core.state == StreamState::Closed {
            let empty = ByteView::from_parts(descriptor.buffer, byte_offset, 0, element_size);
            let _ = request.send(Ok(ByobReadResult {
                value: Some(empty),
                done: true,
            }));
            return;
        }

        if !self.queue.is_empty() {
            if fill_from_queue(&mut self.queue, &mut descriptor) {
                let filled = descriptor.filled_view();
                self.handle_queue_drain();
                let _ = request.send(Ok(ByobReadResult {
                    value: Some(filled),
                    done: false,
                }));
                return;
            }
            if self.core.close_requested {
                let error = StreamError::type_error(INSUFFICIENT_BYTES);
                self.error_controller(error.clone());
                let _ = request.send(Err(error));
                return;
            }
        }

        self.pending_pull_intos.push_back(descriptor);
        self.core.add_read_into_request(request);
        call_pull_if_needed(self);
    }

    fn byob_request(&mut self) -> Option<u64> {
        if self.byob_request.is_none() && !self.pending_pull_intos.is_empty() {
            let id = self.next_request_id;
            self.next_request_id += 1;
            self.byob_request = Some(id);
        }
        self.byob_request
    }

    /// The head descriptor, if `request_id` still names the live request.
    fn request_head(&mut self, request_id: u64) -> StreamResult<&mut PullIntoDescriptor> {
        if self.byob_request != Some(request_id) {
            return Err(StreamError::type_error("This BYOB request has been invalidated"));
        }
        self.pending_pull_intos
            .front_mut()
            .ok_or_else(|| StreamError::type_error("This BYOB request has been invalidated"))
    }

    fn attached_head(&mut self, request_id: u64) -> StreamResult<&mut PullIntoDescriptor> {
        let head = self.request_head(request_id)?;
        if head.detached {
            return Err(StreamError::type_error(
                "The BYOB request's buffer has been detached and so cannot be used as a response",
            ));
        }
        Ok(head)
    }

    fn request_view_len(&mut self, request_id: u64) -> StreamResult<usize> {
        let head = self.request_head(request_id)?;
        Ok(head.byte_length - head.bytes_filled)
    }

    fn with_request_view<R>(
        &mut self,
        request_id: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> StreamResult<R> {
        let head = self.attached_head(request_id)?;
        Ok(f(head.unfilled()))
    }

    fn take_request_view(&mut self, request_id: u64) -> StreamResult<ByteView> {
        let head = self.attached_head(request_id)?;
        let buffer = std::mem::take(&mut head.buffer);
        head.detached = true;
        Ok(ByteView::from_parts(
            buffer,
            head.byte_offset + head.bytes_filled,
            head.byte_length - head.bytes_filled,
            1,
        ))
    }

    /// A zero-length response to a request the close already committed.
    fn acknowledge_committed(&mut self, request_id: u64, bytes_written: usize) -> bool {
        if bytes_written != 0 || self.committed_on_close != Some(request_id) {
            return false;
        }
        self.committed_on_close = None;
        true
    }

    fn respond(&mut self, request_id: u64, bytes_written: usize) -> StreamResult<()> {
        if self.acknowledge_committed(request_id, bytes_written) {
            return Ok(());
        }
        let closed = self.core.state == StreamState::Closed;
        let head = self.attached_head(request_id)?;
        if closed {
            if bytes_written != 0 {
                return Err(StreamError::type_error(
                    "bytesWritten must be 0 when calling respond() on a closed stream",
                ));
            }
        } else {
            if bytes_written == 0 {
                return Err(StreamError::type_error(
                    "bytesWritten must be greater than 0 when calling respond() on a readable stream",
                ));
            }
            if head.bytes_filled + bytes_written > head.byte_length {
                return Err(StreamError::range_error("bytesWritten out of range"));
            }
        }
        self.respond_internal(bytes_written);
        Ok(())
    }

    fn respond_with_new_view(&mut self, request_id: u64, view: ByteView) -> StreamResult<()> {
        if self.acknowledge_committed(request_id, view.byte_length()) {
            return Ok(());
        }
        let closed = self.core.state == StreamState::Closed;
        let head = self.request_head(request_id)?;
        if closed {
            if view.byte_length() != 0 {
                return Err(StreamError::type_error(
                    "The view's length must be 0 when calling respondWithNewView() on a closed stream",
                ));
            }
        } else if view.byte_length() == 0 {
            return Err(StreamError::type_error(
                "The view's length must be greater than 0 when calling respondWithNewView() on a readable stream",
            ));
        }
        if head.byte_offset + head.bytes_filled != view.byte_offset() {
            return Err(StreamError::range_error(
                "The region specified by view does not match byobRequest",
            ));
        }
        if head.buffer_byte_length != view.buffer_len() {
            return Err(StreamError::range_error(
                "The buffer of view has different capacity than byobRequest",
            ));
        }
        if head.bytes_filled + view.byte_length() > head.byte_length {
            return Err(StreamError::range_error(
                "The region specified by view is larger than byobRequest",
            ));
        }

        let bytes_written = view.byte_length();
        head.buffer = view.into_buffer();
        head.detached = false;
        self.respond_internal(bytes_written);
        Ok(())
    }

    fn respond_internal(&mut self, bytes_written: usize) {
        self.invalidate_byob_request();
        if self.core.state == StreamState::Closed {
            self.respond_in_closed_state();
        } else {
            self.respond_in_readable_state(bytes_written);
        }
        call_pull_if_needed(self);
    }

    fn respond_in_closed_state(&mut self) {
        if matches!(self.pending_pull_intos.front(), Some(head) if head.kind == PullIntoKind::None)
        {
            self.pending_pull_intos.pop_front();
        }
        if self.core.has_byob_reader() {
            let mut filled = Vec::new();
            for _ in 0..self.core.num_read_into_requests() {
                match self.pending_pull_intos.pop_front() {
                    Some(descriptor) => filled.push(descriptor),
                    None => break,
                }
            }
            self.commit_pull_into_descriptors(filled);
        } else {
            // default reads were already resolved by the close
            self.pending_pull_intos.clear();
        }
    }

    fn respond_in_readable_state(&mut self, bytes_written: usize) {
        let Some(head) = self.pending_pull_intos.front_mut() else {
            return;
        };
        head.bytes_filled += bytes_written;

        if head.kind == PullIntoKind::None {
            self.enqueue_detached_pull_into_to_queue();
            let filled = self.process_pull_into_descriptors_using_queue();
            self.commit_pull_into_descriptors(filled);
            return;
        }
        if head.bytes_filled < head.minimum_fill {
            return;
        }

        let Some(mut descriptor) = self.pending_pull_intos.pop_front() else {
            return;
        };
        let remainder = descriptor.bytes_filled % descriptor.element_size;
        if remainder > 0 {
            let end = descriptor.byte_offset + descriptor.bytes_filled;
            self.enqueue_cloned_chunk_to_queue(&descriptor.buffer[end - remainder..end]);
            trace!(remainder, "partial element returned to the byte queue");
        }
        descriptor.bytes_filled -= remainder;

        let filled = self.process_pull_into_descriptors_using_queue();
        self.commit_pull_into_descriptor(descriptor);
        self.commit_pull_into_descriptors(filled);
    }
}

impl ReadableController for ByteReadableState {
    type Chunk = Vec<u8>;

    fn core(&self) -> &ReadableCore<Vec<u8>> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReadableCore<Vec<u8>> {
        &mut self.core
    }

    fn desired_size(&self) -> Option<f64> {
        match self.core.state {
            StreamState::Errored => None,
            StreamState::Closed => Some(0.0),
            StreamState::Readable => Some(self.high_water_mark - self.queue.total_size()),
        }
    }

    fn pull_steps(&mut self, request: ReadRequest<Vec<u8>>) {
        if self.queued_bytes() > 0 {
            self.fill_read_request_from_queue(request);
            return;
        }
        if let Some(size) = self.auto_allocate_chunk_size {
            self.pending_pull_intos.push_back(PullIntoDescriptor {
                buffer: vec![0; size],
                buffer_byte_length: size,
                byte_offset: 0,
                byte_length: size,
                bytes_filled: 0,
                minimum_fill: 1,
                element_size: 1,
                kind: PullIntoKind::Default,
                detached: false,
            });
        }
        self.core.add_read_request(request);
        call_pull_if_needed(self);
    }

    fn cancel_steps(&mut self) {
        self.clear_pending_pull_intos();
        self.queue.reset();
    }

    fn release_steps(&mut self) {
        if let Some(mut head) = self.pending_pull_intos.pop_front() {
            head.kind = PullIntoKind::None;
            self.pending_pull_intos.clear();
            self.pending_pull_intos.push_back(head);
        }
    }

    fn error_controller(&mut self, error: StreamError) {
        if self.core.state != StreamState::Readable {
            return;
        }
        self.clear_pending_pull_intos();
        self.queue.reset();
        self.core.clear_algorithms();
        self.core.error(error);
    }
}

// ----------- Public handles -----------
/// Handle given to a [`super::ReadableByteSource`].
#[derive(Clone)]
pub struct ReadableByteStreamController {
    state: SharedPtr<Mutex<ByteReadableState>>,
}

impl ReadableByteStreamController {
    pub(crate) fn new(state: SharedPtr<Mutex<ByteReadableState>>) -> Self {
        Self { state }
    }

    pub(crate) fn shared(&self) -> SharedPtr<Mutex<ByteReadableState>> {
        self.state.clone()
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.state.lock().core.can_close_or_enqueue()
    }

    /// Free queue space in bytes; `None` once errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.state.lock().desired_size()
    }

    /// Fails with [`StreamError::Type`] if a pending BYOB read holds a
    /// partial element, which also errors the stream.
    pub fn close(&self) -> StreamResult<()> {
        self.state.lock().close()
    }

    /// Takes ownership of the chunk's buffer and hands its bytes to waiting
    /// reads or the queue.
    pub fn enqueue(&self, chunk: impl Into<ByteView>) -> StreamResult<()> {
        self.state.lock().enqueue(chunk.into())
    }

    pub fn error(&self, error: StreamError) {
        self.state.lock().error_controller(error);
    }

    /// The request for the oldest pending read, if any.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        let id = self.state.lock().byob_request()?;
        Some(ReadableStreamBYOBRequest {
            state: self.state.clone(),
            id,
        })
    }
}

/// Lets a byte source write straight into the buffer of a pending read.
///
/// The request is invalidated by a response, by `enqueue`, and when the
/// stream errors or is canceled; every method then fails with
/// [`StreamError::Type`].
pub struct ReadableStreamBYOBRequest {
    state: SharedPtr<Mutex<ByteReadableState>>,
    id: u64,
}

impl ReadableStreamBYOBRequest {
    /// Number of bytes still unfilled in the pending read's view.
    pub fn view_len(&self) -> StreamResult<usize> {
        self.state.lock().request_view_len(self.id)
    }

    /// Runs `f` over the unfilled part of the view. The stream's state is
    /// locked while `f` runs, so it must not call back into the stream.
    pub fn with_view_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> StreamResult<R> {
        self.state.lock().with_request_view(self.id, f)
    }

    /// Moves the buffer out so it can be filled across an await. Hand it back
    /// with [`respond_with_new_view`](Self::respond_with_new_view).
    pub fn take_view(&self) -> StreamResult<ByteView> {
        self.state.lock().take_request_view(self.id)
    }

    /// Reports `bytes_written` bytes written through
    /// [`with_view_mut`](Self::with_view_mut).
    pub fn respond(self, bytes_written: usize) -> StreamResult<()> {
        self.state.lock().respond(self.id, bytes_written)
    }

    /// Returns a buffer obtained from [`take_view`](Self::take_view) with
    /// its first `byte_length` bytes written.
    pub fn respond_with_new_view(self, view: ByteView) -> StreamResult<()> {
        self.state.lock().respond_with_new_view(self.id, view)
    }

    /// Copies as much of `bytes` as fits and responds with that count.
    pub fn fill(self, bytes: &[u8]) -> StreamResult<usize> {
        let mut state = self.state.lock();
        let written = state.with_request_view(self.id, |view| {
            let count = view.len().min(bytes.len());
            view[..count].copy_from_slice(&bytes[..count]);
            count
        })?;
        state.respond(self.id, written)?;
        Ok(written)
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::super::{ReadableByteSource, ReadableStream};
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    /// Produces `chunks` through the BYOB request when there is one.
    struct ChunkSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkSource {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|chunk| chunk.to_vec()).collect(),
            }
        }
    }

    impl ReadableByteSource for ChunkSource {
        async fn pull(&mut self, controller: &mut ReadableByteStreamController) -> StreamResult<()> {
            let Some(chunk) = self.chunks.pop_front() else {
                return controller.close();
            };
            match controller.byob_request() {
                Some(request) => {
                    let written = request.fill(&chunk)?;
                    if written < chunk.len() {
                        self.chunks.push_front(chunk[written..].to_vec());
                    }
                }
                None => controller.enqueue(chunk)?,
            }
            Ok(())
        }
    }

    struct Idle;

    impl ReadableByteSource for Idle {
        async fn pull(&mut self, _controller: &mut ReadableByteStreamController) -> StreamResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_reader_receives_enqueued_chunks() {
        let stream =
            ReadableStream::builder_bytes(ChunkSource::new(&[b"ab", b"cd"])).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(b"ab".to_vec()));
        assert_eq!(reader.read().await.unwrap(), Some(b"cd".to_vec()));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn byob_reader_is_filled_through_the_request() {
        let stream = ReadableStream::builder_bytes(ChunkSource::new(&[b"hello world"]))
            .spawn(tokio::spawn);
        let (_locked, reader) = stream.get_byob_reader().unwrap();

        let first = reader.read(ByteView::zeroed(5)).await.unwrap();
        assert!(!first.done);
        assert_eq!(first.value.unwrap().as_bytes(), b"hello");

        let second = reader.read(ByteView::zeroed(16)).await.unwrap();
        assert_eq!(second.value.unwrap().as_bytes(), b" world");

        let last = reader.read(ByteView::zeroed(4)).await.unwrap();
        assert!(last.done);
        let view = last.value.unwrap();
        assert_eq!(view.byte_length(), 0);
        assert_eq!(view.buffer_len(), 4);
    }

    #[tokio::test]
    async fn read_with_min_waits_for_enough_elements() {
        struct Trickle {
            next: u8,
        }
        impl ReadableByteSource for Trickle {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                controller.enqueue(vec![self.next, self.next + 1])?;
                self.next += 2;
                Ok(())
            }
        }

        let stream = ReadableStream::builder_bytes(Trickle { next: 1 }).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_byob_reader().unwrap();
        let result = reader
            .read_with_min(ByteView::zeroed(6), 5)
            .await
            .unwrap();
        let view = result.value.unwrap();
        assert!(view.len() >= 5);
        assert_eq!(view.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn partial_element_is_returned_to_the_queue() {
        struct Odd {
            sent: bool,
        }
        impl ReadableByteSource for Odd {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                if self.sent {
                    return Ok(());
                }
                self.sent = true;
                let request = controller.byob_request().expect("pending read");
                request.with_view_mut(|view| view[..3].copy_from_slice(&[1, 2, 3]))?;
                request.respond(3)
            }
        }

        let stream = ReadableStream::builder_bytes(Odd { sent: false }).spawn(tokio::spawn);
        let (_locked, reader) = stream.get_byob_reader().unwrap();

        let wide = ByteView::zeroed(4).with_element_size(2).unwrap();
        let first = reader.read(wide).await.unwrap().value.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.as_bytes(), &[1, 2]);

        let rest = reader.read(ByteView::zeroed(4)).await.unwrap().value.unwrap();
        assert_eq!(rest.as_bytes(), &[3]);
    }

    #[tokio::test]
    async fn close_with_partial_element_errors_the_stream() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        let (_locked, reader) = stream.get_byob_reader().unwrap();

        let read = reader.read(ByteView::zeroed(4).with_element_size(2).unwrap());
        controller.enqueue(vec![7]).unwrap();
        let closed = controller.close();
        assert!(matches!(closed, Err(StreamError::Type(_))));
        assert!(matches!(read.await, Err(StreamError::Type(_))));
        assert_eq!(controller.desired_size(), None);
    }

    #[tokio::test]
    async fn byob_read_on_closed_stream_returns_empty_view() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        controller.close().unwrap();

        let (_locked, reader) = stream.get_byob_reader().unwrap();
        let result = reader.read(ByteView::zeroed(8)).await.unwrap();
        assert!(result.done);
        assert_eq!(result.value.unwrap().byte_length(), 0);
    }

    #[tokio::test]
    async fn close_commits_pending_byob_reads() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        let (_locked, reader) = stream.get_byob_reader().unwrap();

        let read = reader.read(ByteView::zeroed(8));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let request = controller.byob_request().unwrap();
        controller.close().unwrap();

        let result = read.await.unwrap();
        assert!(result.done);
        assert_eq!(result.value.unwrap().byte_length(), 0);
        request.respond(0).unwrap();
    }

    #[tokio::test]
    async fn source_may_respond_with_empty_view_after_close() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        let (_locked, reader) = stream.get_byob_reader().unwrap();

        let first = reader.read(ByteView::zeroed(8));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let request = controller.byob_request().unwrap();
        controller.close().unwrap();
        request.respond_with_new_view(ByteView::zeroed(0)).unwrap();
        assert!(first.await.unwrap().done);

        let second = reader.read(ByteView::zeroed(8));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.byob_request().is_none());
        assert!(second.await.unwrap().done);
    }

    #[tokio::test]
    async fn written_bytes_after_close_are_rejected() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        let (_locked, reader) = stream.get_byob_reader().unwrap();

        let read = reader.read(ByteView::zeroed(8));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let request = controller.byob_request().unwrap();
        controller.close().unwrap();
        assert!(read.await.unwrap().done);
        assert!(matches!(request.respond(3), Err(StreamError::Type(_))));
    }

    #[tokio::test]
    async fn auto_allocation_serves_default_reads_through_requests() {
        let sizes = Arc::new(AtomicUsize::new(0));
        struct Allocating {
            sizes: Arc<AtomicUsize>,
        }
        impl ReadableByteSource for Allocating {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                let request = controller.byob_request().expect("auto-allocated request");
                self.sizes.store(request.view_len()?, Ordering::SeqCst);
                request.fill(b"bytes")?;
                Ok(())
            }
        }

        let stream = ReadableStream::builder_bytes(Allocating {
            sizes: sizes.clone(),
        })
        .auto_allocate_chunk_size(64)
        .spawn(tokio::spawn);
        let (_locked, reader) = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(b"bytes".to_vec()));
        assert_eq!(sizes.load(Ordering::SeqCst), 64);
    }

    #[tokio::test]
    async fn enqueue_invalidates_the_outstanding_request() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        let (_locked, reader) = stream.get_byob_reader().unwrap();

        let read = reader.read(ByteView::zeroed(4));
        let request = controller.byob_request().unwrap();
        controller.enqueue(vec![9, 9]).unwrap();

        assert_eq!(read.await.unwrap().value.unwrap().as_bytes(), &[9, 9]);
        assert!(matches!(request.view_len(), Err(StreamError::Type(_))));
        assert!(matches!(
            controller.enqueue(Vec::new()),
            Err(StreamError::Type(_))
        ));
    }

    #[tokio::test]
    async fn respond_validates_the_written_range() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        let (_locked, reader) = stream.get_byob_reader().unwrap();
        let _read = reader.read(ByteView::zeroed(4));

        assert!(matches!(
            controller.byob_request().unwrap().respond(5),
            Err(StreamError::Range(_))
        ));
        assert!(matches!(
            controller.byob_request().unwrap().respond(0),
            Err(StreamError::Type(_))
        ));

        let request = controller.byob_request().unwrap();
        let mut view = request.take_view().unwrap();
        assert!(matches!(request.view_len(), Ok(4)));
        assert!(matches!(
            controller.enqueue(vec![1]),
            Err(StreamError::Type(_))
        ));
        let wrong = ByteView::with_range(vec![0; 8], 0, 2).unwrap();
        assert!(matches!(
            controller.byob_request().unwrap().respond_with_new_view(wrong),
            Err(StreamError::Range(_))
        ));
        view.as_bytes_mut()[0] = 5;
        let filled = ByteView::with_range(view.into_buffer(), 0, 1).unwrap();
        controller
            .byob_request()
            .unwrap()
            .respond_with_new_view(filled)
            .unwrap();
    }

    #[tokio::test]
    async fn released_reader_bytes_move_to_the_queue() {
        let (stream, controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);

        let (_locked, reader) = stream.get_byob_reader().unwrap();
        let read = reader.read(ByteView::zeroed(8));
        let request = controller.byob_request().unwrap();
        let stream = reader.release_lock();
        assert!(matches!(read.await, Err(StreamError::Released)));

        assert_eq!(request.fill(b"ab").unwrap(), 2);
        let (_locked, reader) = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(b"ab".to_vec()));
    }

    #[tokio::test]
    async fn cancel_resolves_pending_byob_reads_as_done() {
        let (stream, _controller, driver) = ReadableStream::new_byte_parts(Idle, 0, None);
        tokio::spawn(driver);
        let (_locked, reader) = stream.get_byob_reader().unwrap();
        let read = reader.read(ByteView::zeroed(4));
        reader.cancel(None).await.unwrap();
        let result = read.await.unwrap();
        assert!(result.done);
        assert!(result.value.is_none());
    }
}
