//! Owned views over byte buffers used by BYOB reads.
//!
//! A [`ByteView`] owns its backing buffer and describes a window into it,
//! together with the element size of the typed view it stands for. Passing a
//! view into a read moves the buffer, so the caller cannot keep an alias to
//! memory the stream is filling.

use super::error::{StreamError, StreamResult};

#[derive(Clone, PartialEq, Eq)]
pub struct ByteView {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
    element_size: usize,
}

impl ByteView {
    /// A view over the whole buffer with one-byte elements.
    pub fn new(buffer: Vec<u8>) -> Self {
        let byte_length = buffer.len();
        Self {
            buffer,
            byte_offset: 0,
            byte_length,
            element_size: 1,
        }
    }

    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// A view over `buffer[byte_offset..byte_offset + byte_length]`.
    pub fn with_range(buffer: Vec<u8>, byte_offset: usize, byte_length: usize) -> StreamResult<Self> {
        let end = byte_offset
            .checked_add(byte_length)
            .ok_or_else(|| StreamError::range_error("view range overflows"))?;
        if end > buffer.len() {
            return Err(StreamError::range_error(format!(
                "view range {}..{} is outside a buffer of {} bytes",
                byte_offset,
                end,
                buffer.len()
            )));
        }
        Ok(Self {
            buffer,
            byte_offset,
            byte_length,
            element_size: 1,
        })
    }

    /// Reinterprets the view as elements of `element_size` bytes (1, 2, 4 or
    /// 8). Offset and length must be multiples of the element size.
    pub fn with_element_size(mut self, element_size: usize) -> StreamResult<Self> {
        if !matches!(element_size, 1 | 2 | 4 | 8) {
            return Err(StreamError::range_error(format!(
                "unsupported element size {}",
                element_size
            )));
        }
        if self.byte_offset % element_size != 0 || self.byte_length % element_size != 0 {
            return Err(StreamError::range_error(
                "view offset and length must be multiples of the element size",
            ));
        }
        self.element_size = element_size;
        Ok(self)
    }

    pub(crate) fn from_parts(
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
        element_size: usize,
    ) -> Self {
        Self {
            buffer,
            byte_offset,
            byte_length,
            element_size,
        }
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of whole elements in the view.
    pub fn len(&self) -> usize {
        self.byte_length / self.element_size
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    /// Length of the whole backing buffer.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    /// The backing buffer, including bytes outside the view.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// The viewed bytes only.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut buffer = self.buffer;
        if self.byte_offset == 0 {
            buffer.truncate(self.byte_length);
            buffer
        } else {
            buffer[self.byte_offset..self.byte_offset + self.byte_length].to_vec()
        }
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteView")
            .field("byte_offset", &self.byte_offset)
            .field("byte_length", &self.byte_length)
            .field("element_size", &self.element_size)
            .field("bytes", &self.as_bytes())
            .finish()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(buffer: Vec<u8>) -> Self {
        Self::new(buffer)
    }
}

impl From<&[u8]> for ByteView {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

/// Result of a BYOB read. `value` hands the buffer back; it is `None` only
/// when the stream was canceled while the read was pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByobReadResult {
    pub value: Option<ByteView>,
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_views_expose_only_their_window() {
        let view = ByteView::with_range(vec![1, 2, 3, 4, 5], 1, 3).unwrap();
        assert_eq!(view.as_bytes(), &[2, 3, 4]);
        assert_eq!(view.buffer_len(), 5);
        assert_eq!(view.clone().into_bytes(), vec![2, 3, 4]);
        assert_eq!(view.into_buffer(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_out_of_bounds_ranges() {
        assert!(matches!(
            ByteView::with_range(vec![0; 4], 2, 3),
            Err(StreamError::Range(_))
        ));
        assert!(matches!(
            ByteView::with_range(vec![0; 4], usize::MAX, 2),
            Err(StreamError::Range(_))
        ));
    }

    #[test]
    fn element_size_must_divide_the_window() {
        let view = ByteView::zeroed(8).with_element_size(4).unwrap();
        assert_eq!(view.len(), 2);
        assert!(ByteView::zeroed(6).with_element_size(4).is_err());
        assert!(ByteView::zeroed(6).with_element_size(3).is_err());
        let shifted = ByteView::with_range(vec![0; 8], 2, 4).unwrap();
        assert!(shifted.with_element_size(4).is_err());
    }
}
