pub mod abort;
pub mod byte_view;
pub mod error;
pub mod promise;
pub mod queue;
pub mod readable;
pub mod transform;
pub mod writable;

// Re-export main types
pub use abort::*;
pub use byte_view::*;
pub use error::*;
pub use promise::{Deferred, DeferredFuture, WakerSet};
pub use readable::*;
pub use transform::*;
pub use writable::*;

/// Type-level marker for unlocked streams
#[derive(Debug, Clone, Copy)]
pub struct Unlocked;
/// Type-level marker for locked streams
#[derive(Debug, Clone, Copy)]
pub struct Locked;

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk. A non-finite or negative size errors the
    /// stream the chunk was enqueued into.
    fn size(&self, chunk: &T) -> f64;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> usize;
}

/// Count-based strategy
#[derive(Debug, Clone)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> f64 {
        1.0
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Debug, Clone)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<ByteView> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &ByteView) -> f64 {
        chunk.byte_length() as f64
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Strategy built from a closure, for chunk types without a natural size.
pub struct SizeFnQueuingStrategy<F> {
    size: F,
    high_water_mark: usize,
}

impl<F> SizeFnQueuingStrategy<F> {
    pub fn new(high_water_mark: usize, size: F) -> Self {
        Self {
            size,
            high_water_mark,
        }
    }
}

impl<T, F> QueuingStrategy<T> for SizeFnQueuingStrategy<F>
where
    F: Fn(&T) -> f64,
{
    fn size(&self, chunk: &T) -> f64 {
        (self.size)(chunk)
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
