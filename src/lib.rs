//! Readable, writable and transform streams with backpressure.
//!
//! Streams are handles onto shared state; the user-supplied source, sink or
//! transformer lives in a driver future that the caller spawns on any
//! executor (`builder(..).spawn(tokio::spawn)` or `prepare()`).

pub mod platform;
pub mod streams;

pub use streams::*;
