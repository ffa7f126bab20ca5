//! Runs a deduplication pass on the tokio blocking pool and hands its output to an async consumer
//! while it is being produced.
//!
//! The producer writes into a bounded channel. When the consumer falls behind the producer
//! blocks, when the producer falls behind the consumer waits. A pass that fails ends the stream
//! with an error carrying a [`crate::StreamError`]. A pass that succeeds ends it with a plain end
//! of file.

mod pipe;
mod stream;

pub use stream::{spawn_dedup, spawn_dedup_read, DedupOpener, LayerStream};
