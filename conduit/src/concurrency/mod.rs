//! Concurrency primitives shared by every pipeline component.
//!
//! Components never talk to each other directly. They exchange elements through bounded
//! edges and observe one shared cancellation token, and these two building blocks are all
//! the coordination the crate needs.
//!
//! # Cancellation
//!
//! The [`cancel`] module provides [`cancel::CancellationToken`], a one-shot broadcast signal
//! created by the pipeline owner and cloned into every worker. Cancelling it releases every
//! task that is suspended on a send or a receive, which is how shutdown and timeouts are
//! expressed.
//!
//! # Streams
//!
//! The [`stream`] module implements the edges between components:
//! - [`stream::create_stream`] builds a bounded queue with an explicit capacity
//! - [`stream::StreamTx::send`] and [`stream::StreamRx::recv`] race every suspension
//!   against the token
//! - [`stream::CancellableStream`] makes any [`futures::Stream`] end when the token fires
//!
//! Ordering is FIFO within one edge. Closing an edge is done by dropping its writers and is
//! distinct from cancellation: readers past the end observe the end of the stream, never an
//! error.

pub mod cancel;
pub mod stream;
