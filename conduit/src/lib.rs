//! Cancellable concurrent pipelines built from generators, stages, fan-out, fan-in and tee.

pub mod concurrency;
pub mod error;
pub mod ingress;
mod macros;
pub mod pipeline;
pub mod workers;
