//! Shared configuration types for conduit pipelines.

mod base;
mod fan_out;
mod pipeline;
mod stream;

pub use base::ValidationError;
pub use fan_out::FanOutConfig;
pub use pipeline::PipelineConfig;
pub use stream::StreamConfig;
