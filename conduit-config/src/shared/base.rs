use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Stream capacity cannot be zero.
    #[error("`stream.capacity` cannot be zero")]
    StreamCapacityZero,
    /// Fan-out worker count cannot be zero.
    #[error("`fan_out.workers` cannot be zero")]
    FanOutWorkersZero,
}
