use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Queue configuration applied to every pipeline edge that does not set its own capacity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Number of elements an edge buffers before its producer suspends.
    #[serde(default = "default_stream_capacity")]
    pub capacity: usize,
}

impl StreamConfig {
    /// Default edge capacity.
    ///
    /// One slot is the closest a tokio queue gets to an unbuffered hand-off.
    pub const DEFAULT_CAPACITY: usize = 1;

    /// Validates stream configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.capacity == 0 {
            return Err(ValidationError::StreamCapacityZero);
        }

        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: default_stream_capacity(),
        }
    }
}

fn default_stream_capacity() -> usize {
    StreamConfig::DEFAULT_CAPACITY
}
