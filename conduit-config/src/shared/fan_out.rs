use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Default width of fan-out groups.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FanOutConfig {
    /// Number of workers started when a fan-out does not request a specific count.
    #[serde(default = "default_fan_out_workers")]
    pub workers: usize,
}

impl FanOutConfig {
    /// Default number of fan-out workers.
    pub const DEFAULT_WORKERS: usize = 4;

    /// Validates fan-out configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::FanOutWorkersZero);
        }

        Ok(())
    }
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            workers: default_fan_out_workers(),
        }
    }
}

fn default_fan_out_workers() -> usize {
    FanOutConfig::DEFAULT_WORKERS
}
