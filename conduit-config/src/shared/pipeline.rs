use serde::{Deserialize, Serialize};

use crate::shared::{FanOutConfig, StreamConfig, ValidationError};

/// Configuration for a conduit pipeline.
///
/// Holds the defaults the pipeline owner applies to the components it starts.
/// Every component can still override them individually.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Default queue settings for pipeline edges.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Default fan-out settings.
    #[serde(default)]
    pub fan_out: FanOutConfig,
}

impl PipelineConfig {
    /// Validates pipeline configuration settings.
    ///
    /// Ensures edge capacity and fan-out width are non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.stream.validate()?;
        self.fan_out.validate()?;

        Ok(())
    }
}
