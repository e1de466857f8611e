use std::time::Duration;

use serde::Deserialize;

use crate::error::{StreamError, StreamResult};
use crate::policy::RealizationMode;

/// Streaming configuration for one entity category.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamerConfig {
    /// Entities farther than this from every observer are not candidates.
    pub streaming_distance: f32,
    /// Cap on concurrently realized instances.
    pub budget: usize,
    /// Optional cap on instances admitted on behalf of a single observer.
    pub per_observer_budget: Option<usize>,
    /// Milliseconds between two scheduler ticks.
    pub tick_interval_ms: u64,
    /// Edge length of a spatial index cell.
    pub cell_size: f32,
    pub mode: RealizationMode,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            streaming_distance: 300.0,
            budget: 1000,
            per_observer_budget: None,
            tick_interval_ms: 250,
            cell_size: 64.0,
            mode: RealizationMode::Global,
        }
    }
}

impl StreamerConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> StreamResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if !(self.streaming_distance.is_finite() && self.streaming_distance >= 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "streaming_distance must be a non-negative number, got {}",
                self.streaming_distance
            )));
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "cell_size must be positive, got {}",
                self.cell_size
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "tick_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
