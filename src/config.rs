use crate::error::{PipelineError, Result};
use crate::queue::Capacity;
use std::num::NonZeroUsize;

/// Items a pipeline run emits when not configured otherwise
pub const DEFAULT_ITEMS: u64 = 10;

/// Per-queue capacity when not configured otherwise
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Run parameters shared by every stage of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of items the source emits; the last one is terminal
    pub items: u64,
    /// Capacity of every queue between stages
    pub queue_capacity: Capacity,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            items: DEFAULT_ITEMS,
            queue_capacity: Capacity::from(DEFAULT_QUEUE_CAPACITY),
        }
    }
}

impl PipelineConfig {
    /// Lockstep stages: each queue holds a single item
    pub const fn lockstep(items: u64) -> Self {
        Self {
            items,
            queue_capacity: Capacity::Bounded(NonZeroUsize::MIN),
        }
    }

    /// Queues never apply backpressure
    pub const fn unbounded(items: u64) -> Self {
        Self {
            items,
            queue_capacity: Capacity::Unbounded,
        }
    }

    /// Reject settings that would leave a run unable to finish
    pub fn validate(&self) -> Result<()> {
        if self.items == 0 {
            return Err(PipelineError::ConfigError(
                "items must be at least 1 so a terminal item is emitted".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.items, 10);
        assert_eq!(config.queue_capacity.limit(), Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(PipelineConfig::lockstep(3).queue_capacity.limit(), Some(1));
        assert_eq!(
            PipelineConfig::unbounded(3).queue_capacity,
            Capacity::Unbounded
        );
    }

    #[test]
    fn test_zero_items_rejected() {
        let config = PipelineConfig::unbounded(0);
        assert!(matches!(
            config.validate(),
            Err(PipelineError::ConfigError(_))
        ));
    }
}
