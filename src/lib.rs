//! Bounded, priority-ordered blocking queues and the staged pipeline built on them.
//!
//! The core primitive is [`PriorityQueue`]: a thread-safe queue with a fixed
//! capacity that hands entries out in key order, not arrival order. Producers
//! block while it is full, consumers block while it is empty or while the
//! front entry is not the key they wait for, and a one-shot cancel releases
//! every waiter for good.
//!
//! A [`Pipeline`] chains a source, any number of relays and a sink with one
//! queue between each pair of stages, each stage on its own thread. The source
//! numbers its items `0..n` and marks the last one terminal; every later stage
//! stops once it has handled that item. Cancellation is reserved for early
//! shutdown.
//!
//! # Features
//!
//! - Comparator-driven ordering ([`MinFirst`], [`MaxFirst`] or any closure)
//! - Backpressure through a condition wait on "not full"
//! - Targeted waits for a specific key, any number at once
//! - Per-stage metrics: throughput, latency percentiles, error count
//!
//! # Example
//!
//! ```
//! use priority_pipeline::{FnSource, MapStage, PassthroughStage, PipelineBuilder};
//!
//! let report = PipelineBuilder::new()
//!     .items(10)
//!     .queue_capacity(4usize)
//!     .source(FnSource::new("frames", |key| Ok(key * 2)))
//!     .relay(MapStage::new("double", |_key, value: &mut u64| {
//!         *value *= 2;
//!         Ok(())
//!     }))
//!     .sink(PassthroughStage)
//!     .build()?
//!     .start()?
//!     .wait()?;
//!
//! assert!(report.is_complete());
//! # Ok::<(), priority_pipeline::PipelineError>(())
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod stage;

// Re-exports for convenience
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use metrics::{MetricsSnapshot, QueueStatsSnapshot, StageMetrics};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineReport, RunningPipeline, StageReport};
pub use queue::{Capacity, Entry, KeyOrder, MaxFirst, MinFirst, PriorityQueue};
pub use stage::{
    FnSource, MapStage, PassthroughStage, Source, SourceRunner, Stage, StageExit, StageQueue,
    StageRunner, WorkItem,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
