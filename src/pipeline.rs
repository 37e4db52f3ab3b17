use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::{MetricsSnapshot, QueueStatsSnapshot, StageMetrics};
use crate::queue::Capacity;
use crate::stage::{Source, SourceRunner, Stage, StageExit, StageQueue, StageRunner};
use std::fmt;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Builder for a source → relays → sink pipeline
pub struct PipelineBuilder<P> {
    config: PipelineConfig,
    source: Option<Box<dyn Source<P>>>,
    relays: Vec<Box<dyn Stage<P>>>,
    sink: Option<Box<dyn Stage<P>>>,
}

impl<P: Send + 'static> PipelineBuilder<P> {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self::from_config(PipelineConfig::default())
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            source: None,
            relays: Vec::new(),
            sink: None,
        }
    }

    /// Number of items the source emits
    pub fn items(mut self, items: u64) -> Self {
        self.config.items = items;
        self
    }

    /// Capacity of every queue between stages
    pub fn queue_capacity(mut self, capacity: impl Into<Capacity>) -> Self {
        self.config.queue_capacity = capacity.into();
        self
    }

    /// Set the first stage
    pub fn source(mut self, source: impl Source<P>) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Append a middle stage; relays run in the order they are added
    pub fn relay(mut self, stage: impl Stage<P>) -> Self {
        self.relays.push(Box::new(stage));
        self
    }

    /// Set the last stage
    pub fn sink(mut self, stage: impl Stage<P>) -> Self {
        self.sink = Some(Box::new(stage));
        self
    }

    /// Build the pipeline, creating one queue between each pair of adjacent stages
    pub fn build(self) -> Result<Pipeline<P>> {
        self.config.validate()?;
        let source = self.source.ok_or(PipelineError::MissingSource)?;
        let sink = self.sink.ok_or(PipelineError::MissingSink)?;

        let stage_count = self.relays.len() + 2;
        let queues = (0..stage_count - 1)
            .map(|_| StageQueue::new(self.config.queue_capacity))
            .collect();
        let metrics = (0..stage_count).map(|_| StageMetrics::new()).collect();

        Ok(Pipeline {
            config: self.config,
            source,
            relays: self.relays,
            sink,
            queues,
            metrics,
        })
    }
}

impl<P: Send + 'static> Default for PipelineBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired pipeline that has not started yet.
///
/// Stage `i` writes to queue `i` and stage `i + 1` reads from it, so every
/// queue has exactly one producer.
pub struct Pipeline<P> {
    config: PipelineConfig,
    source: Box<dyn Source<P>>,
    relays: Vec<Box<dyn Stage<P>>>,
    sink: Box<dyn Stage<P>>,
    queues: Vec<StageQueue<P>>,
    metrics: Vec<StageMetrics>,
}

impl<P: Send + 'static> Pipeline<P> {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of stages, source and sink included
    pub fn stage_count(&self) -> usize {
        self.metrics.len()
    }

    /// Queue between stage `index` and stage `index + 1`
    pub fn queue(&self, index: usize) -> Option<StageQueue<P>> {
        self.queues.get(index).cloned()
    }

    pub fn stage_metrics(&self, index: usize) -> Option<&StageMetrics> {
        self.metrics.get(index)
    }

    /// Spawn one thread per stage
    pub fn start(self) -> Result<RunningPipeline<P>> {
        let Pipeline {
            config,
            mut source,
            relays,
            mut sink,
            queues,
            metrics,
        } = self;

        info!(
            stages = metrics.len(),
            items = config.items,
            capacity = %config.queue_capacity,
            "starting pipeline"
        );

        let mut running = RunningPipeline {
            handles: Vec::with_capacity(metrics.len()),
            queues,
            metrics,
        };

        let last = running.metrics.len() - 1;
        let runner = SourceRunner::new(running.queues[0].clone(), config.items)
            .with_metrics(running.metrics[0].clone());
        let name = source.name().to_owned();
        running.spawn(0, name, move || runner.run(source.as_mut()))?;

        for (offset, mut relay) in relays.into_iter().enumerate() {
            let index = offset + 1;
            let runner = StageRunner::relay(
                running.queues[index - 1].clone(),
                running.queues[index].clone(),
            )
            .with_metrics(running.metrics[index].clone());
            let name = relay.name().to_owned();
            running.spawn(index, name, move || runner.run(relay.as_mut()))?;
        }

        let runner = StageRunner::sink(running.queues[last - 1].clone())
            .with_metrics(running.metrics[last].clone());
        let name = sink.name().to_owned();
        running.spawn(last, name, move || runner.run(sink.as_mut()))?;

        Ok(running)
    }
}

/// Handle to a pipeline whose stages are running
pub struct RunningPipeline<P> {
    handles: Vec<(String, JoinHandle<Result<StageExit>>)>,
    queues: Vec<StageQueue<P>>,
    metrics: Vec<StageMetrics>,
}

impl<P: Send + 'static> RunningPipeline<P> {
    fn spawn<F>(&mut self, index: usize, name: String, run: F) -> Result<()>
    where
        F: FnOnce() -> Result<StageExit> + Send + 'static,
    {
        let queues = self.queues.clone();
        let spawned = thread::Builder::new()
            .name(format!("stage-{index}-{name}"))
            .spawn(move || {
                let mut guard = ShutdownGuard {
                    queues,
                    returned: false,
                };
                // The runner cancels its own queues on a failed loop; the
                // cancellation spreads stage by stage from there.
                let result = run();
                guard.returned = true;
                result
            });

        match spawned {
            Ok(handle) => {
                self.handles.push((name, handle));
                Ok(())
            }
            Err(e) => {
                self.cancel();
                Err(PipelineError::ThreadError(format!(
                    "failed to spawn stage {name}: {e}"
                )))
            }
        }
    }

    /// Queue between stage `index` and stage `index + 1`
    pub fn queue(&self, index: usize) -> Option<StageQueue<P>> {
        self.queues.get(index).cloned()
    }

    pub fn stage_metrics(&self, index: usize) -> Option<&StageMetrics> {
        self.metrics.get(index)
    }

    /// Shut the pipeline down early: cancel every queue
    pub fn cancel(&self) {
        warn!("cancelling pipeline");
        self.queues.iter().for_each(StageQueue::cancel);
    }

    /// Wait for every stage to finish.
    ///
    /// Joins all stages even if one fails; the first stage error is returned.
    pub fn wait(mut self) -> Result<PipelineReport> {
        let mut stages = Vec::with_capacity(self.handles.len());
        let mut first_error = None;

        for ((name, handle), metrics) in self.handles.drain(..).zip(&self.metrics) {
            let exit = match handle.join() {
                Ok(Ok(exit)) => Some(exit),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                    None
                }
                Err(_) => {
                    first_error.get_or_insert(PipelineError::ThreadError(format!(
                        "stage {name} panicked"
                    )));
                    None
                }
            };
            stages.push(StageReport {
                name,
                exit,
                metrics: metrics.snapshot(),
            });
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let report = PipelineReport {
            stages,
            queues: self.queues.iter().map(StageQueue::stats).collect(),
        };
        info!(completed = report.is_complete(), "pipeline finished");
        Ok(report)
    }
}

impl<P> Drop for RunningPipeline<P> {
    fn drop(&mut self) {
        // Dropped without `wait`: detach the stages but make sure they exit.
        if !self.handles.is_empty() {
            self.queues.iter().for_each(|queue| queue.cancel());
        }
    }
}

/// Cancels every queue when a stage thread unwinds instead of returning
struct ShutdownGuard<P> {
    queues: Vec<StageQueue<P>>,
    returned: bool,
}

impl<P> Drop for ShutdownGuard<P> {
    fn drop(&mut self) {
        if !self.returned {
            self.queues.iter().for_each(|queue| queue.cancel());
        }
    }
}

/// Outcome of one stage
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    /// `None` if the stage failed
    pub exit: Option<StageExit>,
    pub metrics: MetricsSnapshot,
}

/// Outcome of a whole pipeline run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// In pipeline order, source first
    pub stages: Vec<StageReport>,
    /// Counters of the queue after each stage
    pub queues: Vec<QueueStatsSnapshot>,
}

impl PipelineReport {
    /// Every stage saw the terminal item
    pub fn is_complete(&self) -> bool {
        self.stages
            .iter()
            .all(|stage| stage.exit == Some(StageExit::Completed))
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline Metrics Summary:")?;
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "  Stage {i} ({}): {}", stage.name, stage.metrics)?;
        }
        for (i, queue) in self.queues.iter().enumerate() {
            writeln!(
                f,
                "  Queue {i}: enqueued {}, dequeued {}, blocked enqueues {}",
                queue.enqueued, queue.dequeued, queue.enqueue_waits
            )?;
        }
        Ok(())
    }
}
