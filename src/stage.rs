use crate::error::Result;
use crate::metrics::StageMetrics;
use crate::queue::{Entry, PriorityQueue};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Payload travelling between stages, with the end-of-stream marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<P> {
    pub payload: P,
    /// Set on the last item a source emits; each stage stops after handling it
    pub is_terminal: bool,
}

impl<P> WorkItem<P> {
    pub fn new(payload: P, is_terminal: bool) -> Self {
        Self {
            payload,
            is_terminal,
        }
    }
}

/// Queue connecting two adjacent stages, smallest key first
pub type StageQueue<P> = PriorityQueue<u64, WorkItem<P>>;

/// How a stage loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// The terminal item was handled (or, for a source, emitted)
    Completed,
    /// An adjacent queue was cancelled first
    Cancelled,
}

/// First stage of a pipeline: creates one payload per key
pub trait Source<P>: Send + 'static {
    /// Produce the payload for `key`
    fn produce(&mut self, key: u64) -> Result<P>;

    /// Called before the first item is produced
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once the source loop has ended
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "source"
    }
}

/// A relay or sink stage: works on each payload in key order
pub trait Stage<P>: Send + 'static {
    /// Work on the payload of the item with `key`, in place
    fn process(&mut self, key: u64, payload: &mut P) -> Result<()>;

    /// Called before the first item is pulled
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once the stage loop has ended
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "stage"
    }
}

/// Drives a [`Source`]: emits keys `0..items` downstream, marking the last one terminal.
///
/// Keys are assigned by this runner alone, so the terminal item is also the
/// last one in priority order as long as nothing else feeds `output`.
pub struct SourceRunner<P> {
    output: StageQueue<P>,
    items: u64,
    metrics: StageMetrics,
}

impl<P: Send + 'static> SourceRunner<P> {
    pub fn new(output: StageQueue<P>, items: u64) -> Self {
        Self {
            output,
            items,
            metrics: StageMetrics::new(),
        }
    }

    /// Use an existing metrics handle instead of a fresh one
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Run the source to completion, or until `output` is cancelled.
    ///
    /// A failing `produce` cancels `output` and returns the error. A failing
    /// `on_shutdown` is reported only if the loop itself succeeded, and never
    /// cancels anything: the items already emitted stay deliverable.
    pub fn run(&self, source: &mut dyn Source<P>) -> Result<StageExit> {
        let name = source.name().to_owned();
        if let Err(e) = source.on_start() {
            self.output.cancel();
            return Err(e);
        }
        info!(stage = %name, items = self.items, "source started");

        let exit = self.produce_all(source, &name);
        if exit.is_err() {
            self.output.cancel();
        }
        // A loop error outranks a hook error
        let shutdown = source.on_shutdown();
        if let Err(e) = &shutdown {
            warn!(stage = %name, error = %e, "shutdown hook failed");
        }
        let exit = exit?;
        shutdown?;

        info!(
            stage = %name,
            ?exit,
            produced = self.metrics.total_processed(),
            "source finished"
        );
        Ok(exit)
    }

    fn produce_all(&self, source: &mut dyn Source<P>, name: &str) -> Result<StageExit> {
        for key in 0..self.items {
            if self.output.is_cancelled() {
                warn!(stage = %name, key, "downstream cancelled, stopping source");
                return Ok(StageExit::Cancelled);
            }

            let start = Instant::now();
            let payload = source.produce(key).map_err(|e| {
                self.metrics.record_error();
                warn!(stage = %name, key, error = %e, "source failed");
                e
            })?;
            self.metrics.record_processed(start.elapsed());

            let item = WorkItem::new(payload, key + 1 == self.items);
            if self.output.enqueue(Entry::new(key, item)).is_err() {
                warn!(stage = %name, key, "downstream cancelled while full");
                return Ok(StageExit::Cancelled);
            }
            debug!(stage = %name, key, "item produced");
        }
        Ok(StageExit::Completed)
    }
}

/// Drives a [`Stage`] as a relay (with an output queue) or a sink (without).
///
/// Pulls items in key order until the terminal item has been handled and,
/// for a relay, forwarded with its key unchanged.
pub struct StageRunner<P> {
    input: StageQueue<P>,
    output: Option<StageQueue<P>>,
    metrics: StageMetrics,
}

impl<P: Send + 'static> StageRunner<P> {
    /// Runner that forwards every item from `input` to `output`
    pub fn relay(input: StageQueue<P>, output: StageQueue<P>) -> Self {
        Self {
            input,
            output: Some(output),
            metrics: StageMetrics::new(),
        }
    }

    /// Runner that consumes items from `input`
    pub fn sink(input: StageQueue<P>) -> Self {
        Self {
            input,
            output: None,
            metrics: StageMetrics::new(),
        }
    }

    /// Use an existing metrics handle instead of a fresh one
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Run the stage until the terminal item is handled or a queue is cancelled.
    ///
    /// A failing `process` cancels both queues and returns the error. A failing
    /// `on_shutdown` after the terminal item is reported but cancels nothing.
    pub fn run(&self, stage: &mut dyn Stage<P>) -> Result<StageExit> {
        let name = stage.name().to_owned();
        if let Err(e) = stage.on_start() {
            self.cancel_all();
            return Err(e);
        }
        info!(stage = %name, "stage started");

        let exit = self.consume(stage, &name);
        if !matches!(exit, Ok(StageExit::Completed)) {
            self.cancel_all();
        }
        let shutdown = stage.on_shutdown();
        if let Err(e) = &shutdown {
            warn!(stage = %name, error = %e, "shutdown hook failed");
        }
        let exit = exit?;
        shutdown?;

        info!(
            stage = %name,
            ?exit,
            processed = self.metrics.total_processed(),
            "stage finished"
        );
        Ok(exit)
    }

    fn consume(&self, stage: &mut dyn Stage<P>, name: &str) -> Result<StageExit> {
        loop {
            let Some(Entry { key, mut item }) = self.input.wait_dequeue() else {
                warn!(stage = %name, "upstream cancelled");
                return Ok(StageExit::Cancelled);
            };

            let start = Instant::now();
            stage.process(key, &mut item.payload).map_err(|e| {
                self.metrics.record_error();
                warn!(stage = %name, key, error = %e, "stage failed");
                e
            })?;
            self.metrics.record_processed(start.elapsed());
            debug!(stage = %name, key, terminal = item.is_terminal, "item processed");

            let is_terminal = item.is_terminal;
            if let Some(output) = &self.output {
                if output.is_cancelled() || output.enqueue(Entry::new(key, item)).is_err() {
                    warn!(stage = %name, key, "downstream cancelled");
                    return Ok(StageExit::Cancelled);
                }
            }
            if is_terminal {
                return Ok(StageExit::Completed);
            }
        }
    }

    fn cancel_all(&self) {
        self.input.cancel();
        if let Some(output) = &self.output {
            output.cancel();
        }
    }
}

/// Source built from a closure over the key
pub struct FnSource<F> {
    name: String,
    produce: F,
}

impl<F> FnSource<F> {
    pub fn new<P>(name: impl Into<String>, produce: F) -> Self
    where
        F: FnMut(u64) -> Result<P> + Send + 'static,
    {
        Self {
            name: name.into(),
            produce,
        }
    }
}

impl<P, F> Source<P> for FnSource<F>
where
    F: FnMut(u64) -> Result<P> + Send + 'static,
{
    fn produce(&mut self, key: u64) -> Result<P> {
        (self.produce)(key)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Forwards payloads untouched
#[derive(Debug)]
pub struct PassthroughStage;

impl<P> Stage<P> for PassthroughStage {
    fn process(&mut self, _key: u64, _payload: &mut P) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Stage built from a closure that works on each payload in place
pub struct MapStage<F> {
    name: String,
    mapper: F,
}

impl<F> MapStage<F> {
    pub fn new<P>(name: impl Into<String>, mapper: F) -> Self
    where
        F: FnMut(u64, &mut P) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<P, F> Stage<P> for MapStage<F>
where
    F: FnMut(u64, &mut P) -> Result<()> + Send + 'static,
{
    fn process(&mut self, key: u64, payload: &mut P) -> Result<()> {
        (self.mapper)(key, payload)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
