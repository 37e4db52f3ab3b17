//! Three-stage demo: preprocess → inference → postprocess over priority queues.

use clap::Parser;
use priority_pipeline::{
    Capacity, FnSource, MapStage, PipelineBuilder, PipelineConfig, Result as PipelineResult,
};
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "priority-pipeline", about = "Run a frame pipeline to completion")]
struct Cli {
    /// Number of frames to push through the pipeline
    #[arg(long, default_value_t = 10)]
    items: u64,
    /// Capacity of each queue between stages (0 = unbounded)
    #[arg(long, default_value_t = 100, allow_negative_numbers = true)]
    capacity: i64,
    /// Simulated preprocessing time per frame
    #[arg(long, default_value_t = 20)]
    preprocess_ms: u64,
    /// Simulated inference time per frame
    #[arg(long, default_value_t = 1)]
    infer_ms: u64,
    /// Simulated postprocessing time per frame
    #[arg(long, default_value_t = 10)]
    postprocess_ms: u64,
}

/// What the demo stages pass along
#[derive(Debug)]
struct Frame {
    last_step: &'static str,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Stage body that records its step name and sleeps to simulate work
fn simulated(
    step: &'static str,
    delay: Duration,
) -> impl FnMut(u64, &mut Frame) -> PipelineResult<()> + Send + 'static {
    move |key, frame: &mut Frame| {
        thread::sleep(delay);
        info!(key, step, previous = frame.last_step, "frame done");
        frame.last_step = step;
        Ok(())
    }
}

fn main() -> PipelineResult<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = PipelineConfig {
        items: cli.items,
        queue_capacity: Capacity::try_from(cli.capacity)?,
    };
    let preprocess = Duration::from_millis(cli.preprocess_ms);

    let report = PipelineBuilder::from_config(config)
        .source(FnSource::new("preprocess", move |key| {
            thread::sleep(preprocess);
            info!(key, step = "preprocess", "frame done");
            Ok(Frame {
                last_step: "preprocess",
            })
        }))
        .relay(MapStage::new(
            "inference",
            simulated("inference", Duration::from_millis(cli.infer_ms)),
        ))
        .sink(MapStage::new(
            "postprocess",
            simulated("postprocess", Duration::from_millis(cli.postprocess_ms)),
        ))
        .build()?
        .start()?
        .wait()?;

    info!("{report}");
    Ok(())
}
