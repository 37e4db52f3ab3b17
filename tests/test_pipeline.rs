use parking_lot::Mutex;
use priority_pipeline::{
    Capacity, FnSource, MapStage, PassthroughStage, PipelineBuilder, PipelineConfig, PipelineError,
    Result as PipelineResult, Stage, StageExit,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    steps: Vec<&'static str>,
}

fn frame_source(delay: Duration) -> FnSource<impl FnMut(u64) -> PipelineResult<Frame> + Send> {
    FnSource::new("preprocess", move |_key| {
        thread::sleep(delay);
        Ok(Frame {
            steps: vec!["preprocess"],
        })
    })
}

fn step(
    name: &'static str,
    delay: Duration,
) -> MapStage<impl FnMut(u64, &mut Frame) -> PipelineResult<()> + Send> {
    MapStage::new(name, move |_key, frame: &mut Frame| {
        thread::sleep(delay);
        frame.steps.push(name);
        Ok(())
    })
}

/// Sink that records every key and payload it sees
struct RecordingSink {
    seen: Arc<Mutex<Vec<(u64, Frame)>>>,
}

impl Stage<Frame> for RecordingSink {
    fn process(&mut self, key: u64, frame: &mut Frame) -> PipelineResult<()> {
        frame.steps.push("postprocess");
        self.seen.lock().push((key, frame.clone()));
        Ok(())
    }

    fn name(&self) -> &str {
        "postprocess"
    }
}

#[test]
fn test_three_stage_pipeline_end_to_end() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    let report = PipelineBuilder::from_config(PipelineConfig::default())
        .source(frame_source(Duration::from_millis(5)))
        .relay(step("inference", Duration::from_millis(1)))
        .sink(RecordingSink {
            seen: Arc::clone(&seen),
        })
        .build()
        .expect("Pipeline build failed")
        .start()
        .expect("Pipeline start failed")
        .wait()
        .expect("Pipeline failed");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.is_complete());

    let seen = seen.lock();
    let keys: Vec<u64> = seen.iter().map(|(key, _)| *key).collect();
    assert_eq!(keys, (0..10).collect::<Vec<_>>());
    for (_, frame) in seen.iter() {
        assert_eq!(frame.steps, vec!["preprocess", "inference", "postprocess"]);
    }

    assert_eq!(report.stages.len(), 3);
    assert!(report.stages.iter().all(|stage| stage.metrics.processed == 10));
    assert_eq!(report.queues[0].dequeued, 10);
    assert_eq!(report.queues[1].enqueued, 10);
}

#[test]
fn test_lockstep_queues_keep_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let report = PipelineBuilder::from_config(PipelineConfig::lockstep(25))
        .source(frame_source(Duration::ZERO))
        .relay(step("resize", Duration::ZERO))
        .relay(step("inference", Duration::from_millis(1)))
        .sink(RecordingSink {
            seen: Arc::clone(&seen),
        })
        .build()
        .unwrap()
        .start()
        .unwrap()
        .wait()
        .unwrap();

    assert!(report.is_complete());
    let keys: Vec<u64> = seen.lock().iter().map(|(key, _)| *key).collect();
    assert_eq!(keys, (0..25).collect::<Vec<_>>());
    // A fast source against one-slot queues must have hit backpressure
    assert!(report.queues.iter().any(|queue| queue.enqueue_waits > 0));
}

#[test]
fn test_stage_error_shuts_pipeline_down() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);

    let result = PipelineBuilder::new()
        .items(50)
        .queue_capacity(2usize)
        .source(frame_source(Duration::ZERO))
        .relay(MapStage::new("flaky", |key, _frame: &mut Frame| {
            if key == 3 {
                Err(PipelineError::StageError(format!("corrupt frame {key}")))
            } else {
                Ok(())
            }
        }))
        .sink(MapStage::new("count", move |_key, _frame: &mut Frame| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }))
        .build()
        .unwrap()
        .start()
        .unwrap()
        .wait();

    assert!(matches!(result, Err(PipelineError::StageError(msg)) if msg.contains("frame 3")));
    assert!(processed.load(Ordering::Relaxed) <= 3);
}

#[test]
fn test_cancel_running_pipeline() {
    let running = PipelineBuilder::new()
        .items(10_000)
        .source(frame_source(Duration::from_millis(2)))
        .relay(PassthroughStage)
        .sink(PassthroughStage)
        .build()
        .unwrap()
        .start()
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    running.cancel();
    let report = running.wait().expect("cancellation is not an error");

    assert!(!report.is_complete());
    assert_eq!(report.stages[0].exit, Some(StageExit::Cancelled));
    assert!(report.stages[0].metrics.processed < 10_000);
}

#[test]
fn test_panicking_stage_does_not_hang_neighbours() {
    let result = PipelineBuilder::new()
        .items(100)
        .queue_capacity(1usize)
        .source(frame_source(Duration::ZERO))
        .relay(PassthroughStage)
        .sink(MapStage::new("explode", |key, _frame: &mut Frame| {
            if key == 2 {
                panic!("sink blew up");
            }
            Ok(())
        }))
        .build()
        .unwrap()
        .start()
        .unwrap()
        .wait();

    assert!(matches!(result, Err(PipelineError::ThreadError(_))));
}

#[test]
fn test_single_item_is_terminal() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let report = PipelineBuilder::new()
        .items(1)
        .source(frame_source(Duration::ZERO))
        .sink(RecordingSink {
            seen: Arc::clone(&seen),
        })
        .build()
        .unwrap()
        .start()
        .unwrap()
        .wait()
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(report.stages[0].name, "preprocess");
    assert_eq!(report.stages[1].name, "postprocess");
}

#[test]
fn test_stage_hooks_run_once() {
    struct Hooked {
        starts: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Stage<Frame> for Hooked {
        fn process(&mut self, _key: u64, _frame: &mut Frame) -> PipelineResult<()> {
            Ok(())
        }

        fn on_start(&mut self) -> PipelineResult<()> {
            self.starts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn on_shutdown(&mut self) -> PipelineResult<()> {
            self.shutdowns.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    let starts = Arc::new(AtomicUsize::new(0));
    let shutdowns = Arc::new(AtomicUsize::new(0));

    let report = PipelineBuilder::new()
        .items(5)
        .source(frame_source(Duration::ZERO))
        .sink(Hooked {
            starts: Arc::clone(&starts),
            shutdowns: Arc::clone(&shutdowns),
        })
        .build()
        .unwrap()
        .start()
        .unwrap()
        .wait()
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.stages[1].name, "stage");
    assert_eq!(starts.load(Ordering::Relaxed), 1);
    assert_eq!(shutdowns.load(Ordering::Relaxed), 1);
}

#[test]
fn test_report_summary() {
    let report = PipelineBuilder::new()
        .items(3)
        .source(frame_source(Duration::ZERO))
        .relay(step("inference", Duration::ZERO))
        .sink(PassthroughStage)
        .build()
        .unwrap()
        .start()
        .unwrap()
        .wait()
        .unwrap();

    let summary = report.to_string();
    assert!(summary.starts_with("Pipeline Metrics Summary:"));
    assert!(summary.contains("Stage 1 (inference)"));
    assert!(summary.contains("Queue 1: enqueued 3, dequeued 3"));
}

#[test]
fn test_failed_relay_teardown_still_delivers_every_item() {
    struct FailingTeardown;

    impl Stage<Frame> for FailingTeardown {
        fn process(&mut self, _key: u64, _frame: &mut Frame) -> PipelineResult<()> {
            Ok(())
        }

        fn on_shutdown(&mut self) -> PipelineResult<()> {
            Err(PipelineError::StageError("relay teardown".into()))
        }
    }

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);

    let result = PipelineBuilder::new()
        .items(20)
        .queue_capacity(Capacity::Unbounded)
        .source(frame_source(Duration::ZERO))
        .relay(FailingTeardown)
        .sink(MapStage::new("slow", move |_key, _frame: &mut Frame| {
            thread::sleep(Duration::from_millis(5));
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }))
        .build()
        .unwrap()
        .start()
        .unwrap()
        .wait();

    assert!(matches!(result, Err(PipelineError::StageError(msg)) if msg == "relay teardown"));
    assert_eq!(delivered.load(Ordering::Relaxed), 20);
}

#[test]
fn test_dropping_running_pipeline_cancels_queues() {
    let running = PipelineBuilder::new()
        .items(10_000)
        .source(frame_source(Duration::from_millis(2)))
        .relay(PassthroughStage)
        .sink(PassthroughStage)
        .build()
        .unwrap()
        .start()
        .unwrap();

    let queue = running.queue(0).expect("source queue");
    thread::sleep(Duration::from_millis(20));
    drop(running);

    assert!(queue.is_cancelled());
    assert!(queue.wait_dequeue().is_none());
}
