// Scheduler demo binary
//
// Builds one queue and one bolt unit per `--units`, feeds every queue from `--producers`
// threads, and drains them on a single scheduler thread with the longest-waiting-first policy.
// Once producers finish, each queue receives an interrupt and the run ends when every unit has
// stopped (or on Ctrl+C). The final report is printed as JSON on stdout.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_utils::Backoff;
use fog_scheduler::{
    build_units, spawn_flusher, BackpressureCallback, BoundedSignalingQueue, CallbackFailure,
    CancellationToken, ChannelMetricsSink, DrainCallback, DurationMetric, ExecutorCallback,
    ExecutorId, Instrumentation, QueueError, QueueProbe, Runtime, RuntimeConfig, RuntimePolicy,
    SharedMonitor, WaitSignalPolicy,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Batch = Vec<u64>;

/// Sleep between publish retries once spinning on a full queue has been exhausted.
const RETRY_PARK: Duration = Duration::from_micros(50);

#[derive(Debug, Parser)]
#[command(name = "fog-scheduler", about = "Longest-waiting-first scheduler demo")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of bolt units, each with its own queue
    #[arg(short, long, default_value_t = 4)]
    units: u64,

    /// Producer threads per unit
    #[arg(short, long, default_value_t = 2)]
    producers: usize,

    /// Batches published by each producer
    #[arg(short = 'n', long, default_value_t = 10_000)]
    batches: u64,

    /// Records per batch
    #[arg(short, long, default_value_t = 8)]
    batch_size: usize,

    /// Park batches in the overflow buffer instead of blocking when a queue is full
    #[arg(long)]
    overflow: bool,
}

/// Pauses producers between the high and low water marks.
#[derive(Default)]
struct ProducerGate {
    paused: AtomicBool,
}

impl ProducerGate {
    /// Block while producers are paused.
    ///
    /// # Returns
    /// `true` once the gate is open, `false` if `cancel` fired first. Nothing reopens the gate
    /// after cancellation since the consumer that fires the low water mark is gone.
    fn wait_open(&self, cancel: &CancellationToken) -> bool {
        while self.paused.load(Ordering::Acquire) {
            if cancel.is_cancelled() {
                return false;
            }
            thread::sleep(RETRY_PARK);
        }
        true
    }
}

/// Retry a non-blocking publish while the queue is full.
///
/// # Returns
/// `Ok(Some(_))` once `attempt` succeeds, `Ok(None)` if `cancel` fired while the queue was still
/// full, or the first error other than [`QueueError::Full`].
fn retry_while_full<R>(
    cancel: &CancellationToken,
    mut attempt: impl FnMut() -> Result<R, QueueError>,
) -> Result<Option<R>, QueueError> {
    let backoff = Backoff::new();
    loop {
        match attempt() {
            Err(QueueError::Full { .. }) if cancel.is_cancelled() => return Ok(None),
            Err(QueueError::Full { .. }) => {
                if backoff.is_completed() {
                    thread::sleep(RETRY_PARK);
                } else {
                    backoff.snooze();
                }
            }
            other => return other.map(Some),
        }
    }
}

impl BackpressureCallback for ProducerGate {
    fn high_water_mark(&self) -> Result<(), CallbackFailure> {
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    fn low_water_mark(&self) -> Result<(), CallbackFailure> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }
}

struct Sinks {
    wait: Option<(Arc<DurationMetric>, ChannelMetricsSink, JoinHandle<()>)>,
    empty: Option<(Arc<DurationMetric>, ChannelMetricsSink, JoinHandle<()>)>,
}

impl Sinks {
    fn spawn(config: &RuntimeConfig) -> Result<Self> {
        let spawn = |name: &str| -> Result<_> {
            let metric = Arc::new(DurationMetric::new(name));
            let (sink, handle) = ChannelMetricsSink::spawn(metric.clone())
                .with_context(|| format!("failed to spawn {name} aggregator"))?;
            Ok((metric, sink, handle))
        };
        Ok(Self {
            wait: config
                .instrumentation
                .track_wait_time
                .then(|| spawn("wait-latency"))
                .transpose()?,
            empty: config
                .instrumentation
                .track_empty_time
                .then(|| spawn("empty-time"))
                .transpose()?,
        })
    }

    fn instrumentation(&self) -> Instrumentation {
        let mut instrumentation = Instrumentation::plain();
        if let Some((_, sink, _)) = &self.wait {
            instrumentation = instrumentation.with_wait_sink(Arc::new(sink.clone()));
        }
        if let Some((_, sink, _)) = &self.empty {
            instrumentation = instrumentation.with_empty_sink(Arc::new(sink.clone()));
        }
        instrumentation
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    info!(?config, units = cli.units, producers = cli.producers, "starting");

    let monitor = SharedMonitor::new();
    let sinks = Sinks::spawn(&config)?;
    let gate = Arc::new(ProducerGate::default());
    let records = Arc::new(AtomicU64::new(0));

    let mut queues: Vec<(ExecutorId, Arc<BoundedSignalingQueue<Batch>>)> = Vec::new();
    let mut probes: HashMap<ExecutorId, Arc<dyn QueueProbe>> = HashMap::new();
    let mut providers: Vec<Arc<dyn ExecutorCallback>> = Vec::new();
    for n in 0..cli.units {
        let executor_id = ExecutorId(n);
        let queue = Arc::new(BoundedSignalingQueue::new(
            format!("bolt-{n}"),
            &config.queue,
            monitor.clone(),
            sinks.instrumentation(),
        ));
        queue.register_backpressure_callback(gate.clone());

        let counter = records.clone();
        providers.push(Arc::new(DrainCallback::new(
            format!("bolt-{n}"),
            executor_id,
            queue.clone(),
            move |batch: Batch, _, _| {
                counter.fetch_add(batch.len() as u64, Ordering::Relaxed);
            },
        )));
        probes.insert(executor_id, queue.clone());
        queues.push((executor_id, queue));
    }

    let units = build_units(&providers, &probes, &monitor)?;
    let policy = Arc::new(WaitSignalPolicy::new(
        monitor.clone(),
        units,
        config.policy.clone(),
    ));

    let cancel = monitor.cancellation_token();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("installing Ctrl+C handler")?;
    }

    let flush_cancel = monitor.cancellation_token();
    let flusher = spawn_flusher(
        probes.values().cloned().collect(),
        config.queue.flush_interval(),
        flush_cancel.clone(),
    )?;
    let scheduler = Runtime::new(
        policy.clone(),
        cancel.clone(),
        config.scheduler_thread.clone(),
    )
    .spawn("scheduler")?;

    let mut producers = Vec::new();
    for (executor_id, queue) in &queues {
        for p in 0..cli.producers {
            let queue = queue.clone();
            let gate = gate.clone();
            let cancel = cancel.clone();
            let (batches, batch_size, overflow) = (cli.batches, cli.batch_size, cli.overflow);
            let handle = thread::Builder::new()
                .name(format!("producer-{}-{p}", executor_id.0))
                .spawn(move || {
                    for n in 0..batches {
                        if cancel.is_cancelled() || !gate.wait_open(&cancel) {
                            break;
                        }
                        let batch: Batch = (0..batch_size as u64).map(|i| n + i).collect();
                        let published = if overflow {
                            queue.publish_or_overflow(batch).map(|_| ())
                        } else {
                            retry_while_full(&cancel, || queue.publish_single(batch.clone(), false))
                                .map(|_| ())
                        };
                        if let Err(err) = published {
                            warn!(queue = queue.name(), error = %err, "publish failed");
                        }
                    }
                })
                .context("spawning producer")?;
            producers.push(handle);
        }
    }

    for producer in producers {
        producer
            .join()
            .map_err(|_| anyhow!("producer thread panicked"))?;
    }
    // Overflow must reach the ring before the interrupt so nothing lands behind it.
    while queues.iter().any(|(_, queue)| queue.overflow_count() > 0) && !cancel.is_cancelled() {
        thread::sleep(config.queue.flush_interval());
    }
    for (_, queue) in &queues {
        if cancel.is_cancelled() {
            break;
        }
        match retry_while_full(&cancel, || queue.try_publish_interrupt()) {
            Ok(_) | Err(QueueError::Callback { .. }) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let report = scheduler
        .join()
        .map_err(|_| anyhow!("scheduler thread panicked"))??;
    flush_cancel.cancel();
    flusher
        .join()
        .map_err(|_| anyhow!("flusher thread panicked"))?;

    let readiness = policy.describe();
    let stats: Vec<_> = queues.iter().map(|(_, queue)| queue.stats()).collect();

    // Queues hold the metric senders; the aggregators only exit once every queue is gone.
    drop(policy);
    drop(providers);
    drop(probes);
    drop(queues);
    let Sinks { wait, empty } = sinks;
    let mut latency = serde_json::Map::new();
    for (key, entry) in [("wait", wait), ("empty", empty)] {
        if let Some((metric, sink, handle)) = entry {
            drop(sink);
            handle
                .join()
                .map_err(|_| anyhow!("metrics aggregator panicked"))?;
            latency.insert(key.to_string(), serde_json::to_value(metric.snapshot())?);
        }
    }

    let output = json!({
        "report": report,
        "records": records.load(Ordering::Relaxed),
        "queues": stats,
        "units": readiness,
        "latency": latency,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
