// End-to-end scheduling: units built from providers, producers on their own threads, and the
// scheduler loop draining everything on a single consumer thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fog_scheduler::{
    build_units, BoundedSignalingQueue, ChannelMetricsSink, DrainCallback, DurationMetric,
    ExecutorCallback, ExecutorId, Instrumentation, QueueProbe, Runtime, RuntimeConfig,
    RuntimePolicy, SchedulerError, SharedMonitor, ThreadPlacement, WaitSignalPolicy,
};
use parking_lot::Mutex;

const CONFIG: &str = r#"
[queue]
capacity = 64
producer_type = "multi"

[instrumentation]
track_wait_time = true
track_empty_time = true

[policy]
ready_stamp = "refresh"
"#;

struct Topology {
    monitor: Arc<SharedMonitor>,
    queues: Vec<Arc<BoundedSignalingQueue<u64>>>,
    policy: Arc<WaitSignalPolicy>,
    order: Arc<Mutex<Vec<(u64, u64)>>>,
}

fn topology(config: &RuntimeConfig, units: u64, instrumentation: Instrumentation) -> Topology {
    let monitor = SharedMonitor::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut queues = Vec::new();
    let mut probes: HashMap<ExecutorId, Arc<dyn QueueProbe>> = HashMap::new();
    let mut providers: Vec<Option<Arc<dyn ExecutorCallback>>> = Vec::new();

    for n in 0..units {
        let queue = Arc::new(BoundedSignalingQueue::new(
            format!("bolt-{n}"),
            &config.queue,
            monitor.clone(),
            instrumentation.clone(),
        ));
        let sink = order.clone();
        let callback: Arc<dyn ExecutorCallback> = Arc::new(DrainCallback::new(
            format!("bolt-{n}"),
            ExecutorId(n),
            queue.clone(),
            move |item: u64, _, _| sink.lock().push((n, item)),
        ));
        providers.push(Some(callback));
        providers.push(None);
        let probe: Arc<dyn QueueProbe> = queue.clone();
        probes.insert(ExecutorId(n), probe);
        queues.push(queue);
    }

    let units = build_units(&providers, &probes, &monitor).unwrap();
    let policy = Arc::new(WaitSignalPolicy::new(
        monitor.clone(),
        units,
        config.policy.clone(),
    ));
    Topology {
        monitor,
        queues,
        policy,
        order,
    }
}

#[test]
fn test_longest_waiting_unit_is_serviced_first() {
    let topo = topology(&RuntimeConfig::default(), 2, Instrumentation::plain());
    let units = topo.policy.units();
    {
        let now = Instant::now();
        let mut state = topo.monitor.lock();
        state.set_ready_at(units[0].id(), now.checked_sub(Duration::from_millis(500)));
        state.set_ready_at(units[1].id(), now.checked_sub(Duration::from_millis(100)));
    }

    let cancel = topo.monitor.cancellation_token();
    let picked = topo.policy.get_unit_and_set(&cancel).unwrap();
    assert_eq!(picked.id(), units[0].id());
}

#[test]
fn test_blocked_scheduler_wakes_on_publish_transition() {
    let topo = topology(&RuntimeConfig::default(), 3, Instrumentation::plain());
    let cancel = topo.monitor.cancellation_token();

    let waiter = {
        let policy = topo.policy.clone();
        let cancel = cancel.clone();
        thread::spawn(move || policy.get_unit_and_set(&cancel).map(|unit| unit.id()))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    topo.queues[2].publish_single(1, true).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), topo.queues[2].slot());
}

#[test]
fn test_cancelled_scheduler_returns_error() {
    let topo = topology(&RuntimeConfig::default(), 1, Instrumentation::plain());
    let cancel = topo.monitor.cancellation_token();
    cancel.cancel();
    let result = topo.policy.get_unit_and_set(&cancel);
    assert!(matches!(result, Err(SchedulerError::Cancelled)));
}

#[test]
fn test_concurrent_producers_are_drained_in_publish_order() {
    let config = RuntimeConfig::from_toml_str(CONFIG).unwrap();
    let wait = Arc::new(DurationMetric::new("wait-latency"));
    let empty = Arc::new(DurationMetric::new("empty-time"));
    let (wait_sink, wait_handle) = ChannelMetricsSink::spawn(wait.clone()).unwrap();
    let (empty_sink, empty_handle) = ChannelMetricsSink::spawn(empty.clone()).unwrap();
    let instrumentation = Instrumentation::plain()
        .with_wait_sink(Arc::new(wait_sink))
        .with_empty_sink(Arc::new(empty_sink));

    let topo = topology(&config, 4, instrumentation);
    let cancel = topo.monitor.cancellation_token();
    let scheduler = Runtime::new(topo.policy.clone(), cancel, ThreadPlacement::default())
        .spawn("scheduler-it")
        .unwrap();

    const PER_PRODUCER: u64 = 2_000;
    let published = Arc::new(AtomicU64::new(0));
    let producers: Vec<_> = topo
        .queues
        .iter()
        .flat_map(|queue| {
            (0..2u64).map(move |producer| (queue.clone(), producer))
        })
        .map(|(queue, producer)| {
            let published = published.clone();
            thread::spawn(move || {
                for n in 0..PER_PRODUCER {
                    queue.publish_single(producer * 1_000_000 + n, true).unwrap();
                    published.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    for queue in &topo.queues {
        queue.publish_interrupt().unwrap();
    }

    let report = scheduler.join().unwrap().unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.retired.len(), 4);
    assert_eq!(published.load(Ordering::Relaxed), 4 * 2 * PER_PRODUCER);

    let order = topo.order.lock();
    assert_eq!(order.len() as u64, 4 * 2 * PER_PRODUCER);
    for unit in 0..4u64 {
        for producer in 0..2u64 {
            let items: Vec<u64> = order
                .iter()
                .filter(|(from, item)| *from == unit && item / 1_000_000 == producer)
                .map(|(_, item)| item % 1_000_000)
                .collect();
            assert_eq!(items, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
    }
    for queue in &topo.queues {
        let stats = queue.stats();
        assert_eq!(stats.arrivals, 2 * PER_PRODUCER + 1);
        assert_eq!(stats.consumed, 2 * PER_PRODUCER);
        assert_eq!(stats.corrupt_slots, 0);
    }
    drop(order);

    let readiness = topo.policy.describe();
    assert!(readiness.iter().all(|unit| unit.retired && unit.pending == 0));

    drop(topo);
    wait_handle.join().unwrap();
    empty_handle.join().unwrap();
    assert!(wait.count("default") > 0);
}
