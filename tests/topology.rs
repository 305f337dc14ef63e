use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runnel::{
    Block, BlockBuilder, BlockHandle, Dtype, Error, Ports, Result, Scalar, Topology,
};

mod util;

use util::{collector, feeder, gateway, init, settle};

const INT32: Dtype = Dtype::new(Scalar::I32);

/***********************************************************************
 * fixtures
 **********************************************************************/

#[derive(Default)]
struct LifecycleCounts {
    activated: AtomicUsize,
    deactivated: AtomicUsize,
}

struct RecordingSink {
    counts: Arc<LifecycleCounts>,
}

impl Block for RecordingSink {
    fn activate(&mut self, _io: &mut Ports) -> Result<()> {
        self.counts.activated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&mut self, _io: &mut Ports) -> Result<()> {
        self.counts.deactivated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn work(&mut self, io: &mut Ports) -> Result<()> {
        let input = io.input(0);
        let elements = input.elements();
        input.consume(elements);
        Ok(())
    }
}

fn recording_sink() -> (BlockHandle, Arc<LifecycleCounts>) {
    let counts = Arc::new(LifecycleCounts::default());
    let handle = BlockBuilder::new("recording_sink")
        .input(0, INT32)
        .build(RecordingSink {
            counts: Arc::clone(&counts),
        });
    (handle, counts)
}

struct ActivateThrower;

impl Block for ActivateThrower {
    fn activate(&mut self, _io: &mut Ports) -> Result<()> {
        Err(Error::InvalidArgument("activation refused".into()))
    }

    fn work(&mut self, _io: &mut Ports) -> Result<()> {
        panic!("this work should never be called");
    }
}

fn activate_thrower() -> BlockHandle {
    BlockBuilder::new("activate_thrower")
        .input(0, INT32)
        .build(ActivateThrower)
}

/// Never consumes, always asks to run again.
struct Yielder;

impl Block for Yielder {
    fn work(&mut self, io: &mut Ports) -> Result<()> {
        io.yield_();
        Ok(())
    }
}

fn yielder() -> BlockHandle {
    BlockBuilder::new("yielder").input(0, INT32).build(Yielder)
}

/***********************************************************************
 * tests
 **********************************************************************/

#[test]
fn activate_throw_fails_commit_and_unwinds() {
    init();
    let (feeder, _feed) = feeder(INT32);
    let (sink, counts) = recording_sink();
    let thrower = activate_thrower();

    let topology = Topology::new();
    topology.connect(&feeder, 0, &sink, 0).unwrap();
    topology.connect(&feeder, 0, &thrower, 0).unwrap();

    match topology.commit() {
        Err(Error::TopologyConnect(failures)) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].contains("activate_thrower"));
        }
        other => panic!("expected a topology connect error, got {:?}", other.err()),
    }

    // the sink activated before the thrower (consumers first, in creation
    // order) and was unwound in reverse before commit returned
    assert_eq!(counts.activated.load(Ordering::SeqCst), 1);
    assert_eq!(counts.deactivated.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_port_is_a_connect_error() {
    init();
    let (feeder, _feed) = feeder(INT32);
    let (sink, _probe) = collector(INT32);

    let topology = Topology::new();
    topology.connect(&feeder, 5, &sink, 0).unwrap();
    assert!(matches!(
        topology.commit(),
        Err(Error::TopologyConnect(_))
    ));
}

#[test]
fn element_size_mismatch_is_a_connect_error() {
    init();
    let (feeder, _feed) = feeder(INT32);
    let (sink, _probe) = collector(Dtype::new(Scalar::U8));

    let topology = Topology::new();
    topology.connect(&feeder, 0, &sink, 0).unwrap();
    assert!(matches!(
        topology.commit(),
        Err(Error::TopologyConnect(_))
    ));
}

#[test]
fn incompatible_domains_fail_commit() {
    init();
    struct Sink;
    impl Block for Sink {
        fn work(&mut self, io: &mut Ports) -> Result<()> {
            let input = io.input(0);
            let elements = input.elements();
            input.consume(elements);
            Ok(())
        }
    }
    let pinned = BlockBuilder::new("pinned_sink")
        .input_with_domain(0, INT32, "dma_domain")
        .build(Sink);
    let gate = gateway(INT32, "FORWARD");

    let topology = Topology::new();
    topology.connect(&gate, 0, &pinned, 0).unwrap();
    assert!(matches!(topology.commit(), Err(Error::Domain(_))));
}

#[test]
fn nested_topology_flattens_through_virtual_ports() {
    init();
    let (feeder, feed) = feeder(INT32);
    let gate = gateway(INT32, "FORWARD");
    let (sink, probe) = collector(INT32);

    let sub = Topology::named("forwarder");
    sub.connect(&sub, "in", &gate, 0).unwrap();
    sub.connect(&gate, 0, &sub, "out").unwrap();

    feed.feed_elements::<i32>(INT32, &[4, 5, 6]);

    let top = Topology::new();
    top.connect(&feeder, 0, &sub, "in").unwrap();
    top.connect(&sub, "out", &sink, 0).unwrap();
    top.commit().unwrap();
    settle(&top);

    assert_eq!(probe.typed::<i32>(), vec![4, 5, 6]);
}

#[test]
fn doubly_nested_topologies_flatten() {
    init();
    let (feeder, feed) = feeder(INT32);
    let gate_inner = gateway(INT32, "FORWARD");
    let (sink, probe) = collector(INT32);

    let inner = Topology::named("inner");
    inner.connect(&inner, "in", &gate_inner, 0).unwrap();
    inner.connect(&gate_inner, 0, &inner, "out").unwrap();

    let middle = Topology::named("middle");
    middle.connect(&middle, "in", &inner, "in").unwrap();
    middle.connect(&inner, "out", &middle, "out").unwrap();

    feed.feed_elements::<i32>(INT32, &[7, 8]);

    let top = Topology::new();
    top.connect(&feeder, 0, &middle, "in").unwrap();
    top.connect(&middle, "out", &sink, 0).unwrap();
    top.commit().unwrap();
    settle(&top);

    assert_eq!(probe.typed::<i32>(), vec![7, 8]);
}

#[test]
fn wait_inactive_times_out_while_work_continues() {
    init();
    let (feeder, feed) = feeder(INT32);
    let spinner = yielder();

    feed.feed_elements::<i32>(INT32, &[1]);

    let topology = Topology::new();
    topology.connect(&feeder, 0, &spinner, 0).unwrap();
    topology.commit().unwrap();

    // the yielder reschedules forever without consuming
    assert!(!topology.wait_inactive_for(
        Duration::from_millis(100),
        Duration::from_millis(600),
    ));
}

#[test]
fn work_timeout_repolls_without_external_changes() {
    init();
    struct Ticker {
        ticks: Arc<AtomicUsize>,
    }
    impl Block for Ticker {
        fn work(&mut self, io: &mut Ports) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            io.set_work_timeout(Some(Duration::from_millis(20)));
            Ok(())
        }
    }

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = BlockBuilder::new("ticker")
        .input(0, INT32)
        .build(Ticker {
            ticks: Arc::clone(&ticks),
        });
    let (feeder, feed) = feeder(INT32);
    feed.feed_elements::<i32>(INT32, &[1]); // never consumed; keeps the port ready

    let topology = Topology::new();
    topology.connect(&feeder, 0, &ticker, 0).unwrap();
    topology.commit().unwrap();

    std::thread::sleep(Duration::from_millis(500));
    // the timer keeps re-polling work with no new input arriving
    assert!(ticks.load(Ordering::SeqCst) >= 3);
}

#[test]
fn cycles_commit_and_quiesce() {
    init();
    let a = gateway(INT32, "FORWARD");
    let b = gateway(INT32, "FORWARD");

    let topology = Topology::new();
    topology.connect(&a, 0, &b, 0).unwrap();
    topology.connect(&b, 0, &a, 0).unwrap();
    topology.commit().unwrap();
    assert!(topology.wait_inactive());
}

#[test]
fn disconnect_takes_effect_on_recommit() {
    init();
    let (feeder, feed) = feeder(INT32);
    let (sink, probe) = collector(INT32);

    let topology = Topology::new();
    topology.connect(&feeder, 0, &sink, 0).unwrap();
    feed.feed_elements::<i32>(INT32, &[1, 2, 3]);
    topology.commit().unwrap();
    settle(&topology);
    assert_eq!(probe.typed::<i32>(), vec![1, 2, 3]);

    topology.disconnect(&feeder, 0, &sink, 0).unwrap();
    topology.commit().unwrap();

    feed.feed_elements::<i32>(INT32, &[4, 5, 6]);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(probe.typed::<i32>(), vec![1, 2, 3]);

    assert!(matches!(
        topology.disconnect(&feeder, 0, &sink, 0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn duplicate_connects_collapse() {
    init();
    let (feeder, feed) = feeder(INT32);
    let (sink, probe) = collector(INT32);

    let topology = Topology::new();
    topology.connect(&feeder, 0, &sink, 0).unwrap();
    topology.connect(&feeder, 0, &sink, 0).unwrap();
    feed.feed_elements::<i32>(INT32, &[9]);
    topology.commit().unwrap();
    settle(&topology);

    // one edge, delivered once
    assert_eq!(probe.typed::<i32>(), vec![9]);
}

#[test]
fn signals_dispatch_into_slots() {
    init();
    struct Emitter {
        fired: bool,
    }
    impl Block for Emitter {
        fn work(&mut self, io: &mut Ports) -> Result<()> {
            if self.fired {
                return Ok(());
            }
            self.fired = true;
            io.post_signal(
                "triggered",
                vec![runnel::Object::from(17i32), runnel::Object::from("go")],
            )?;
            Ok(())
        }
    }

    struct Receiver;
    impl Block for Receiver {
        fn work(&mut self, _io: &mut Ports) -> Result<()> {
            Ok(())
        }
    }

    let emitter = BlockBuilder::new("emitter")
        .signal("triggered")
        .build(Emitter { fired: false });

    let seen: Arc<std::sync::Mutex<Vec<(i64, String)>>> = Arc::default();
    let receiver_seen = Arc::clone(&seen);
    let receiver = BlockBuilder::new("receiver")
        .slot("set_value")
        .call("set_value", move |_receiver: &mut Receiver, args| {
            receiver_seen
                .lock()
                .unwrap()
                .push((args[0].as_i64()?, args[1].as_str()?.to_owned()));
            Ok(runnel::Object::null())
        })
        .build(Receiver);

    let topology = Topology::new();
    topology
        .connect(&emitter, "triggered", &receiver, "set_value")
        .unwrap();
    topology.commit().unwrap();
    settle(&topology);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[(17, "go".to_owned())]);
}

#[test]
fn fan_out_delivers_zero_copy_to_both_sinks() {
    init();
    let (feeder, feed) = feeder(INT32);
    let (sink_a, probe_a) = collector(INT32);
    let (sink_b, probe_b) = collector(INT32);

    feed.feed_elements::<i32>(INT32, &[1, 2, 3, 4]);

    let topology = Topology::new();
    topology.connect(&feeder, 0, &sink_a, 0).unwrap();
    topology.connect(&feeder, 0, &sink_b, 0).unwrap();
    topology.commit().unwrap();
    settle(&topology);

    assert_eq!(probe_a.typed::<i32>(), vec![1, 2, 3, 4]);
    assert_eq!(probe_b.typed::<i32>(), vec![1, 2, 3, 4]);
}
