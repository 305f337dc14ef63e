use runnel::{BlockRegistry, Dtype, Environment, Label, Object, Scalar, Topology};

mod util;

use util::{collector, feeder, gateway, init, settle, CollectorProbe};

const UINT8: Dtype = Dtype::new(Scalar::U8);

/// Run feeder -> gateway -> collector and return what the collector saw.
/// With `remote_gateway`, the gateway is tagged as another process so the
/// commit must splice in two net-iogress pairs.
fn run_forwarder(remote_gateway: bool) -> CollectorProbe {
    let (feeder, feed) = feeder(UINT8);
    let gate = gateway(UINT8, "FORWARD");
    let (sink, probe) = collector(UINT8);

    if remote_gateway {
        gate.set_environment(Environment::remote(4242, "nodeB"));
    }

    let payload: Vec<u8> = (1..=50).collect();
    feed.feed_label(Label::new("sync", Object::from(0xabcdu16), 5));
    feed.feed_elements::<u8>(UINT8, &payload);
    feed.feed_message(Object::from("end of burst"));

    let sub = Topology::named("forwarder");
    sub.connect(&sub, "in", &gate, 0).unwrap();
    sub.connect(&gate, 0, &sub, "out").unwrap();

    let top = Topology::new();
    top.connect(&feeder, 0, &sub, "in").unwrap();
    top.connect(&sub, "out", &sink, 0).unwrap();
    top.commit().unwrap();
    settle(&top);

    assert_eq!(feeder.output_totals(0).unwrap().elements, 50);
    probe
}

#[test]
fn cross_process_forwarder_matches_local_run() {
    init();
    let local = run_forwarder(false);
    let networked = run_forwarder(true);

    // byte-identical stream
    assert_eq!(local.bytes(), networked.bytes());
    assert_eq!(networked.bytes(), (1..=50).collect::<Vec<u8>>());

    // labels survive with their adjusted index and value
    let local_labels = local.labels();
    let networked_labels = networked.labels();
    assert_eq!(local_labels.len(), 1);
    assert_eq!(networked_labels.len(), 1);
    assert_eq!(networked_labels[0].id, "sync");
    assert_eq!(networked_labels[0].index, local_labels[0].index);
    assert_eq!(
        networked_labels[0]
            .data
            .compare(&Object::from(0xabcdu16))
            .unwrap(),
        std::cmp::Ordering::Equal
    );

    // messages survive serialization
    let messages = networked.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].as_str().unwrap(), "end of burst");
}

#[test]
fn bind_with_port_zero_reports_the_actual_port() {
    init();
    // committing any topology registers the network block factories
    Topology::new().commit().unwrap();

    let sink = BlockRegistry::make(
        "/blocks/network_sink",
        &[
            Object::from("tcp://127.0.0.1:0"),
            Object::from("BIND"),
            Object::from("uint8"),
        ],
    )
    .unwrap();
    let port = sink.call("get_actual_port", &[]).unwrap().as_u64().unwrap();
    assert_ne!(port, 0);
}

#[test]
fn unknown_scheme_is_rejected() {
    init();
    Topology::new().commit().unwrap();

    let result = BlockRegistry::make(
        "/blocks/network_sink",
        &[
            Object::from("udt://127.0.0.1:0"),
            Object::from("BIND"),
            Object::from("uint8"),
        ],
    );
    assert!(matches!(result, Err(runnel::Error::InvalidArgument(_))));
}
