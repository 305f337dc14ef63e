//! Graph construction and commit: flatten nested topologies, split flows
//! that cross process boundaries, negotiate buffer managers per edge, wire
//! subscriber lists through actor messages, and activate bottom-up.

mod network;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::block::BlockHandle;
use crate::buffer::{BufferManager, BufferManagerArgs, SlabBufferManager};
use crate::worker::{ActorMessage, SubscriberLink, ThreadPool, WorkerActor};
use crate::{Error, Object, Result};

/// Where a block notionally runs. Blocks in different environments are
/// connected through a net-iogress pair; the actual cross-host transport
/// and proxying layer is outside the runtime, so environments here are
/// tags that drive the partitioning (and, in tests, exercise the real
/// wire path over loopback).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Environment {
    pub pid: u64,
    pub node_id: String,
}

impl Environment {
    /// The environment of this process.
    pub fn local() -> Environment {
        Environment {
            pid: std::process::id() as u64,
            node_id: "localhost".to_owned(),
        }
    }

    pub fn remote(pid: u64, node_id: impl Into<String>) -> Environment {
        Environment {
            pid,
            node_id: node_id.into(),
        }
    }
}

/// Anything a flow can reference: a concrete block or a nested topology
/// (whose named ports pass through to its inner flows).
#[derive(Clone, Debug)]
pub enum Node {
    Block(BlockHandle),
    Topology(Topology),
}

impl From<&BlockHandle> for Node {
    fn from(handle: &BlockHandle) -> Node {
        Node::Block(handle.clone())
    }
}

impl From<BlockHandle> for Node {
    fn from(handle: BlockHandle) -> Node {
        Node::Block(handle)
    }
}

impl From<&Topology> for Node {
    fn from(topology: &Topology) -> Node {
        Node::Topology(topology.clone())
    }
}

impl From<Topology> for Node {
    fn from(topology: Topology) -> Node {
        Node::Topology(topology)
    }
}

#[derive(Clone)]
enum Endpoint {
    Block { handle: BlockHandle, port: String },
    Topology { topology: Topology, port: String },
    /// A pass-through port of the topology identified by uid.
    Virtual { topology_uid: usize, port: String },
}

impl Endpoint {
    fn key(&self) -> (u8, usize, &str) {
        match self {
            Endpoint::Block { handle, port } => (0, handle.uid(), port),
            Endpoint::Topology { topology, port } => (1, topology.uid, port),
            Endpoint::Virtual { topology_uid, port } => (2, *topology_uid, port),
        }
    }
}

#[derive(Clone)]
struct Flow {
    src: Endpoint,
    dst: Endpoint,
}

impl Flow {
    fn same(&self, other: &Flow) -> bool {
        self.src.key() == other.src.key() && self.dst.key() == other.dst.key()
    }
}

/// A flow whose endpoints are concrete blocks.
#[derive(Clone)]
struct FlatFlow {
    src: BlockHandle,
    src_port: String,
    dst: BlockHandle,
    dst_port: String,
}

type FlowKey = (usize, String, usize, String);

impl FlatFlow {
    fn key(&self) -> FlowKey {
        (
            self.src.uid(),
            self.src_port.clone(),
            self.dst.uid(),
            self.dst_port.clone(),
        )
    }
}

/// A flat flow with port names resolved to indexes.
#[derive(Clone)]
struct ResolvedFlow {
    src: BlockHandle,
    src_index: usize,
    dst: BlockHandle,
    dst_index: usize,
    key: FlowKey,
}

struct NetPair {
    sink: BlockHandle,
    source: BlockHandle,
}

struct TopologyInner {
    name: String,
    flows: Vec<Flow>,
    committed: Vec<ResolvedFlow>,
    netgress: HashMap<(usize, String), NetPair>,
    assigned_outputs: HashSet<(usize, usize)>,
    pool: ThreadPool,
    active_actors: Vec<Arc<WorkerActor>>,
}

/// A directed graph of flows among blocks, possibly hierarchical.
///
/// Build with `connect`/`disconnect`, then `commit` to (re)wire and
/// activate; the diff between the old and new flattened flow sets is
/// delivered to the affected actors as messages. `wait_inactive` is the
/// supported "done" predicate for bounded runs.
#[derive(Clone)]
pub struct Topology {
    uid: usize,
    inner: Arc<Mutex<TopologyInner>>,
}

fn next_uid() -> usize {
    static COUNTER: AtomicUsize = AtomicUsize::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl Default for Topology {
    fn default() -> Topology {
        Topology::new()
    }
}

impl Topology {
    pub fn new() -> Topology {
        Topology::named("")
    }

    pub fn named(name: impl Into<String>) -> Topology {
        Topology {
            uid: next_uid(),
            inner: Arc::new(Mutex::new(TopologyInner {
                name: name.into(),
                flows: Vec::new(),
                committed: Vec::new(),
                netgress: HashMap::new(),
                assigned_outputs: HashSet::new(),
                pool: ThreadPool::default(),
                active_actors: Vec::new(),
            })),
        }
    }

    /// Replace the thread pool used by future commits.
    pub fn set_thread_pool(&self, pool: ThreadPool) {
        self.lock().pool = pool;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TopologyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint(&self, node: Node, port: String) -> Endpoint {
        match node {
            Node::Block(handle) => Endpoint::Block { handle, port },
            Node::Topology(topology) if topology.uid == self.uid => Endpoint::Virtual {
                topology_uid: self.uid,
                port,
            },
            Node::Topology(topology) => Endpoint::Topology { topology, port },
        }
    }

    /// Declare a flow. Connecting the topology itself declares a virtual
    /// pass-through port. Duplicate declarations are ignored.
    pub fn connect(
        &self,
        src: impl Into<Node>,
        src_port: impl fmt::Display,
        dst: impl Into<Node>,
        dst_port: impl fmt::Display,
    ) -> Result<()> {
        let flow = Flow {
            src: self.endpoint(src.into(), src_port.to_string()),
            dst: self.endpoint(dst.into(), dst_port.to_string()),
        };
        let mut inner = self.lock();
        if !inner.flows.iter().any(|f| f.same(&flow)) {
            inner.flows.push(flow);
        }
        Ok(())
    }

    /// Remove a declared flow. Takes effect at the next commit.
    pub fn disconnect(
        &self,
        src: impl Into<Node>,
        src_port: impl fmt::Display,
        dst: impl Into<Node>,
        dst_port: impl fmt::Display,
    ) -> Result<()> {
        let flow = Flow {
            src: self.endpoint(src.into(), src_port.to_string()),
            dst: self.endpoint(dst.into(), dst_port.to_string()),
        };
        let mut inner = self.lock();
        let before = inner.flows.len();
        inner.flows.retain(|f| !f.same(&flow));
        if inner.flows.len() == before {
            return Err(Error::invalid_argument("no such flow to disconnect"));
        }
        Ok(())
    }

    /// Remove every declared flow. Takes effect at the next commit.
    pub fn disconnect_all(&self) {
        self.lock().flows.clear();
    }

    /// Flatten, partition, negotiate, wire, and activate.
    pub fn commit(&self) -> Result<()> {
        network::ensure_registered();
        let mut inner = self.lock();

        let flat = self.flatten(&inner)?;
        let flat = create_network_flows(&mut inner, flat)?;
        let resolved = resolve_flows(&flat)?;

        // the actors this commit touches
        let mut actors: BTreeMap<usize, Arc<WorkerActor>> = BTreeMap::new();
        for flow in &resolved {
            actors.insert(flow.src.uid(), Arc::clone(flow.src.actor()));
            actors.insert(flow.dst.uid(), Arc::clone(flow.dst.actor()));
        }
        for actor in actors.values() {
            inner.pool.attach(actor);
        }

        negotiate_managers(&mut inner, &resolved)?;

        // subscriber deltas, removals first
        let new_keys: HashSet<FlowKey> = resolved.iter().map(|f| f.key.clone()).collect();
        let old_keys: HashSet<FlowKey> = inner.committed.iter().map(|f| f.key.clone()).collect();
        for flow in &inner.committed {
            if !new_keys.contains(&flow.key) {
                flow.src.actor().send(ActorMessage::SubscriberRemove {
                    output: flow.src_index,
                    actor_uid: flow.dst.uid(),
                    input: flow.dst_index,
                });
                flow.dst.actor().send(ActorMessage::InputDisconnect {
                    input: flow.dst_index,
                    upstream: (flow.src.uid(), flow.src_index),
                });
            }
        }
        for flow in &resolved {
            if !old_keys.contains(&flow.key) {
                flow.src.actor().send(ActorMessage::SubscriberAdd {
                    output: flow.src_index,
                    link: SubscriberLink {
                        actor: Arc::clone(flow.dst.actor()),
                        input_index: flow.dst_index,
                    },
                });
                flow.dst.actor().send(ActorMessage::InputConnect {
                    input: flow.dst_index,
                    upstream: (flow.src.uid(), flow.src_index),
                });
            }
        }

        // activate bottom-up: leaf consumers first, so sinks are ready
        // when data begins to flow
        let order = activation_order(&resolved);
        let mut activated: Vec<Arc<WorkerActor>> = Vec::new();
        for actor in &order {
            let (reply_tx, reply_rx) = mpsc::channel();
            actor.send(ActorMessage::Activate { reply: reply_tx });
            let result = reply_rx
                .recv_timeout(Duration::from_secs(10))
                .unwrap_or_else(|_| Err(format!("{}: activation timed out", actor.name())));
            match result {
                Ok(()) => activated.push(Arc::clone(actor)),
                Err(failure) => {
                    // unwind in reverse order before reporting
                    for prior in activated.iter().rev() {
                        deactivate_and_wait(prior);
                    }
                    return Err(Error::TopologyConnect(vec![failure]));
                }
            }
        }

        // blocks that dropped out of the graph entirely
        let keep: HashSet<usize> = actors.keys().copied().collect();
        let dropped: Vec<Arc<WorkerActor>> = inner
            .active_actors
            .iter()
            .filter(|actor| !keep.contains(&actor.uid()))
            .cloned()
            .collect();
        for actor in dropped {
            deactivate_and_wait(&actor);
            inner.pool.detach(actor.uid());
        }

        inner.committed = resolved;
        inner.active_actors = order;
        Ok(())
    }

    /// True when no actor has performed observable work for `idle`
    /// within the `timeout` window.
    pub fn wait_inactive(&self) -> bool {
        self.wait_inactive_for(Duration::from_millis(100), Duration::from_secs(5))
    }

    pub fn wait_inactive_for(&self, idle: Duration, timeout: Duration) -> bool {
        let actors: Vec<Arc<WorkerActor>> = self.lock().active_actors.clone();
        let counters = |actors: &[Arc<WorkerActor>]| -> Vec<u64> {
            actors.iter().map(|a| a.work_counter()).collect()
        };

        let started = Instant::now();
        let mut snapshot = counters(&actors);
        let mut stable_since = Instant::now();
        let poll = Duration::from_millis(1).max(idle / 10);
        loop {
            std::thread::sleep(poll);
            let now = counters(&actors);
            if now != snapshot {
                snapshot = now;
                stable_since = Instant::now();
            } else if stable_since.elapsed() >= idle {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
        }
    }

    /// Flatten nested topologies into flows among concrete blocks.
    fn flatten(&self, inner: &TopologyInner) -> Result<Vec<FlatFlow>> {
        let mut flows: Vec<Flow> = inner.flows.clone();
        let mut imported: HashSet<usize> = HashSet::new();
        imported.insert(self.uid);

        // import every reachable nested topology's flows (transitively),
        // then rewrite nested-topology endpoints as virtual ports
        loop {
            let mut to_import: Option<Topology> = None;
            'scan: for flow in &flows {
                for endpoint in [&flow.src, &flow.dst] {
                    if let Endpoint::Topology { topology, .. } = endpoint {
                        if !imported.contains(&topology.uid) {
                            to_import = Some(topology.clone());
                            break 'scan;
                        }
                    }
                }
            }
            let topology = match to_import {
                Some(topology) => topology,
                None => break,
            };
            imported.insert(topology.uid);
            flows.extend(topology.lock().flows.iter().cloned());
        }
        for flow in &mut flows {
            for endpoint in [&mut flow.src, &mut flow.dst] {
                if let Endpoint::Topology { topology, port } = endpoint {
                    *endpoint = Endpoint::Virtual {
                        topology_uid: topology.uid,
                        port: std::mem::take(port),
                    };
                }
            }
        }

        // splice (X -> virtual) against every (virtual -> Y)
        let mut fuel = 10_000usize;
        loop {
            let position = flows
                .iter()
                .position(|f| matches!(f.dst, Endpoint::Virtual { .. }));
            let index = match position {
                Some(index) => index,
                None => break,
            };
            fuel = fuel.saturating_sub(1);
            if fuel == 0 {
                return Err(Error::TopologyConnect(vec![format!(
                    "topology {}: virtual port resolution did not converge",
                    inner.name
                )]));
            }
            let flow = flows.remove(index);
            let continuations: Vec<Endpoint> = flows
                .iter()
                .filter(|g| g.src.key() == flow.dst.key())
                .map(|g| g.dst.clone())
                .collect();
            for dst in continuations {
                let candidate = Flow {
                    src: flow.src.clone(),
                    dst,
                };
                if !flows.iter().any(|f| f.same(&candidate)) {
                    flows.push(candidate);
                }
            }
        }

        // whatever still touches a virtual port is an unconnected
        // pass-through or a consumed template
        let mut flat = Vec::new();
        for flow in flows {
            if let (Endpoint::Block { handle: src, port: src_port },
                    Endpoint::Block { handle: dst, port: dst_port }) = (flow.src, flow.dst)
            {
                let candidate = FlatFlow {
                    src,
                    src_port,
                    dst,
                    dst_port,
                };
                if !flat.iter().any(|f: &FlatFlow| f.key() == candidate.key()) {
                    flat.push(candidate);
                }
            }
        }
        Ok(flat)
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Topology")
            .field("name", &inner.name)
            .field("flows", &inner.flows.len())
            .field("committed", &inner.committed.len())
            .finish()
    }
}

impl Drop for TopologyInner {
    fn drop(&mut self) {
        for actor in &self.active_actors {
            deactivate_and_wait(actor);
        }
        // unwire the committed flows so blocks can join other topologies
        // (and so feedback edges do not leak actor references)
        for flow in &self.committed {
            flow.src.actor().send(ActorMessage::SubscriberRemove {
                output: flow.src_index,
                actor_uid: flow.dst.uid(),
                input: flow.dst_index,
            });
            flow.dst.actor().send(ActorMessage::InputDisconnect {
                input: flow.dst_index,
                upstream: (flow.src.uid(), flow.src_index),
            });
        }
        for actor in &self.active_actors {
            self.pool.detach(actor.uid());
        }
    }
}

fn deactivate_and_wait(actor: &Arc<WorkerActor>) {
    let (reply_tx, reply_rx) = mpsc::channel();
    actor.send(ActorMessage::Deactivate {
        reply: Some(reply_tx),
    });
    if reply_rx.recv_timeout(Duration::from_secs(5)).is_err() {
        log::warn!("block {} did not acknowledge deactivation", actor.name());
    }
}

/// Resolve port names to indexes; every failure becomes one entry of the
/// composite connect error.
fn resolve_flows(flat: &[FlatFlow]) -> Result<Vec<ResolvedFlow>> {
    let mut errors = Vec::new();
    let mut resolved = Vec::new();
    for flow in flat {
        let src_index = flow
            .src
            .actor()
            .with_ports(|p| p.outputs.iter().position(|o| o.name() == flow.src_port));
        let dst_index = flow
            .dst
            .actor()
            .with_ports(|p| p.inputs.iter().position(|i| i.name() == flow.dst_port));
        let (src_index, dst_index) = match (src_index, dst_index) {
            (Some(s), Some(d)) => (s, d),
            (None, _) => {
                errors.push(format!(
                    "{} has no output port \"{}\"",
                    flow.src.name(),
                    flow.src_port
                ));
                continue;
            }
            (_, None) => {
                errors.push(format!(
                    "{} has no input port \"{}\"",
                    flow.dst.name(),
                    flow.dst_port
                ));
                continue;
            }
        };

        let src_size = flow
            .src
            .actor()
            .with_ports(|p| p.outputs[src_index].dtype().size());
        let dst_size = flow
            .dst
            .actor()
            .with_ports(|p| p.inputs[dst_index].dtype().size());
        if src_size != dst_size {
            errors.push(format!(
                "element size mismatch {}[{}] ({}B) -> {}[{}] ({}B)",
                flow.src.name(),
                flow.src_port,
                src_size,
                flow.dst.name(),
                flow.dst_port,
                dst_size
            ));
            continue;
        }

        resolved.push(ResolvedFlow {
            key: flow.key(),
            src: flow.src.clone(),
            src_index,
            dst: flow.dst.clone(),
            dst_index,
        });
    }
    if !errors.is_empty() {
        return Err(Error::TopologyConnect(errors));
    }
    Ok(resolved)
}

/// Split cross-environment flows through cached net-iogress pairs, keyed
/// by source port so fan-out to several processes shares one sink.
fn create_network_flows(inner: &mut TopologyInner, flat: Vec<FlatFlow>) -> Result<Vec<FlatFlow>> {
    // create missing pairs concurrently
    let mut missing: Vec<FlatFlow> = Vec::new();
    for flow in &flat {
        let crosses = flow.src.environment() != flow.dst.environment();
        let key = (flow.src.uid(), flow.src_port.clone());
        if crosses
            && !inner.netgress.contains_key(&key)
            && !missing
                .iter()
                .any(|m| m.src.uid() == flow.src.uid() && m.src_port == flow.src_port)
        {
            missing.push(flow.clone());
        }
    }
    let handles: Vec<_> = missing
        .into_iter()
        .map(|flow| {
            std::thread::spawn(move || {
                let key = (flow.src.uid(), flow.src_port.clone());
                (key, create_net_pair(&flow))
            })
        })
        .collect();
    for handle in handles {
        let (key, pair) = handle
            .join()
            .map_err(|_| Error::TopologyConnect(vec!["net pair creation panicked".into()]))?;
        inner.netgress.insert(key, pair?);
    }

    let mut out: Vec<FlatFlow> = Vec::new();
    fn push_unique(out: &mut Vec<FlatFlow>, flow: FlatFlow) {
        if !out.iter().any(|f| f.key() == flow.key()) {
            out.push(flow);
        }
    }
    for flow in flat {
        if flow.src.environment() == flow.dst.environment() {
            push_unique(&mut out, flow);
            continue;
        }
        let key = (flow.src.uid(), flow.src_port.clone());
        let pair = match inner.netgress.get(&key) {
            Some(pair) => pair,
            None => continue, // creation failed above and already reported
        };
        push_unique(
            &mut out,
            FlatFlow {
                src: flow.src.clone(),
                src_port: flow.src_port.clone(),
                dst: pair.sink.clone(),
                dst_port: "0".to_owned(),
            },
        );
        push_unique(
            &mut out,
            FlatFlow {
                src: pair.source.clone(),
                src_port: "0".to_owned(),
                dst: flow.dst.clone(),
                dst_port: flow.dst_port.clone(),
            },
        );
    }
    Ok(out)
}

/// Instantiate a bind/connect net pair for one cross-environment flow.
/// The side on a non-local node binds (its address is the reachable one);
/// the tie-break keeps the sink side binding.
fn create_net_pair(flow: &FlatFlow) -> Result<NetPair> {
    let src_env = flow.src.environment();
    let dst_env = flow.dst.environment();
    let local = Environment::local();

    let dtype_name = flow.src.actor().with_ports(|p| {
        p.outputs
            .iter()
            .find(|o| o.name() == flow.src_port)
            .map(|o| o.dtype())
    });
    let dtype_name = match dtype_name.map(|d| d.to_string()) {
        // opaque custom elements travel as raw bytes
        Some(name) if name != "custom" => name,
        _ => "uint8".to_owned(),
    };

    let sink_binds = !(src_env.node_id == local.node_id && dst_env.node_id != local.node_id);
    let bind_path = if sink_binds {
        "/blocks/network_sink"
    } else {
        "/blocks/network_source"
    };
    let connect_path = if sink_binds {
        "/blocks/network_source"
    } else {
        "/blocks/network_sink"
    };

    let bound = crate::registry::BlockRegistry::make(
        bind_path,
        &[
            Object::from("tcp://127.0.0.1:0"),
            Object::from("BIND"),
            Object::from(dtype_name.clone()),
        ],
    )?;
    let port = bound.call("get_actual_port", &[])?.as_u64()?;
    let connected = crate::registry::BlockRegistry::make(
        connect_path,
        &[
            Object::from(format!("tcp://127.0.0.1:{}", port)),
            Object::from("CONNECT"),
            Object::from(dtype_name),
        ],
    )?;

    let (sink, source) = if sink_binds {
        (bound, connected)
    } else {
        (connected, bound)
    };
    sink.set_environment(src_env);
    source.set_environment(dst_env);
    log::debug!(
        "net pair for {}[{}]: sink {} source {}",
        flow.src.name(),
        flow.src_port,
        sink.uid(),
        source.uid()
    );
    Ok(NetPair { sink, source })
}

/// Per-edge buffer-manager negotiation: a custom-domain output forwards
/// its own buffers (no manager); otherwise the edge gets a default slab
/// manager sized from the upstream hints. Incompatible non-empty domains
/// fail the commit.
fn negotiate_managers(inner: &mut TopologyInner, resolved: &[ResolvedFlow]) -> Result<()> {
    for flow in resolved {
        let out_domain = flow
            .src
            .actor()
            .with_ports(|p| p.outputs[flow.src_index].domain().to_owned());
        let in_domain = flow
            .dst
            .actor()
            .with_ports(|p| p.inputs[flow.dst_index].domain().to_owned());
        if !out_domain.is_empty() && !in_domain.is_empty() && out_domain != in_domain {
            return Err(Error::Domain(format!(
                "{}[{}] domain \"{}\" is incompatible with {}[{}] domain \"{}\"",
                flow.src.name(),
                flow.src_index,
                out_domain,
                flow.dst.name(),
                flow.dst_index,
                in_domain
            )));
        }

        let id = (flow.src.uid(), flow.src_index);
        if inner.assigned_outputs.contains(&id) {
            continue;
        }
        inner.assigned_outputs.insert(id);

        let (elem_size, is_signal) = flow.src.actor().with_ports(|p| {
            let port = &p.outputs[flow.src_index];
            (port.dtype().size(), port.is_signal())
        });

        let manager: Option<Box<dyn BufferManager>> = if !out_domain.is_empty() || is_signal {
            None // the block forwards its own buffers on this port
        } else {
            let mut args = BufferManagerArgs::default();
            // whole elements per buffer
            args.buffer_size = args.buffer_size.next_multiple_of(elem_size.max(1));
            let mut slab = SlabBufferManager::new();
            slab.init(&args)?;
            Some(Box::new(slab))
        };

        let mut token_args = BufferManagerArgs::default();
        token_args.num_buffers = 16;
        token_args.buffer_size = 16;
        let mut tokens = SlabBufferManager::new();
        tokens.init(&token_args)?;

        flow.src.actor().send(ActorMessage::SetOutputManager {
            output: flow.src_index,
            manager,
            token_manager: Some(Box::new(tokens)),
        });
    }
    Ok(())
}

/// Order actors leaf-consumers-first: an actor is scheduled once all of
/// its downstream actors are. Cycles fall back to ascending identity.
fn activation_order(resolved: &[ResolvedFlow]) -> Vec<Arc<WorkerActor>> {
    let mut actors: BTreeMap<usize, Arc<WorkerActor>> = BTreeMap::new();
    let mut downstream: HashMap<usize, HashSet<usize>> = HashMap::new();
    for flow in resolved {
        actors.insert(flow.src.uid(), Arc::clone(flow.src.actor()));
        actors.insert(flow.dst.uid(), Arc::clone(flow.dst.actor()));
        if flow.src.uid() != flow.dst.uid() {
            downstream
                .entry(flow.src.uid())
                .or_default()
                .insert(flow.dst.uid());
        }
    }

    let mut order = Vec::with_capacity(actors.len());
    let mut done: HashSet<usize> = HashSet::new();
    while done.len() < actors.len() {
        let next = actors
            .keys()
            .find(|&&uid| {
                !done.contains(&uid)
                    && downstream
                        .get(&uid)
                        .map(|ds| ds.iter().all(|d| done.contains(d) || !actors.contains_key(d)))
                        .unwrap_or(true)
            })
            .or_else(|| actors.keys().find(|&&uid| !done.contains(&uid)))
            .copied();
        let uid = match next {
            Some(uid) => uid,
            None => break,
        };
        done.insert(uid);
        if let Some(actor) = actors.get(&uid) {
            order.push(Arc::clone(actor));
        }
    }
    order
}
