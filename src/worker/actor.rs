use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::interface::ActorInterface;
use super::pool::PoolSignal;
use crate::block::{Block, CallFn, Ports, WorkInfo};
use crate::buffer::{BufferChunk, BufferManager, ManagedBuffer, Returned};
use crate::port::PortTotals;
use crate::topology::Environment;
use crate::{Error, Label, Object, Result};

/// Scheduling states of a worker actor. *Waiting* is implicit (active with
/// unmet work preconditions) and *Dead* is the dropped actor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ActorState {
    Uninitialized,
    Active,
    Draining,
}

/// A typed message into an actor's mailbox. Everything that touches a
/// block from outside its worker thread arrives as one of these.
pub(crate) enum ActorMessage {
    Buffer {
        port: usize,
        chunk: BufferChunk,
    },
    Label {
        port: usize,
        /// Byte offset relative to the payload flushed alongside.
        offset: usize,
        label: Label,
    },
    Message {
        port: usize,
        value: Object,
        /// Back-pressure token, released when the envelope drops.
        token: Option<ManagedBuffer>,
    },
    SubscriberAdd {
        output: usize,
        link: SubscriberLink,
    },
    SubscriberRemove {
        output: usize,
        actor_uid: usize,
        input: usize,
    },
    InputConnect {
        input: usize,
        upstream: (usize, usize),
    },
    InputDisconnect {
        input: usize,
        upstream: (usize, usize),
    },
    SetOutputManager {
        output: usize,
        manager: Option<Box<dyn BufferManager>>,
        token_manager: Option<Box<dyn BufferManager>>,
    },
    ReturnStream {
        output: usize,
        ret: Returned,
    },
    ReturnToken {
        output: usize,
        ret: Returned,
    },
    Activate {
        reply: mpsc::Sender<std::result::Result<(), String>>,
    },
    Deactivate {
        reply: Option<mpsc::Sender<()>>,
    },
}

/// One downstream endpoint of an output port.
#[derive(Clone)]
pub(crate) struct SubscriberLink {
    pub actor: Arc<WorkerActor>,
    pub input_index: usize,
}

/// Wakes a block's actor from any thread; handed to blocks that run
/// helper threads.
#[derive(Clone)]
pub struct ActorWaker {
    weak: Weak<WorkerActor>,
}

impl ActorWaker {
    pub(crate) fn new(weak: Weak<WorkerActor>) -> ActorWaker {
        ActorWaker { weak }
    }

    pub fn wake(&self) {
        if let Some(actor) = self.weak.upgrade() {
            actor.wake();
        }
    }
}

impl fmt::Debug for ActorWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActorWaker")
    }
}

/// The state guarded by the actor's exclusivity primitive.
pub(crate) struct ActorCore {
    block: Box<dyn Block>,
    pub(crate) ports: Ports,
    calls: std::collections::HashMap<String, CallFn>,
    rx: mpsc::Receiver<ActorMessage>,
    subscribers: Vec<Vec<SubscriberLink>>,
    state: ActorState,
}

/// The per-block execution vehicle: serializes every state change of one
/// block and drives its `work` method when the preconditions hold.
pub(crate) struct WorkerActor {
    uid: usize,
    name: String,
    weak: Weak<WorkerActor>,
    iface: ActorInterface<ActorCore>,
    tx: Mutex<mpsc::Sender<ActorMessage>>,
    /// Bumps on every processed batch; the quiescence predicate watches it.
    work_count: AtomicU64,
    env: Mutex<Environment>,
    pool_signal: Mutex<Option<Arc<PoolSignal>>>,
    /// Re-poll deadline requested through `Ports::set_work_timeout`.
    deadline: Mutex<Option<Instant>>,
}

fn next_uid() -> usize {
    static COUNTER: AtomicUsize = AtomicUsize::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl WorkerActor {
    pub(crate) fn new(
        name: String,
        block: Box<dyn Block>,
        mut ports: Ports,
        calls: std::collections::HashMap<String, CallFn>,
    ) -> Arc<WorkerActor> {
        let (tx, rx) = mpsc::channel();
        let num_outputs = ports.outputs.len();
        Arc::new_cyclic(|weak: &Weak<WorkerActor>| {
            ports.waker = weak.clone();
            WorkerActor {
                uid: next_uid(),
                name,
                weak: weak.clone(),
                iface: ActorInterface::new(ActorCore {
                    block,
                    ports,
                    calls,
                    rx,
                    subscribers: vec![Vec::new(); num_outputs],
                    state: ActorState::Uninitialized,
                }),
                tx: Mutex::new(tx),
                work_count: AtomicU64::new(0),
                env: Mutex::new(Environment::local()),
                pool_signal: Mutex::new(None),
                deadline: Mutex::new(None),
            }
        })
    }

    pub(crate) fn uid(&self) -> usize {
        self.uid
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn work_counter(&self) -> u64 {
        self.work_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_environment(&self, env: Environment) {
        *self.env.lock().unwrap_or_else(PoisonError::into_inner) = env;
    }

    pub(crate) fn environment(&self) -> Environment {
        self.env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn attach_pool_signal(&self, signal: Arc<PoolSignal>) {
        *self
            .pool_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(signal);
        self.wake();
    }

    pub(crate) fn set_wait_mode(&self, enabled: bool) {
        self.iface.set_wait_mode(enabled);
    }

    /// Enqueue a message and wake the actor.
    pub(crate) fn send(&self, msg: ActorMessage) {
        {
            let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            if tx.send(msg).is_err() {
                log::error!("actor {} mailbox is gone", self.name);
                return;
            }
        }
        self.wake();
    }

    pub(crate) fn wake(&self) {
        self.iface.flag_external_change();
        let signal = self
            .pool_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(signal) = signal {
            signal.notify();
        }
    }

    /// Invoke a registered call under the external lock.
    pub(crate) fn call_named(&self, name: &str, args: &[Object]) -> Result<Object> {
        let mut guard = self.iface.external_acquire();
        let core = &mut *guard;
        let call = core.calls.get(name).ok_or_else(|| {
            Error::invalid_argument(format!("block {} has no call \"{}\"", self.name, name))
        })?;
        call(core.block.as_mut(), args)
    }

    /// Run a closure against the ports under the external lock (commit
    /// inspection, totals readout).
    pub(crate) fn with_ports<R>(&self, f: impl FnOnce(&mut Ports) -> R) -> R {
        let mut guard = self.iface.external_acquire();
        f(&mut guard.ports)
    }

    pub(crate) fn input_totals(&self, index: usize) -> Result<PortTotals> {
        self.with_ports(|ports| {
            ports
                .inputs
                .get(index)
                .map(|port| port.totals())
                .ok_or_else(|| Error::invalid_argument(format!("no input port {}", index)))
        })
    }

    pub(crate) fn output_totals(&self, index: usize) -> Result<PortTotals> {
        self.with_ports(|ports| {
            ports
                .outputs
                .get(index)
                .map(|port| port.totals())
                .ok_or_else(|| Error::invalid_argument(format!("no output port {}", index)))
        })
    }

    /// One scheduler pass: claim the actor, drain the mailbox, then run
    /// `work` if possible. Returns whether anything happened.
    pub(crate) fn try_process(&self, wait: Option<Duration>) -> bool {
        {
            let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*deadline, Some(at) if Instant::now() >= at) {
                *deadline = None;
                self.iface.flag_internal_change();
            }
        }
        let mut guard = match self.iface.worker_acquire(wait) {
            Some(guard) => guard,
            None => return false,
        };
        let core = &mut *guard;

        let mut progress = false;
        while let Ok(msg) = core.rx.try_recv() {
            self.handle(core, msg);
            progress = true;
        }
        if self.maybe_work(core) {
            progress = true;
        }
        if progress {
            self.work_count.fetch_add(1, Ordering::AcqRel);
        }
        progress
    }

    fn handle(&self, core: &mut ActorCore, msg: ActorMessage) {
        match msg {
            ActorMessage::Buffer { port, chunk } => {
                if let Some(input) = core.ports.inputs.get_mut(port) {
                    input.deliver_buffer(chunk);
                }
            }
            ActorMessage::Label { port, offset, label } => {
                if let Some(input) = core.ports.inputs.get_mut(port) {
                    input.deliver_label(offset, label);
                }
            }
            ActorMessage::Message { port, value, token } => {
                let is_slot = core
                    .ports
                    .inputs
                    .get(port)
                    .map(|p| p.is_slot)
                    .unwrap_or(false);
                if is_slot {
                    self.dispatch_slot(core, port, value);
                    drop(token); // acknowledge immediately once dispatched
                } else if let Some(input) = core.ports.inputs.get_mut(port) {
                    input.deliver_message(value, token);
                }
            }
            ActorMessage::SubscriberAdd { output, link } => {
                if let Some(port) = core.ports.outputs.get_mut(output) {
                    let id = (link.actor.uid(), link.input_index);
                    // re-commits redeclare edges; every edge appears once
                    if !port.downstream_ids.contains(&id) {
                        port.downstream_ids.push(id);
                        core.subscribers[output].push(link);
                    }
                }
            }
            ActorMessage::SubscriberRemove {
                output,
                actor_uid,
                input,
            } => {
                if let Some(port) = core.ports.outputs.get_mut(output) {
                    port.downstream_ids
                        .retain(|&(uid, idx)| !(uid == actor_uid && idx == input));
                    core.subscribers[output]
                        .retain(|link| !(link.actor.uid() == actor_uid && link.input_index == input));
                }
            }
            ActorMessage::InputConnect { input, upstream } => {
                if let Some(port) = core.ports.inputs.get_mut(input) {
                    if !port.upstreams.contains(&upstream) {
                        port.upstreams.push(upstream);
                    }
                }
            }
            ActorMessage::InputDisconnect { input, upstream } => {
                if let Some(port) = core.ports.inputs.get_mut(input) {
                    if let Some(pos) = port.upstreams.iter().position(|&u| u == upstream) {
                        port.upstreams.remove(pos);
                    }
                }
            }
            ActorMessage::SetOutputManager {
                output,
                manager,
                token_manager,
            } => self.install_managers(core, output, manager, token_manager),
            ActorMessage::ReturnStream { output, ret } => {
                if let Some(port) = core.ports.outputs.get_mut(output) {
                    if let Some(manager) = port.manager.as_mut() {
                        if let Err(e) = manager.push(ret) {
                            log::error!("block {}: stream return failed: {}", self.name, e);
                        }
                    }
                }
            }
            ActorMessage::ReturnToken { output, ret } => {
                if let Some(port) = core.ports.outputs.get_mut(output) {
                    if let Some(manager) = port.token_manager.as_mut() {
                        if let Err(e) = manager.push(ret) {
                            log::error!("block {}: token return failed: {}", self.name, e);
                        }
                    }
                }
                // a freed token may unblock queued messages
                self.flush_messages(core, output);
            }
            ActorMessage::Activate { reply } => {
                let result = match core.state {
                    ActorState::Active => Ok(()),
                    ActorState::Uninitialized | ActorState::Draining => {
                        let ActorCore { block, ports, .. } = core;
                        match block.activate(ports) {
                            Ok(()) => {
                                core.state = ActorState::Active;
                                Ok(())
                            }
                            Err(e) => Err(format!("{}: {}", self.name, e)),
                        }
                    }
                };
                let _ = reply.send(result);
            }
            ActorMessage::Deactivate { reply } => {
                if core.state == ActorState::Active {
                    let ActorCore { block, ports, .. } = core;
                    if let Err(e) = block.deactivate(ports) {
                        log::warn!("block {}: deactivate error: {}", self.name, e);
                    }
                    core.state = ActorState::Draining;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn dispatch_slot(&self, core: &mut ActorCore, port: usize, value: Object) {
        let name = match core.ports.inputs.get(port) {
            Some(input) => input.name().to_owned(),
            None => return,
        };
        let args: Vec<Object> = value
            .get::<Vec<Object>>()
            .cloned()
            .unwrap_or_else(|| vec![value.clone()]);
        match core.calls.get(&name) {
            Some(call) => {
                if let Err(e) = call(core.block.as_mut(), &args) {
                    log::error!("block {}: slot \"{}\" failed: {}", self.name, name, e);
                }
            }
            None => log::warn!("block {}: no slot named \"{}\"", self.name, name),
        }
    }

    fn install_managers(
        &self,
        core: &mut ActorCore,
        output: usize,
        manager: Option<Box<dyn BufferManager>>,
        token_manager: Option<Box<dyn BufferManager>>,
    ) {
        let port = match core.ports.outputs.get_mut(output) {
            Some(port) => port,
            None => return,
        };
        // keep an already-installed pool: in-flight buffers still return
        // to it, and a replacement would refuse them as foreign
        if port.manager.is_some() || port.token_manager.is_some() {
            return;
        }
        if let Some(mut manager) = manager {
            let weak = self.weak.clone();
            manager.set_callback(Some(Arc::new(move |ret: Returned| {
                if let Some(actor) = weak.upgrade() {
                    actor.send(ActorMessage::ReturnStream { output, ret });
                }
            })));
            port.manager = Some(manager);
        }
        if let Some(mut token_manager) = token_manager {
            let weak = self.weak.clone();
            token_manager.set_callback(Some(Arc::new(move |ret: Returned| {
                if let Some(actor) = weak.upgrade() {
                    actor.send(ActorMessage::ReturnToken { output, ret });
                }
            })));
            port.token_manager = Some(token_manager);
        }
    }

    /// Check the work preconditions and, when met, invoke the block's
    /// `work`, then commit: sweep consumed labels into propagation and
    /// flush every output to its subscribers.
    fn maybe_work(&self, core: &mut ActorCore) -> bool {
        if core.state != ActorState::Active {
            return false;
        }

        {
            let ports = &mut core.ports;
            if !ports.inputs.iter().filter(|p| !p.is_slot).all(|p| p.is_ready()) {
                return false;
            }
            stage_read_before_write(ports);
            if !ports.outputs.iter().all(|p| p.is_ready()) {
                // staged in-place buffers must not pin upstream memory
                // while the actor idles
                for output in &mut ports.outputs {
                    output.rbw_staged = None;
                }
                return false;
            }

            let mut min_in = usize::MAX;
            for input in ports.inputs.iter().filter(|p| !p.is_slot) {
                min_in = min_in.min(input.elements());
            }
            let mut min_out = usize::MAX;
            for output in ports.outputs.iter().filter(|p| {
                !p.is_signal && (p.manager.is_some() || p.rbw_staged.is_some())
            }) {
                min_out = min_out.min(output.elements());
            }
            let min_in = if min_in == usize::MAX { 0 } else { min_in };
            let min_out = if min_out == usize::MAX { 0 } else { min_out };
            ports.work_info = WorkInfo {
                min_elements: min_in.min(min_out),
                min_in_elements: min_in,
                min_out_elements: min_out,
                max_timeout_ns: ports
                    .work_timeout
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0),
            };

            for input in &mut ports.inputs {
                input.begin_work();
            }
            for output in &mut ports.outputs {
                output.begin_work();
            }
            ports.yield_requested = false;
        }

        {
            let ActorCore { block, ports, .. } = core;
            if let Err(e) = block.work(ports) {
                log::error!("block {}: work error: {}", self.name, e);
            }
        }

        let consumed: u64 = core
            .ports
            .inputs
            .iter()
            .map(|p| p.consumed_this_work())
            .sum();

        // labels swept past by this work call propagate to the outputs
        for index in 0..core.ports.inputs.len() {
            let swept = core.ports.inputs[index].take_consumed_labels();
            if !swept.is_empty() {
                let ActorCore { block, ports, .. } = core;
                block.propagate_labels(index, &swept, ports);
            }
        }

        let mut delivered = false;
        for index in 0..core.ports.outputs.len() {
            if self.flush_output(core, index) {
                delivered = true;
            }
        }

        // unused in-place staging must not outlive the work call
        for output in &mut core.ports.outputs {
            output.rbw_staged = None;
        }

        {
            let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
            *deadline = core.ports.work_timeout.map(|t| Instant::now() + t);
        }

        let progress = consumed > 0 || delivered || core.ports.yield_requested;
        if progress {
            self.iface.flag_internal_change();
        }
        progress
    }

    /// Commit one output port: pop produced bytes, then deliver labels
    /// ahead of buffers so downstream files them before the data, then
    /// drain messages subject to token back-pressure.
    fn flush_output(&self, core: &mut ActorCore, index: usize) -> bool {
        let (chunks, labels) = {
            let port = &mut core.ports.outputs[index];
            let mut chunks: Vec<BufferChunk> = Vec::new();

            let bytes = port.pending_elements * port.dtype().size();
            if bytes > 0 {
                if let Some(staged) = port.rbw_staged.take() {
                    let mut chunk = staged;
                    chunk.length = bytes.min(chunk.length);
                    chunk.set_dtype(port.dtype());
                    chunks.push(chunk);
                } else {
                    let dtype = port.dtype();
                    match port.manager.as_mut().and_then(|m| {
                        let chunk = m.front().cloned();
                        chunk.map(|c| (c, m))
                    }) {
                        Some((front, manager)) => {
                            let mut chunk = front;
                            chunk.length = bytes.min(chunk.length);
                            chunk.set_dtype(dtype);
                            manager.pop(chunk.length);
                            chunks.push(chunk);
                        }
                        None => log::error!(
                            "block {}: produced {} bytes with no buffer available",
                            self.name,
                            bytes
                        ),
                    }
                }
                port.pending_elements = 0;
            }

            while let Some(chunk) = port.posted_buffers.pop_front() {
                chunks.push(chunk);
            }
            let labels = std::mem::take(&mut port.posted_labels);

            for chunk in &chunks {
                port.totals.elements += chunk.elements() as u64;
                port.totals.buffers += 1;
            }
            port.totals.labels += labels.len() as u64;
            (chunks, labels)
        };

        let links = core.subscribers[index].clone();
        for link in &links {
            for (offset, label) in &labels {
                link.actor.send(ActorMessage::Label {
                    port: link.input_index,
                    offset: *offset,
                    label: label.clone(),
                });
            }
            for chunk in &chunks {
                link.actor.send(ActorMessage::Buffer {
                    port: link.input_index,
                    chunk: chunk.clone(),
                });
            }
        }

        let sent_messages = self.flush_messages(core, index);
        !chunks.is_empty() || !labels.is_empty() || sent_messages
    }

    /// Drain queued messages while tokens are available. Message delivery
    /// stalls without tokens, but buffer streaming never does.
    fn flush_messages(&self, core: &mut ActorCore, index: usize) -> bool {
        let links = core.subscribers[index].clone();
        let mut sent = false;
        loop {
            let port = &mut core.ports.outputs[index];
            if port.posted_messages.is_empty() {
                break;
            }
            let token = match port.token_manager.as_mut() {
                Some(tokens) => {
                    let front = match tokens.front() {
                        Some(front) => (front.managed().cloned(), front.length),
                        None => break, // out of tokens: leave the rest queued
                    };
                    tokens.pop(front.1);
                    front.0
                }
                None => None,
            };
            let value = match port.posted_messages.pop_front() {
                Some(value) => value,
                None => break,
            };
            port.totals.messages += 1;
            sent = true;

            for link in &links {
                link.actor.send(ActorMessage::Message {
                    port: link.input_index,
                    value: value.clone(),
                    token: token.clone(),
                });
            }
        }
        sent
    }
}

impl fmt::Debug for WorkerActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerActor")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .finish()
    }
}

/// Stage in-place buffers for outputs linked to an input via
/// `set_read_before_write`: when the input's front chunk is the sole user
/// reference and element sizes match, the output writes straight into it.
fn stage_read_before_write(ports: &mut Ports) {
    for index in 0..ports.outputs.len() {
        let input_index = match ports.outputs[index].read_before_write {
            Some(input_index) => input_index,
            None => continue,
        };
        if ports.outputs[index].rbw_staged.is_some() {
            continue;
        }
        let input = match ports.inputs.get(input_index) {
            Some(input) => input,
            None => continue,
        };
        if input.dtype().size() != ports.outputs[index].dtype().size() {
            continue;
        }
        let chunk = input.buffer();
        // accumulator copy + this view are the expected two references
        let sole_user = chunk.managed().map(|m| m.use_count() <= 2).unwrap_or(false);
        if chunk.length > 0 && sole_user {
            ports.outputs[index].rbw_staged = Some(chunk);
        }
    }
}
