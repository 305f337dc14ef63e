use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::port::{InputPort, OutputPort, PortTotals};
use crate::topology::Environment;
use crate::worker::{ActorWaker, WorkerActor};
use crate::{Dtype, Error, Label, Object, Result};

/// A user-defined compute unit.
///
/// The runtime owns the block's ports and call table; the block supplies
/// behavior. `work` runs only when the scheduler's preconditions hold
/// (input available per port reserve, output buffers available) and is
/// never reentered: all state transitions of one block are serialized by
/// its worker actor.
pub trait Block: Any + Send {
    /// Process available input and produce output. An error terminates
    /// this work call only; it is logged and the block stays active.
    fn work(&mut self, io: &mut Ports) -> Result<()>;

    /// Called when the topology commits, before any `work`. An error here
    /// aborts the commit.
    fn activate(&mut self, io: &mut Ports) -> Result<()> {
        let _ = io;
        Ok(())
    }

    /// Called at topology teardown. Errors are logged and swallowed.
    fn deactivate(&mut self, io: &mut Ports) -> Result<()> {
        let _ = io;
        Ok(())
    }

    /// Forward labels consumed on `input` to the outputs. The default
    /// assumes a 1:1 element rate; rate-changing blocks override and
    /// scale the indexes.
    fn propagate_labels(&mut self, input: usize, labels: &[Label], io: &mut Ports) {
        default_propagate_labels(input, labels, io);
    }
}

/// The default label propagation: every consumed input label goes to every
/// output at the same relative element position.
pub fn default_propagate_labels(input: usize, labels: &[Label], io: &mut Ports) {
    let _ = input;
    for out in 0..io.num_outputs() {
        for label in labels {
            io.output(out).post_label(label.clone());
        }
    }
}

/// Run a registered call against the concrete block type.
pub fn with_block<B: Block, R>(
    block: &mut dyn Block,
    f: impl FnOnce(&mut B) -> Result<R>,
) -> Result<R> {
    let any: &mut dyn Any = block;
    match any.downcast_mut::<B>() {
        Some(block) => f(block),
        None => Err(Error::invalid_argument(
            "registered call dispatched to a different block type",
        )),
    }
}

pub(crate) type CallFn = Box<dyn Fn(&mut dyn Block, &[Object]) -> Result<Object> + Send>;

/// Summary computed before each work call.
#[derive(Copy, Clone, Debug, Default)]
pub struct WorkInfo {
    /// Minimum element count across all stream inputs and outputs.
    pub min_elements: usize,
    /// Minimum element count across stream inputs.
    pub min_in_elements: usize,
    /// Minimum element count across stream outputs.
    pub min_out_elements: usize,
    /// The shortest pending timer, in nanoseconds (0 when none).
    pub max_timeout_ns: u64,
}

/// The block's ports and per-call scratch state, passed to every block
/// entry point.
pub struct Ports {
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) work_info: WorkInfo,
    pub(crate) yield_requested: bool,
    pub(crate) work_timeout: Option<Duration>,
    pub(crate) waker: Weak<WorkerActor>,
}

impl Ports {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// The input port at `index`. Panics on a port the block never set up.
    pub fn input(&mut self, index: usize) -> &mut InputPort {
        &mut self.inputs[index]
    }

    pub fn input_ref(&self, index: usize) -> &InputPort {
        &self.inputs[index]
    }

    /// The output port at `index`. Panics on a port the block never set up.
    pub fn output(&mut self, index: usize) -> &mut OutputPort {
        &mut self.outputs[index]
    }

    pub fn output_ref(&self, index: usize) -> &OutputPort {
        &self.outputs[index]
    }

    pub fn work_info(&self) -> &WorkInfo {
        &self.work_info
    }

    /// Request an immediate reschedule without consuming anything. Used by
    /// rate limiters that want to retry shortly.
    pub fn yield_(&mut self) {
        self.yield_requested = true;
    }

    /// Ask the scheduler to re-poll after `timeout` even without a state
    /// change. `None` clears the timer.
    pub fn set_work_timeout(&mut self, timeout: Option<Duration>) {
        self.work_timeout = timeout;
    }

    /// A handle that wakes this block's actor from any thread. Useful for
    /// blocks that run helper threads (network sources and the like).
    pub fn waker(&self) -> ActorWaker {
        ActorWaker::new(self.waker.clone())
    }

    /// Post an argument envelope on the named signal output.
    pub fn post_signal(&mut self, name: &str, args: Vec<Object>) -> Result<()> {
        let port = self
            .outputs
            .iter_mut()
            .find(|port| port.is_signal && port.name == name)
            .ok_or_else(|| Error::invalid_argument(format!("no signal named \"{}\"", name)))?;
        port.post_message(Object::from(args));
        Ok(())
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports")
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// Declares a block's ports and named calls, then binds them to a block
/// instance, yielding the connectable [`BlockHandle`].
pub struct BlockBuilder {
    name: String,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    calls: HashMap<String, CallFn>,
}

impl BlockBuilder {
    pub fn new(name: impl Into<String>) -> BlockBuilder {
        BlockBuilder {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            calls: HashMap::new(),
        }
    }

    /// Declare the next input port. Ports must be declared in index order.
    pub fn input(self, index: usize, dtype: Dtype) -> BlockBuilder {
        self.input_with_domain(index, dtype, "")
    }

    pub fn input_with_domain(mut self, index: usize, dtype: Dtype, domain: &str) -> BlockBuilder {
        debug_assert_eq!(index, self.inputs.len(), "input ports declared out of order");
        self.inputs
            .push(InputPort::new(index, index.to_string(), dtype, domain.to_owned()));
        self
    }

    /// Declare the next output port. Ports must be declared in index order.
    pub fn output(self, index: usize, dtype: Dtype) -> BlockBuilder {
        self.output_with_domain(index, dtype, "")
    }

    pub fn output_with_domain(mut self, index: usize, dtype: Dtype, domain: &str) -> BlockBuilder {
        debug_assert_eq!(index, self.outputs.len(), "output ports declared out of order");
        self.outputs
            .push(OutputPort::new(index, index.to_string(), dtype, domain.to_owned()));
        self
    }

    /// Declare a named signal: an output port carrying only message
    /// envelopes posted by `Ports::post_signal`.
    pub fn signal(mut self, name: &str) -> BlockBuilder {
        let index = self.outputs.len();
        let mut port = OutputPort::new(index, name.to_owned(), Dtype::default(), String::new());
        port.is_signal = true;
        self.outputs.push(port);
        self
    }

    /// Declare a named slot: an input port whose message envelopes are
    /// dispatched through the call registered under the same name.
    pub fn slot(mut self, name: &str) -> BlockBuilder {
        let index = self.inputs.len();
        let mut port = InputPort::new(index, name.to_owned(), Dtype::default(), String::new());
        port.is_slot = true;
        self.inputs.push(port);
        self
    }

    /// Register a named callable (parameter setter/getter or slot body).
    pub fn call<B: Block>(
        mut self,
        name: &str,
        f: impl Fn(&mut B, &[Object]) -> Result<Object> + Send + 'static,
    ) -> BlockBuilder {
        self.calls.insert(
            name.to_owned(),
            Box::new(move |block, args| with_block::<B, Object>(block, |block| f(block, args))),
        );
        self
    }

    /// Bind to the block instance and hand the result to its worker actor.
    pub fn build(self, block: impl Block) -> BlockHandle {
        let ports = Ports {
            inputs: self.inputs,
            outputs: self.outputs,
            work_info: WorkInfo::default(),
            yield_requested: false,
            work_timeout: None,
            waker: Weak::new(),
        };
        BlockHandle {
            actor: WorkerActor::new(self.name, Box::new(block), ports, self.calls),
        }
    }
}

impl fmt::Debug for BlockBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuilder")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("calls", &self.calls.len())
            .finish()
    }
}

/// A clonable reference to a constructed block and its worker actor; the
/// thing topologies connect.
#[derive(Clone)]
pub struct BlockHandle {
    actor: Arc<WorkerActor>,
}

impl BlockHandle {
    pub fn name(&self) -> &str {
        self.actor.name()
    }

    /// Process-unique block identity.
    pub fn uid(&self) -> usize {
        self.actor.uid()
    }

    /// Invoke a registered call under the actor's external lock.
    pub fn call(&self, name: &str, args: &[Object]) -> Result<Object> {
        self.actor.call_named(name, args)
    }

    /// Tag the block with the environment (process/host) it notionally
    /// runs in; topologies split flows whose endpoints differ.
    pub fn set_environment(&self, env: Environment) {
        self.actor.set_environment(env);
    }

    pub fn environment(&self) -> Environment {
        self.actor.environment()
    }

    pub fn input_totals(&self, index: usize) -> Result<PortTotals> {
        self.actor.input_totals(index)
    }

    pub fn output_totals(&self, index: usize) -> Result<PortTotals> {
        self.actor.output_totals(index)
    }

    pub(crate) fn actor(&self) -> &Arc<WorkerActor> {
        &self.actor
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("name", &self.name())
            .field("uid", &self.uid())
            .finish()
    }
}
