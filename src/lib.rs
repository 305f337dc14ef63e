//! Runnel is a dataflow runtime. User-supplied compute blocks are connected
//! into a directed graph and exchange typed element streams, in-band labels,
//! and asynchronous messages across ports, with zero-copy buffer forwarding
//! and cooperative scheduling.
//!
//! The pieces, from the bottom up:
//!
//! * [`SharedBuffer`] owns raw memory (heap, circular double-mapped, or a
//!   file mapping).
//! * [`ManagedBuffer`] couples a [`SharedBuffer`] window with a pool slot so
//!   the memory returns to its pool when the last copy drops.
//! * [`BufferChunk`] is the cheap value handle blocks read and write.
//! * [`BufferManager`] implementations ([`SlabBufferManager`],
//!   [`CircularBufferManager`]) pool managed buffers and accept returns from
//!   any thread.
//! * [`InputPort`] / [`OutputPort`] hold per-port streaming state.
//! * Each block runs inside a worker actor that serializes every state
//!   change; a [`ThreadPool`] multiplexes actors onto OS threads.
//! * A [`Topology`] flattens nested graphs, negotiates buffer managers per
//!   edge, splices in network blocks across process boundaries, and commits
//!   the result into running actors.

#![deny(missing_debug_implementations)]

mod block;
mod buffer;
mod dtype;
mod error;
mod label;
mod object;
mod port;
mod registry;
mod topology;
mod worker;

pub mod util;

pub use block::{
    default_propagate_labels, with_block, Block, BlockBuilder, BlockHandle, Ports, WorkInfo,
};
pub use buffer::{
    BufferAccumulator, BufferChunk, BufferManager, BufferManagerArgs, CircularBufferManager,
    ManagedBuffer, Returned, ReturnHook, SharedBuffer, SlabBufferManager,
};
pub use dtype::{Dtype, Scalar};
pub use error::{Error, Result};
pub use label::Label;
pub use object::{register_type, Object, ObjectType, TypeHooks};
pub use port::{InputPort, OutputPort, PortTotals};
pub use registry::BlockRegistry;
pub use topology::{Environment, Node, Topology};
pub use worker::{ActorWaker, AffinityMode, ThreadPool, ThreadPoolArgs, YieldMode};
