//! Buffer memory management: shared allocations, pool-managed windows,
//! cheap chunk handles, and the pooling managers that recycle them.

mod accumulator;
mod chunk;
mod circular;
mod convert;
mod managed;
mod manager;
mod shared;

pub use accumulator::BufferAccumulator;
pub use chunk::BufferChunk;
pub use circular::CircularBufferManager;
pub use managed::{ManagedBuffer, Returned, ReturnHook};
pub use manager::{BufferManager, BufferManagerArgs, SlabBufferManager};
pub use shared::SharedBuffer;
