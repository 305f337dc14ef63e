//! Small containers and locks used by the runtime internals.

mod ordered_queue;
mod ring_deque;
mod spin_rw;

pub use ordered_queue::OrderedQueue;
pub use ring_deque::RingDeque;
pub use spin_rw::{SharedGuard, SpinLockRW, WriteGuard};
