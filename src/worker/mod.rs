//! Worker actors and the thread pool that drives them.

mod actor;
mod interface;
mod pool;

pub use actor::ActorWaker;
pub use pool::{AffinityMode, ThreadPool, ThreadPoolArgs, YieldMode};

pub(crate) use actor::{ActorMessage, SubscriberLink, WorkerActor};
pub(crate) use pool::PoolSignal;
