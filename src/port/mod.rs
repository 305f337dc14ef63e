//! Per-port streaming state: input accumulation and output posting.

mod input;
mod output;

pub use input::InputPort;
pub use output::OutputPort;

/// Lifetime counters kept by every port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortTotals {
    /// Elements consumed (input) or produced/forwarded (output).
    pub elements: u64,
    /// Whole buffers delivered.
    pub buffers: u64,
    /// Labels received or posted.
    pub labels: u64,
    /// Async messages received or posted.
    pub messages: u64,
    /// Work invocations that observed this port.
    pub work_events: u64,
}
