use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the runtime reports.
///
/// OS-level failures stay as [`io::Error`] and are carried by the `Io`
/// variant; the remaining variants are domain faults.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad parameter to a setter or factory.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation, mapping, or slicing of a shared buffer failed.
    #[error("shared buffer error: {0}")]
    SharedBuffer(String),

    /// No conversion path between the requested element types.
    #[error("buffer convert error: {0}")]
    BufferConvert(String),

    /// A buffer was returned to a manager that did not mint it.
    #[error("buffer push error: {0}")]
    BufferPush(String),

    /// Incompatible buffer-manager domains across an edge.
    #[error("domain error: {0}")]
    Domain(String),

    /// Missing port, type mismatch, or activation failure during commit.
    /// Carries one entry per block that failed.
    #[error("topology connect error: {}", .0.join("; "))]
    TopologyConnect(Vec<String>),

    /// Unsupported affinity/yield mode or priority out of range.
    #[error("thread pool error: {0}")]
    ThreadPool(String),

    /// Block registry lookup failed.
    #[error("plugin registry error: {0}")]
    PluginRegistry(String),

    /// Registry path syntax error.
    #[error("plugin path error: {0}")]
    PluginPath(String),

    /// Opaque-value conversion failure.
    #[error("object convert error: {0}")]
    ObjectConvert(String),

    /// Opaque values are not comparable.
    #[error("object compare error: {0}")]
    ObjectCompare(String),

    /// Malformed serialized or wire input.
    #[error("data format error: {0}")]
    DataFormat(String),

    /// Underlying OS failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }
}
