//! vnic error types.

use crate::desc::QueueId;
use crate::reset::{ResetReason, ResetRequest};
use thiserror::Error;

/// Errors reported by the hardware abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HwError {
    /// More descriptors reported for one packet than the caller can hold.
    #[error("too many descriptors for one packet")]
    TooManyDescs,
    /// Completion descriptor failed validation.
    #[error("malformed descriptor")]
    MalformedDesc,
    /// Completion carried a request id the queue never issued.
    #[error("invalid request id {0}")]
    InvalidReqId(u16),
    /// Submission queue has no room for the descriptors.
    #[error("submission queue full")]
    NoSpace,
    /// No such hardware queue.
    #[error("no such queue {0}")]
    NoSuchQueue(QueueId),
    /// Device cannot create more queues.
    #[error("device queue table full")]
    QueueTableFull,
    /// Anything else the device reports, with its raw code.
    #[error("device error {0}")]
    Unknown(i32),
}

/// Buffer pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Not enough free segments; nothing was handed out.
    #[error("pool exhausted: requested {requested}, available {available}")]
    Exhausted { requested: usize, available: usize },
    /// Pool geometry rejected at construction.
    #[error("invalid pool geometry: {0}")]
    InvalidGeometry(&'static str),
    /// Backing block mmap failed.
    #[error("mmap failed: errno {0}")]
    MmapFailed(i32),
    /// Backing block mlock failed.
    #[error("mlock failed: errno {0}")]
    MlockFailed(i32),
    /// Segment or packet belongs to another pool.
    #[error("segment belongs to pool {found}, expected {expected}")]
    ForeignSegment { expected: u32, found: u32 },
}

#[derive(Debug, Error)]
pub enum VnicError {
    /// Ring size is not a power of two or out of range.
    #[error("invalid ring size {size} (power of two in {min}..={max} required)")]
    InvalidRingSize { size: usize, min: usize, max: usize },
    /// Receive buffers too small for the device.
    #[error("rx buffer size {size} below minimum {min}")]
    BufferTooSmall { size: usize, min: usize },
    /// Queue index out of range for the port.
    #[error("invalid queue {0}")]
    InvalidQueue(u16),
    /// Queue already configured.
    #[error("queue {0} already configured")]
    AlreadyConfigured(u16),
    /// Queue used before configure.
    #[error("queue {0} not configured")]
    NotConfigured(u16),
    /// Queue already running.
    #[error("queue {0} already started")]
    AlreadyStarted(u16),
    /// Burst on a queue that is not running.
    #[error("queue {0} not started")]
    NotStarted(u16),
    /// Initial receive population came up short.
    #[error("queue {qid}: populated {posted} of {wanted} rx buffers")]
    PopulateFailed { qid: u16, posted: usize, wanted: usize },
    /// Configuration value rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    /// Port id already present in the registry.
    #[error("port {0} already registered")]
    PortExists(u16),
    /// Registry has no free entry.
    #[error("port registry full ({0} ports)")]
    RegistryFull(usize),
    /// The datapath requested a device reset.
    #[error("device reset requested: {0}")]
    Reset(ResetReason),
    #[error(transparent)]
    Hw(#[from] HwError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<ResetRequest> for VnicError {
    fn from(req: ResetRequest) -> Self {
        Self::Reset(req.reason())
    }
}

pub type Result<T> = std::result::Result<T, VnicError>;
