//! Hardware queue traits.
//!
//! A device queue is a pair: the submission side the driver writes
//! descriptors into, and the completion side the device reports progress
//! on. A ring owns both handles exclusively.
//!
//! | Trait             | Driver → device             | Device → driver        |
//! |-------------------|-----------------------------|------------------------|
//! | `SubmissionQueue` | rx buffers, tx contexts, db | free entry count       |
//! | `CompletionQueue` | head updates                | tx req ids, rx packets |
//! | `QueueFactory`    | create / destroy            | queue handles          |

use crate::desc::{DmaBuf, QueueId, QueueSpec, RequestId, RxBufInfo, RxContext, TxContext};
use crate::error::HwError;

/// Submission side of a device queue.
pub trait SubmissionQueue: Send {
    /// Descriptor entries the driver may still fill.
    fn free_entries(&self) -> u16;

    /// True if `n` more descriptors fit.
    fn have_space(&self, n: u16) -> bool {
        self.free_entries() >= n
    }

    /// Post one receive buffer.
    fn add_rx_desc(&mut self, buf: DmaBuf, req_id: RequestId) -> Result<(), HwError>;

    /// True if the device wants a doorbell before `ctx` is written
    /// (burst limit of push-mode queues).
    fn doorbell_needed(&self, ctx: &TxContext<'_>) -> bool;

    /// Write the descriptors for one packet. Returns descriptors consumed.
    fn prepare_tx(&mut self, ctx: &TxContext<'_>) -> Result<u16, HwError>;

    /// Notify the device that new descriptors are ready.
    fn write_doorbell(&mut self);

    /// Give `descs` completed descriptor entries back to the queue.
    fn comp_ack(&mut self, descs: u16);
}

/// Completion side of a device queue.
pub trait CompletionQueue: Send {
    /// The submission handle of the same queue pair.
    type Sq: SubmissionQueue;

    /// Next completed transmit request id, `None` if nothing is ready.
    fn next_tx_req_id(&mut self) -> Result<Option<RequestId>, HwError>;

    /// Next received packet. Fills `bufs[..ctx.descs]`.
    fn rx_packet(&mut self, sq: &mut Self::Sq, bufs: &mut [RxBufInfo]) -> Result<RxContext, HwError>;

    /// Publish the completion head to the device.
    fn update_head(&mut self);
}

/// Creates and destroys device queues.
pub trait QueueFactory {
    type Sq: SubmissionQueue;
    type Cq: CompletionQueue<Sq = Self::Sq>;

    fn create_queue(&mut self, spec: QueueSpec) -> Result<QueueId, HwError>;

    fn queue_handles(&mut self, id: QueueId) -> Result<(Self::Sq, Self::Cq), HwError>;

    /// Quiesce and free the device queue. Handles become inert.
    fn destroy_queue(&mut self, id: QueueId) -> Result<(), HwError>;
}
