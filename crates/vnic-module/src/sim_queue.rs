//! `SimDevice`: in-memory device model implementing the queue traits.
//!
//! Each queue is a shared state block behind a mutex. The ring holds the
//! `SimSq`/`SimCq` handles; tests and the smoke binary drive the device
//! side through `SimDevice`:
//!
//! | Direction | Device-side helpers                                        |
//! |-----------|------------------------------------------------------------|
//! | Rx        | `deliver`, `inject_rx`, `fail_rx`, `posted_rx*`            |
//! | Tx        | `take_sent`, `complete_tx`, `inject_tx_completion`, `fail_next_prepare` |
//!
//! The model reads and writes packet bytes through the bus addresses it
//! is given, translated back with `SimConfig::dma_offset`. Rings must be
//! backed by a live `SegmentPool` whose mapper matches that offset.

use vnic_core::desc::{
    Direction, DmaBuf, L3Proto, L4Proto, QueueId, QueueSpec, RequestId, RxBufInfo, RxContext, TxContext, TxMeta,
};
use vnic_core::error::HwError;
use vnic_core::queue::{CompletionQueue, QueueFactory, SubmissionQueue};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Live queues the device accepts.
    pub max_queues: usize,
    /// Descriptors a tx queue takes between doorbells. `None`: no limit.
    pub push_burst: Option<u16>,
    /// Bus address minus host address, as applied by the pool's mapper.
    pub dma_offset: i64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { max_queues: 64, push_burst: None, dma_offset: 0 }
    }
}

/// One transmitted packet as the device saw it.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub req_id: RequestId,
    /// Inline push header.
    pub header: Vec<u8>,
    /// Header followed by every DMA buffer, in order.
    pub data: Vec<u8>,
    /// Number of DMA buffers.
    pub bufs: usize,
    pub buf_lens: Vec<u32>,
    pub descs: u16,
    pub meta: TxMeta,
    pub meta_valid: bool,
    pub l3_proto: L3Proto,
    pub l4_proto: L4Proto,
    pub l3_csum_enable: bool,
    pub l4_csum_enable: bool,
    pub df: bool,
}

struct QueueState {
    direction: Direction,
    size: u16,
    destroyed: bool,
    dma_offset: i64,
    push_burst: Option<u16>,
    /// Descriptor entries held by the device.
    outstanding: u32,
    // rx
    posted: VecDeque<(RequestId, DmaBuf)>,
    rx_done: VecDeque<(Vec<RxBufInfo>, RxContext)>,
    rx_fail: Option<HwError>,
    // tx
    in_flight: VecDeque<RequestId>,
    tx_done: VecDeque<RequestId>,
    sent: Vec<SentFrame>,
    pending_descs: u16,
    fail_prepare: bool,
    // counters
    doorbells: u64,
    acks: u64,
    head_updates: u64,
}

impl QueueState {
    fn new(spec: QueueSpec, cfg: &SimConfig) -> Self {
        Self {
            direction: spec.direction,
            size: spec.size,
            destroyed: false,
            dma_offset: cfg.dma_offset,
            push_burst: cfg.push_burst,
            outstanding: 0,
            posted: VecDeque::new(),
            rx_done: VecDeque::new(),
            rx_fail: None,
            in_flight: VecDeque::new(),
            tx_done: VecDeque::new(),
            sent: Vec::new(),
            pending_descs: 0,
            fail_prepare: false,
            doorbells: 0,
            acks: 0,
            head_updates: 0,
        }
    }

    fn free_entries(&self) -> u16 {
        if self.destroyed {
            return 0;
        }
        (self.size as u32 - 1).saturating_sub(self.outstanding) as u16
    }

    fn host_ptr(&self, addr: u64) -> *mut u8 {
        (addr as i64 - self.dma_offset) as usize as *mut u8
    }
}

type Shared = Arc<Mutex<QueueState>>;

fn lock(q: &Shared) -> MutexGuard<'_, QueueState> {
    q.lock().unwrap_or_else(|e| e.into_inner())
}

/// Descriptors a transmit context occupies.
fn tx_descs(ctx: &TxContext<'_>) -> u16 {
    ctx.bufs.len().max(1) as u16 + ctx.meta_valid as u16
}

struct DevState {
    cfg: SimConfig,
    queues: Vec<Option<Shared>>,
}

/// Cloning shares the device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<DevState>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(cfg: SimConfig) -> Self {
        Self { state: Arc::new(Mutex::new(DevState { cfg, queues: Vec::new() })) }
    }

    fn dev(&self) -> MutexGuard<'_, DevState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self, id: QueueId) -> Result<Shared, HwError> {
        self.dev()
            .queues
            .get(id as usize)
            .and_then(|q| q.clone())
            .ok_or(HwError::NoSuchQueue(id))
    }

    /// Live queues.
    pub fn queue_count(&self) -> usize {
        self.dev().queues.iter().filter(|q| q.is_some()).count()
    }

    /// Receive buffers the device currently holds.
    pub fn posted_rx(&self, id: QueueId) -> usize {
        self.queue(id).map(|q| lock(&q).posted.len()).unwrap_or(0)
    }

    /// Posted receive buffers, oldest first.
    pub fn posted_rx_ids(&self, id: QueueId) -> Vec<(RequestId, DmaBuf)> {
        self.queue(id).map(|q| lock(&q).posted.iter().copied().collect()).unwrap_or_default()
    }

    /// Queue a receive completion with arbitrary descriptors. Posted
    /// buffers with matching ids are taken off the posted list; nothing
    /// is written.
    pub fn inject_rx(&self, id: QueueId, bufs: Vec<RxBufInfo>, ctx: RxContext) -> Result<(), HwError> {
        let q = self.queue(id)?;
        let mut q = lock(&q);
        q.posted.retain(|(req_id, _)| !bufs.iter().any(|b| b.req_id == *req_id));
        q.rx_done.push_back((bufs, ctx));
        Ok(())
    }

    /// Receive `frame` into the oldest posted buffers, splitting it as a
    /// device would. Returns descriptors used.
    pub fn deliver(&self, id: QueueId, frame: &[u8], ctx: RxContext) -> Result<usize, HwError> {
        let q = self.queue(id)?;
        let mut q = lock(&q);
        if q.destroyed {
            return Err(HwError::NoSuchQueue(id));
        }

        let mut need = 0;
        let mut covered = 0usize;
        for (_, buf) in q.posted.iter() {
            need += 1;
            covered += buf.len as usize;
            if covered >= frame.len() {
                break;
            }
        }
        if need == 0 || covered < frame.len() {
            return Err(HwError::NoSpace);
        }

        let mut infos = Vec::with_capacity(need);
        let mut off = 0;
        for _ in 0..need {
            let (req_id, buf) = match q.posted.pop_front() {
                Some(p) => p,
                None => break,
            };
            let n = (frame.len() - off).min(buf.len as usize);
            // Safety: posted buffers belong to segments the ring keeps
            // alive until their completion is harvested.
            unsafe {
                std::ptr::copy_nonoverlapping(frame[off..].as_ptr(), q.host_ptr(buf.addr), n);
            }
            infos.push(RxBufInfo { len: n as u16, req_id });
            off += n;
        }
        let descs = infos.len();
        q.rx_done.push_back((infos, ctx));
        Ok(descs)
    }

    /// Make the next `rx_packet` call fail with `err`.
    pub fn fail_rx(&self, id: QueueId, err: HwError) {
        if let Ok(q) = self.queue(id) {
            lock(&q).rx_fail = Some(err);
        }
    }

    /// Drain the frames transmitted so far.
    pub fn take_sent(&self, id: QueueId) -> Vec<SentFrame> {
        self.queue(id).map(|q| std::mem::take(&mut lock(&q).sent)).unwrap_or_default()
    }

    /// Complete up to `max` in-flight transmit requests, oldest first.
    pub fn complete_tx(&self, id: QueueId, max: usize) -> usize {
        let q = match self.queue(id) {
            Ok(q) => q,
            Err(_) => return 0,
        };
        let mut q = lock(&q);
        let n = max.min(q.in_flight.len());
        for _ in 0..n {
            if let Some(req_id) = q.in_flight.pop_front() {
                q.tx_done.push_back(req_id);
            }
        }
        n
    }

    /// Report a transmit completion for an arbitrary request id.
    pub fn inject_tx_completion(&self, id: QueueId, req_id: RequestId) {
        if let Ok(q) = self.queue(id) {
            lock(&q).tx_done.push_back(req_id);
        }
    }

    /// Make the next `prepare_tx` call fail.
    pub fn fail_next_prepare(&self, id: QueueId) {
        if let Ok(q) = self.queue(id) {
            lock(&q).fail_prepare = true;
        }
    }

    /// Transmit requests submitted and not yet completed by the device.
    pub fn tx_in_flight(&self, id: QueueId) -> usize {
        self.queue(id).map(|q| lock(&q).in_flight.len()).unwrap_or(0)
    }

    pub fn sq_free(&self, id: QueueId) -> u16 {
        self.queue(id).map(|q| lock(&q).free_entries()).unwrap_or(0)
    }

    pub fn doorbells(&self, id: QueueId) -> u64 {
        self.queue(id).map(|q| lock(&q).doorbells).unwrap_or(0)
    }

    /// `comp_ack` calls seen.
    pub fn acks(&self, id: QueueId) -> u64 {
        self.queue(id).map(|q| lock(&q).acks).unwrap_or(0)
    }

    pub fn head_updates(&self, id: QueueId) -> u64 {
        self.queue(id).map(|q| lock(&q).head_updates).unwrap_or(0)
    }
}

impl QueueFactory for SimDevice {
    type Sq = SimSq;
    type Cq = SimCq;

    fn create_queue(&mut self, spec: QueueSpec) -> Result<QueueId, HwError> {
        let mut dev = self.dev();
        let live = dev.queues.iter().filter(|q| q.is_some()).count();
        if live >= dev.cfg.max_queues {
            return Err(HwError::QueueTableFull);
        }
        let state = Arc::new(Mutex::new(QueueState::new(spec, &dev.cfg)));
        let id = match dev.queues.iter().position(|q| q.is_none()) {
            Some(free) => {
                dev.queues[free] = Some(state);
                free
            }
            None => {
                dev.queues.push(Some(state));
                dev.queues.len() - 1
            }
        };
        tracing::trace!(id, direction = %spec.direction, size = spec.size, "sim queue created");
        Ok(id as QueueId)
    }

    fn queue_handles(&mut self, id: QueueId) -> Result<(SimSq, SimCq), HwError> {
        let q = self.queue(id)?;
        Ok((SimSq { q: q.clone() }, SimCq { q }))
    }

    fn destroy_queue(&mut self, id: QueueId) -> Result<(), HwError> {
        let q = self
            .dev()
            .queues
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(HwError::NoSuchQueue(id))?;
        let mut q = lock(&q);
        q.destroyed = true;
        // Posted rx buffers are abandoned; the ring frees them itself.
        q.posted.clear();
        q.rx_done.clear();
        tracing::trace!(id, direction = %q.direction, "sim queue destroyed");
        Ok(())
    }
}

pub struct SimSq {
    q: Shared,
}

impl SubmissionQueue for SimSq {
    fn free_entries(&self) -> u16 {
        lock(&self.q).free_entries()
    }

    fn add_rx_desc(&mut self, buf: DmaBuf, req_id: RequestId) -> Result<(), HwError> {
        let mut q = lock(&self.q);
        if q.free_entries() == 0 {
            return Err(HwError::NoSpace);
        }
        q.posted.push_back((req_id, buf));
        q.outstanding += 1;
        Ok(())
    }

    fn doorbell_needed(&self, ctx: &TxContext<'_>) -> bool {
        let q = lock(&self.q);
        match q.push_burst {
            Some(burst) => q.pending_descs + tx_descs(ctx) > burst,
            None => false,
        }
    }

    fn prepare_tx(&mut self, ctx: &TxContext<'_>) -> Result<u16, HwError> {
        let mut q = lock(&self.q);
        if std::mem::take(&mut q.fail_prepare) {
            return Err(HwError::Unknown(-22));
        }
        let descs = tx_descs(ctx);
        if q.free_entries() < descs {
            return Err(HwError::NoSpace);
        }

        let mut data = ctx.push_header.to_vec();
        for buf in ctx.bufs {
            // Safety: the ring keeps the segments behind `bufs` alive
            // for the duration of the call.
            let bytes = unsafe { std::slice::from_raw_parts(q.host_ptr(buf.addr), buf.len as usize) };
            data.extend_from_slice(bytes);
        }
        q.sent.push(SentFrame {
            req_id: ctx.req_id,
            header: ctx.push_header.to_vec(),
            data,
            bufs: ctx.bufs.len(),
            buf_lens: ctx.bufs.iter().map(|b| b.len).collect(),
            descs,
            meta: ctx.meta,
            meta_valid: ctx.meta_valid,
            l3_proto: ctx.l3_proto,
            l4_proto: ctx.l4_proto,
            l3_csum_enable: ctx.l3_csum_enable,
            l4_csum_enable: ctx.l4_csum_enable,
            df: ctx.df,
        });
        q.in_flight.push_back(ctx.req_id);
        q.outstanding += descs as u32;
        q.pending_descs += descs;
        Ok(descs)
    }

    fn write_doorbell(&mut self) {
        let mut q = lock(&self.q);
        q.doorbells += 1;
        q.pending_descs = 0;
    }

    fn comp_ack(&mut self, descs: u16) {
        let mut q = lock(&self.q);
        q.outstanding = q.outstanding.saturating_sub(descs as u32);
        q.acks += 1;
    }
}

pub struct SimCq {
    q: Shared,
}

impl CompletionQueue for SimCq {
    type Sq = SimSq;

    fn next_tx_req_id(&mut self) -> Result<Option<RequestId>, HwError> {
        Ok(lock(&self.q).tx_done.pop_front())
    }

    fn rx_packet(&mut self, _sq: &mut SimSq, bufs: &mut [RxBufInfo]) -> Result<RxContext, HwError> {
        let mut q = lock(&self.q);
        if let Some(err) = q.rx_fail.take() {
            return Err(err);
        }
        let (infos, mut ctx) = match q.rx_done.pop_front() {
            Some(done) => done,
            None => return Ok(RxContext::default()),
        };
        if infos.len() > bufs.len() {
            return Err(HwError::TooManyDescs);
        }
        bufs[..infos.len()].copy_from_slice(&infos);
        ctx.descs = infos.len() as u16;
        q.outstanding = q.outstanding.saturating_sub(infos.len() as u32);
        Ok(ctx)
    }

    fn update_head(&mut self) {
        lock(&self.q).head_updates += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx_spec(size: u16) -> QueueSpec {
        QueueSpec { direction: Direction::Rx, size, numa_node: -1 }
    }

    #[test]
    fn test_queue_table_limit_and_reuse() {
        let mut dev = SimDevice::with_config(SimConfig { max_queues: 2, ..SimConfig::default() });
        let a = dev.create_queue(rx_spec(8)).unwrap();
        let b = dev.create_queue(rx_spec(8)).unwrap();
        assert_eq!(dev.create_queue(rx_spec(8)), Err(HwError::QueueTableFull));
        dev.destroy_queue(a).unwrap();
        assert_eq!(dev.create_queue(rx_spec(8)).unwrap(), a);
        assert_ne!(a, b);
        assert_eq!(dev.destroy_queue(9), Err(HwError::NoSuchQueue(9)));
    }

    #[test]
    fn test_destroyed_handles_are_inert() {
        let mut dev = SimDevice::new();
        let id = dev.create_queue(rx_spec(8)).unwrap();
        let (mut sq, _cq) = dev.queue_handles(id).unwrap();
        assert_eq!(sq.free_entries(), 7);
        dev.destroy_queue(id).unwrap();
        assert_eq!(sq.free_entries(), 0);
        assert_eq!(sq.add_rx_desc(DmaBuf { addr: 0, len: 64 }, 0), Err(HwError::NoSpace));
    }

    #[test]
    fn test_rx_completion_releases_entries() {
        let mut dev = SimDevice::new();
        let id = dev.create_queue(rx_spec(8)).unwrap();
        let (mut sq, mut cq) = dev.queue_handles(id).unwrap();
        let mut backing = vec![0u8; 64];
        let buf = DmaBuf { addr: backing.as_mut_ptr() as u64, len: 64 };
        sq.add_rx_desc(buf, 3).unwrap();
        assert_eq!(sq.free_entries(), 6);

        assert_eq!(dev.deliver(id, b"hello", RxContext::default()).unwrap(), 1);
        let mut infos = [RxBufInfo::default(); 4];
        let ctx = cq.rx_packet(&mut sq, &mut infos).unwrap();
        assert_eq!(ctx.descs, 1);
        assert_eq!(infos[0], RxBufInfo { len: 5, req_id: 3 });
        assert_eq!(&backing[..5], b"hello");
        assert_eq!(sq.free_entries(), 7);
        assert_eq!(cq.rx_packet(&mut sq, &mut infos).unwrap().descs, 0);
    }
}
