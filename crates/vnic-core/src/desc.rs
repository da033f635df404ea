//! Descriptor-level types exchanged with the hardware abstraction.
//!
//! These are the device-independent shapes of what a ring hands to a
//! queue and what a queue reports back. The hardware descriptor layout
//! itself belongs to the device implementation.

/// Slot index in a ring's request table. Always `< ring_size`.
pub type RequestId = u16;

/// Device-assigned queue handle.
pub type QueueId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tx => write!(f, "tx"),
            Self::Rx => write!(f, "rx"),
        }
    }
}

/// One buffer as the device sees it: bus address + length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaBuf {
    pub addr: u64,
    pub len: u32,
}

/// Parameters for `QueueFactory::create_queue`.
#[derive(Debug, Clone, Copy)]
pub struct QueueSpec {
    pub direction: Direction,
    /// Ring size, power of two.
    pub size: u16,
    /// NUMA placement hint, `-1` for any.
    pub numa_node: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum L3Proto {
    #[default]
    Unknown,
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum L4Proto {
    #[default]
    Unknown,
    Tcp,
    Udp,
}

/// Transmit metadata fields. Zeroed means "no offload".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxMeta {
    pub mss: u16,
    pub l3_hdr_len: u8,
    pub l3_hdr_offset: u8,
    pub l4_hdr_len: u8,
}

/// Everything the device needs to build the descriptors for one packet.
///
/// `push_header` is the inline header for push-mode queues and is empty
/// for host-memory queues. `bufs` covers the packet bytes not pushed.
#[derive(Debug, Clone, Copy)]
pub struct TxContext<'a> {
    pub req_id: RequestId,
    pub bufs: &'a [DmaBuf],
    pub push_header: &'a [u8],
    pub meta: TxMeta,
    /// Device must read `meta` even when it is all zero.
    pub meta_valid: bool,
    pub l3_proto: L3Proto,
    pub l4_proto: L4Proto,
    pub l3_csum_enable: bool,
    pub l4_csum_enable: bool,
    /// Don't-fragment.
    pub df: bool,
}

impl<'a> TxContext<'a> {
    /// Context with no offloads and no pushed header.
    pub fn plain(req_id: RequestId, bufs: &'a [DmaBuf]) -> Self {
        Self {
            req_id,
            bufs,
            push_header: &[],
            meta: TxMeta::default(),
            meta_valid: false,
            l3_proto: L3Proto::Unknown,
            l4_proto: L4Proto::Unknown,
            l3_csum_enable: false,
            l4_csum_enable: false,
            df: false,
        }
    }
}

/// One completed receive descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxBufInfo {
    pub len: u16,
    pub req_id: RequestId,
}

/// Per-packet receive completion. `descs == 0` means nothing is ready.
///
/// The first `descs` entries of the caller's `RxBufInfo` slice are valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxContext {
    pub descs: u16,
    pub l3_proto: L3Proto,
    pub l4_proto: L4Proto,
    pub l3_csum_err: bool,
    pub l4_csum_err: bool,
    pub l4_csum_checked: bool,
    pub frag: bool,
    pub hash: u32,
}
