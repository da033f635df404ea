//! Ring, watchdog and port configuration.
//!
//! Plain structs with `Default` and builder-style setters. `from_env`
//! applies `VNIC_*` overrides on top of the defaults:
//!
//! | Variable               | Field                          | Default        |
//! |------------------------|--------------------------------|----------------|
//! | `VNIC_RING_SIZE`       | `RingConfig::size`             | 1024           |
//! | `VNIC_RX_FREE_THRESH`  | `RingConfig::rx_free_thresh`   | min(n/8, 256)  |
//! | `VNIC_TX_FREE_THRESH`  | `RingConfig::tx_free_thresh`   | max(n-n/8, n-256) |
//! | `VNIC_MAX_SGL`         | `RingConfig::max_sgl`          | 17             |
//! | `VNIC_LLQ`             | push mode on/off               | off            |
//! | `VNIC_LLQ_HEADER`      | push header size               | 128            |
//! | `VNIC_FAST_FREE`       | `RingConfig::fast_free`        | off            |
//! | `VNIC_NO_META_CACHE`   | `RingConfig::disable_meta_caching` | off        |
//! | `VNIC_MISS_TXC_TO_MS`  | watchdog timeout, 0 disables   | 5000           |
//! | `VNIC_MISS_TXC_THRESH` | watchdog threshold             | min(n/2, 256)  |
//! | `VNIC_STALL_DELAY_MS`  | watchdog stall gate, 0 = off   | 0              |
//! | `VNIC_NUM_QUEUES`      | `PortConfig::num_queues`       | 1              |

use crate::env::{env_get, env_get_bool, env_get_opt};
use crate::error::{Result, VnicError};
use crate::offload::QueueOffloads;
use std::time::Duration;

pub const MIN_RING_DESC: u16 = 128;
pub const MAX_RING_DESC: u16 = 8192;
pub const DEFAULT_RING_SIZE: u16 = 1024;

/// Smallest receive buffer a port accepts.
pub const RX_BUF_MIN_SIZE: usize = 1400;

/// Most descriptors one packet may span.
pub const PKT_MAX_BUFS: usize = 19;
pub const DEFAULT_MAX_SGL: u16 = 17;

pub const DEFAULT_PUSH_HEADER: u16 = 128;

/// Fast-free mode returns segments to the pool in batches of this size.
pub const CLEANUP_BUF_THRESH: usize = 256;

const REFILL_THRESH_DIVIDER: u16 = 8;
const REFILL_THRESH_PACKET: u16 = 256;

pub const DEFAULT_MISS_TXC_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MONITORED_QUEUES: usize = 3;

pub const MAX_PORTS: usize = 16;

/// Where transmit packet bytes live when the device reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Every byte is fetched by DMA from host memory.
    Host,
    /// Low-latency queue: the first `max_header_size` bytes are pushed
    /// inline with the descriptor.
    Device { max_header_size: u16 },
}

impl PlacementPolicy {
    pub fn push_header_size(&self) -> usize {
        match self {
            Self::Host => 0,
            Self::Device { max_header_size } => *max_header_size as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RingConfig {
    pub size: u16,
    pub placement: PlacementPolicy,
    pub offloads: QueueOffloads,
    /// Transmit scatter-gather limit. Longer chains are dropped.
    pub max_sgl: u16,
    pub rx_free_thresh: Option<u16>,
    pub tx_free_thresh: Option<u16>,
    /// Every transmit carries metadata, even zeroed.
    pub disable_meta_caching: bool,
    /// Batch transmit frees.
    pub fast_free: bool,
    pub numa_node: i32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_RING_SIZE,
            placement: PlacementPolicy::Host,
            offloads: QueueOffloads::RX_CHECKSUM | QueueOffloads::TX_IPV4_CKSUM | QueueOffloads::TX_UDP_CKSUM,
            max_sgl: DEFAULT_MAX_SGL,
            rx_free_thresh: None,
            tx_free_thresh: None,
            disable_meta_caching: false,
            fast_free: false,
            numa_node: -1,
        }
    }
}

impl RingConfig {
    pub fn with_size(mut self, size: u16) -> Self {
        self.size = size;
        self
    }

    pub fn with_placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_offloads(mut self, offloads: QueueOffloads) -> Self {
        self.offloads = offloads;
        self
    }

    pub fn with_max_sgl(mut self, max_sgl: u16) -> Self {
        self.max_sgl = max_sgl;
        self
    }

    pub fn with_fast_free(mut self, on: bool) -> Self {
        self.fast_free = on;
        self
    }

    pub fn with_meta_caching_disabled(mut self, on: bool) -> Self {
        self.disable_meta_caching = on;
        self
    }

    /// Size must be a power of two in `[2, MAX_RING_DESC]`. Ports apply
    /// the stricter `MIN_RING_DESC` floor on top.
    pub fn validate(&self) -> Result<()> {
        let size = self.size as usize;
        if size < 2 || !size.is_power_of_two() || self.size > MAX_RING_DESC {
            return Err(VnicError::InvalidRingSize { size, min: 2, max: MAX_RING_DESC as usize });
        }
        if self.max_sgl == 0 || self.max_sgl as usize > PKT_MAX_BUFS {
            return Err(VnicError::InvalidConfig("max_sgl must be in 1..=PKT_MAX_BUFS"));
        }
        if let PlacementPolicy::Device { max_header_size: 0 } = self.placement {
            return Err(VnicError::InvalidConfig("push header size must be non-zero"));
        }
        Ok(())
    }

    /// Refill when more than this many rx descriptors are free.
    pub fn rx_free_thresh(&self) -> u16 {
        self.rx_free_thresh
            .unwrap_or_else(|| (self.size / REFILL_THRESH_DIVIDER).min(REFILL_THRESH_PACKET))
    }

    /// Clean up before a tx burst when fewer than this many entries are free.
    pub fn tx_free_thresh(&self) -> u16 {
        self.tx_free_thresh.unwrap_or_else(|| {
            (self.size - self.size / REFILL_THRESH_DIVIDER)
                .max(self.size.saturating_sub(REFILL_THRESH_PACKET))
        })
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.size = env_get("VNIC_RING_SIZE", cfg.size);
        cfg.rx_free_thresh = env_get_opt("VNIC_RX_FREE_THRESH");
        cfg.tx_free_thresh = env_get_opt("VNIC_TX_FREE_THRESH");
        cfg.max_sgl = env_get("VNIC_MAX_SGL", cfg.max_sgl);
        if env_get_bool("VNIC_LLQ", false) {
            cfg.placement = PlacementPolicy::Device {
                max_header_size: env_get("VNIC_LLQ_HEADER", DEFAULT_PUSH_HEADER),
            };
        }
        cfg.fast_free = env_get_bool("VNIC_FAST_FREE", cfg.fast_free);
        cfg.disable_meta_caching = env_get_bool("VNIC_NO_META_CACHE", cfg.disable_meta_caching);
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Missing-completion timeout. `None` disables the check.
    pub timeout: Option<Duration>,
    /// Stale slots per scan tolerated before reset. `None` → min(size/2, 256).
    pub threshold: Option<u32>,
    /// Queues scanned per tick.
    pub queue_budget: usize,
    /// Skip queues not cleaned for this long (the application stopped
    /// polling, completions are not the device's fault).
    pub stall_delay: Option<Duration>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_MISS_TXC_TIMEOUT),
            threshold: None,
            queue_budget: DEFAULT_MONITORED_QUEUES,
            stall_delay: None,
        }
    }
}

impl WatchdogConfig {
    pub fn threshold_for(&self, ring_size: u16) -> u32 {
        self.threshold
            .unwrap_or_else(|| ((ring_size / 2) as u32).min(REFILL_THRESH_PACKET as u32))
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let to_ms: u64 = env_get("VNIC_MISS_TXC_TO_MS", DEFAULT_MISS_TXC_TIMEOUT.as_millis() as u64);
        cfg.timeout = (to_ms > 0).then(|| Duration::from_millis(to_ms));
        cfg.threshold = env_get_opt("VNIC_MISS_TXC_THRESH");
        let stall_ms: u64 = env_get("VNIC_STALL_DELAY_MS", 0);
        cfg.stall_delay = (stall_ms > 0).then(|| Duration::from_millis(stall_ms));
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Queue pairs on the port.
    pub num_queues: u16,
    pub max_ring_size: u16,
    /// Template for every ring; `size` is replaced by the per-queue size.
    pub ring: RingConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            num_queues: 1,
            max_ring_size: MAX_RING_DESC,
            ring: RingConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl PortConfig {
    pub fn with_queues(mut self, n: u16) -> Self {
        self.num_queues = n;
        self
    }

    pub fn with_ring(mut self, ring: RingConfig) -> Self {
        self.ring = ring;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_queues == 0 {
            return Err(VnicError::InvalidConfig("port needs at least one queue"));
        }
        let max = self.max_ring_size as usize;
        if !max.is_power_of_two() || self.max_ring_size < MIN_RING_DESC || self.max_ring_size > MAX_RING_DESC {
            return Err(VnicError::InvalidConfig("max_ring_size must be a power of two in MIN..=MAX_RING_DESC"));
        }
        if self.watchdog.queue_budget == 0 {
            return Err(VnicError::InvalidConfig("watchdog queue budget must be non-zero"));
        }
        Ok(())
    }

    pub fn from_env() -> Self {
        Self {
            num_queues: env_get("VNIC_NUM_QUEUES", 1),
            max_ring_size: MAX_RING_DESC,
            ring: RingConfig::from_env(),
            watchdog: WatchdogConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_1024() {
        let cfg = RingConfig::default().with_size(1024);
        assert_eq!(cfg.rx_free_thresh(), 128);
        assert_eq!(cfg.tx_free_thresh(), 896);
        assert_eq!(WatchdogConfig::default().threshold_for(1024), 256);
    }

    #[test]
    fn test_thresholds_small_ring() {
        let cfg = RingConfig::default().with_size(128);
        assert_eq!(cfg.rx_free_thresh(), 16);
        assert_eq!(cfg.tx_free_thresh(), 112);
        assert_eq!(WatchdogConfig::default().threshold_for(128), 64);
    }

    #[test]
    fn test_thresholds_large_ring() {
        let cfg = RingConfig::default().with_size(8192);
        assert_eq!(cfg.rx_free_thresh(), 256);
        // The packet bound (256) wins over the eighth (1024).
        assert_eq!(cfg.tx_free_thresh(), 8192 - 256);
    }

    #[test]
    fn test_validate_size() {
        assert!(RingConfig::default().with_size(1000).validate().is_err());
        assert!(RingConfig::default().with_size(16384).validate().is_err());
        assert!(RingConfig::default().with_size(1).validate().is_err());
        assert!(RingConfig::default().with_size(256).validate().is_ok());
    }

    #[test]
    fn test_validate_push_header() {
        let cfg = RingConfig::default().with_placement(PlacementPolicy::Device { max_header_size: 0 });
        assert!(cfg.validate().is_err());
        let cfg = RingConfig::default().with_placement(PlacementPolicy::Device { max_header_size: 96 });
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.placement.push_header_size(), 96);
    }

    #[test]
    fn test_port_validate() {
        assert!(PortConfig::default().validate().is_ok());
        assert!(PortConfig::default().with_queues(0).validate().is_err());
    }
}
