//! Offload flag sets.
//!
//! `OffloadFlags` travels with a packet: the receive path sets the
//! `RX_*` bits from hardware metadata, the transmit path reads the `TX_*`
//! bits as the caller's offload request. `QueueOffloads` is what a queue
//! was configured to do.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct OffloadFlags: u64 {
        const RX_L3_CKSUM_GOOD    = 1 << 0;
        const RX_L3_CKSUM_BAD     = 1 << 1;
        const RX_L4_CKSUM_GOOD    = 1 << 2;
        const RX_L4_CKSUM_BAD     = 1 << 3;
        const RX_L4_CKSUM_UNKNOWN = 1 << 4;
        const RX_RSS_HASH         = 1 << 5;

        const TX_IPV4             = 1 << 16;
        const TX_IPV6             = 1 << 17;
        const TX_IP_CKSUM         = 1 << 18;
        const TX_UDP_CKSUM        = 1 << 19;
        const TX_TCP_CKSUM        = 1 << 20;
    }
}

impl OffloadFlags {
    /// Transmit bits that mean "the caller asked for an offload".
    pub const TX_OFFLOAD_MASK: Self = Self::TX_IPV4
        .union(Self::TX_IPV6)
        .union(Self::TX_IP_CKSUM)
        .union(Self::TX_UDP_CKSUM)
        .union(Self::TX_TCP_CKSUM);

    pub const RX_MASK: Self = Self::RX_L3_CKSUM_GOOD
        .union(Self::RX_L3_CKSUM_BAD)
        .union(Self::RX_L4_CKSUM_GOOD)
        .union(Self::RX_L4_CKSUM_BAD)
        .union(Self::RX_L4_CKSUM_UNKNOWN)
        .union(Self::RX_RSS_HASH);
}

bitflags! {
    /// Parsed packet type.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct PacketType: u32 {
        const L3_IPV4    = 1 << 0;
        const L3_IPV6    = 1 << 1;
        const L4_TCP     = 1 << 4;
        const L4_UDP     = 1 << 5;
        const L4_FRAG    = 1 << 6;
        const L4_NONFRAG = 1 << 7;
    }
}

bitflags! {
    /// Offloads enabled on a queue.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct QueueOffloads: u32 {
        const RX_CHECKSUM    = 1 << 0;
        const RSS_HASH       = 1 << 1;
        const TX_IPV4_CKSUM  = 1 << 8;
        const TX_UDP_CKSUM   = 1 << 9;
        const TX_TCP_CKSUM   = 1 << 10;
    }
}

impl QueueOffloads {
    pub const TX_CKSUM_MASK: Self = Self::TX_IPV4_CKSUM
        .union(Self::TX_UDP_CKSUM)
        .union(Self::TX_TCP_CKSUM);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_mask_excludes_rx_bits() {
        assert!(!OffloadFlags::TX_OFFLOAD_MASK.intersects(OffloadFlags::RX_MASK));
        assert!(OffloadFlags::TX_OFFLOAD_MASK.contains(OffloadFlags::TX_UDP_CKSUM));
    }

    #[test]
    fn test_queue_tx_cksum_mask() {
        let q = QueueOffloads::RX_CHECKSUM | QueueOffloads::RSS_HASH;
        assert!(!q.intersects(QueueOffloads::TX_CKSUM_MASK));
        assert!(QueueOffloads::all().intersects(QueueOffloads::TX_CKSUM_MASK));
    }
}
