//! Transmit on one queue, feed the frames the device saw back into a
//! receive queue, and check bytes, offload flags and segment accounting.

use std::collections::VecDeque;

use vnic_core::config::{PlacementPolicy, PortConfig, RingConfig};
use vnic_core::desc::{Direction, L3Proto, L4Proto, RxContext};
use vnic_core::offload::{OffloadFlags, PacketType};
use vnic_module::sim_queue::SimDevice;
use vnic_module::{PoolConfig, SegmentPool};
use vnic_port::Port;

fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn started_port(dev: &SimDevice, pool: &SegmentPool, ring: RingConfig) -> Port<SimDevice> {
    let cfg = PortConfig::default().with_queues(2).with_ring(ring);
    let mut port = Port::new(0, dev.clone(), cfg).unwrap();
    port.configure_tx_ring(0, 256, -1, pool).unwrap();
    port.configure_rx_ring(0, 256, -1, pool).unwrap();
    port.start_ring(Direction::Tx, 0).unwrap();
    port.start_ring(Direction::Rx, 0).unwrap();
    port
}

fn loopback(port: &mut Port<SimDevice>, dev: &SimDevice, rx_meta: RxContext) -> usize {
    let tx_hw = port.hw_queue(Direction::Tx, 0).unwrap();
    let rx_hw = port.hw_queue(Direction::Rx, 0).unwrap();
    let sent = dev.take_sent(tx_hw);
    for f in &sent {
        dev.deliver(rx_hw, &f.data, rx_meta).unwrap();
    }
    dev.complete_tx(tx_hw, sent.len());
    sent.len()
}

#[test]
fn test_loopback_bytes_survive() {
    let dev = SimDevice::new();
    let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 2048)).unwrap();
    let mut port = started_port(&dev, &pool, RingConfig::default());
    let mut app = pool.cache(64);

    let sizes = [60usize, 1500, 2048, 2049, 5000, 9000];
    let frames: Vec<Vec<u8>> = sizes.iter().enumerate().map(|(i, &n)| frame(n, i as u8)).collect();
    let mut q: VecDeque<_> = frames.iter().map(|f| app.packet_from_bytes(f).unwrap()).collect();

    assert_eq!(port.tx_burst(0, &mut q).unwrap(), sizes.len());
    assert_eq!(loopback(&mut port, &dev, RxContext::default()), sizes.len());

    let mut out = Vec::new();
    assert_eq!(port.rx_burst(0, &mut out, 32).unwrap(), sizes.len());
    for (pkt, want) in out.iter().zip(&frames) {
        assert_eq!(pkt.pkt_len() as usize, want.len());
        assert_eq!(&pkt.to_vec(&pool), want);
    }
    app.free_packets(out).unwrap();

    assert_eq!(port.tx_cleanup(0, 0).unwrap(), sizes.len());
    let tx = port.stats(Direction::Tx, 0).unwrap();
    let rx = port.stats(Direction::Rx, 0).unwrap();
    assert_eq!(tx.packets, sizes.len() as u64);
    assert_eq!(rx.packets, sizes.len() as u64);
    assert_eq!(tx.bytes, rx.bytes);
    assert!(port.reset_reason().is_none());
}

#[test]
fn test_loopback_push_mode() {
    let dev = SimDevice::new();
    let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 2048)).unwrap();
    let ring = RingConfig::default().with_placement(PlacementPolicy::Device { max_header_size: 96 });
    let mut port = started_port(&dev, &pool, ring);
    let mut app = pool.cache(64);

    let data = frame(4000, 7);
    let mut q = VecDeque::from(vec![app.packet_from_bytes(&data).unwrap(), app.packet_from_bytes(&data[..40]).unwrap()]);
    assert_eq!(port.tx_burst(0, &mut q).unwrap(), 2);
    loopback(&mut port, &dev, RxContext::default());

    let mut out = Vec::new();
    port.rx_burst(0, &mut out, 8).unwrap();
    assert_eq!(out[0].to_vec(&pool), data);
    assert_eq!(out[1].to_vec(&pool), data[..40].to_vec());
    app.free_packets(out).unwrap();
}

#[test]
fn test_checksum_offload_round_trip() {
    let dev = SimDevice::new();
    let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 1024)).unwrap();
    let mut port = started_port(&dev, &pool, RingConfig::default());
    let mut app = pool.cache(16);

    let mut pkt = app.packet_from_bytes(&frame(128, 1)).unwrap();
    pkt.set_tx_offload(OffloadFlags::TX_IPV4 | OffloadFlags::TX_IP_CKSUM | OffloadFlags::TX_UDP_CKSUM, 14, 20, 8);
    pkt.packet_type = PacketType::L3_IPV4 | PacketType::L4_UDP | PacketType::L4_NONFRAG;
    let mut q = VecDeque::from(vec![pkt]);
    port.tx_burst(0, &mut q).unwrap();

    let tx_hw = port.hw_queue(Direction::Tx, 0).unwrap();
    let rx_hw = port.hw_queue(Direction::Rx, 0).unwrap();
    let sent = dev.take_sent(tx_hw);
    assert!(sent[0].l3_csum_enable && sent[0].l4_csum_enable && sent[0].df);

    // The device verified what the driver asked it to compute.
    let meta = RxContext {
        l3_proto: sent[0].l3_proto,
        l4_proto: sent[0].l4_proto,
        l4_csum_checked: true,
        ..RxContext::default()
    };
    assert_eq!(meta.l3_proto, L3Proto::Ipv4);
    assert_eq!(meta.l4_proto, L4Proto::Udp);
    dev.deliver(rx_hw, &sent[0].data, meta).unwrap();

    let mut out = Vec::new();
    port.rx_burst(0, &mut out, 1).unwrap();
    let flags = out[0].ol_flags;
    assert!(flags.contains(OffloadFlags::RX_L3_CKSUM_GOOD | OffloadFlags::RX_L4_CKSUM_GOOD));
    assert!(out[0].packet_type.contains(PacketType::L3_IPV4 | PacketType::L4_UDP | PacketType::L4_NONFRAG));
    app.free_packets(out).unwrap();
}

#[test]
fn test_teardown_returns_every_segment() {
    let dev = SimDevice::new();
    let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 1024)).unwrap();
    {
        let mut port = started_port(&dev, &pool, RingConfig::default());
        let mut app = pool.cache(16);
        let mut q: VecDeque<_> = (0..20).map(|i| app.packet_from_bytes(&frame(3000, i)).unwrap()).collect();
        port.tx_burst(0, &mut q).unwrap();
        // Half completed, half still in flight when the queue stops.
        let tx_hw = port.hw_queue(Direction::Tx, 0).unwrap();
        dev.complete_tx(tx_hw, 10);

        port.stop_ring(Direction::Tx, 0).unwrap();
        port.stop_ring(Direction::Rx, 0).unwrap();
        assert_eq!(dev.queue_count(), 0);
        assert_eq!(pool.outstanding(), 0);
    }
    pool.destroy().unwrap();
}

#[test]
fn test_port_drop_stops_queues() {
    let dev = SimDevice::new();
    let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 1024)).unwrap();
    let port = started_port(&dev, &pool, RingConfig::default());
    assert_eq!(dev.queue_count(), 2);
    assert_eq!(pool.outstanding(), 255);
    drop(port);
    assert_eq!(dev.queue_count(), 0);
    assert_eq!(pool.outstanding(), 0);
}
