//! vnic End-to-End Smoke Test
//!
//! Drives the whole datapath against the in-memory device:
//!   Part A Segment pool: bulk alloc/free, caches, conservation
//!   Part B Port setup: configure, start, validation errors
//!   Part C Loopback: tx → device → rx, multi-segment, push mode, offloads
//!   Part D Failure paths: bad completion id, missing completions
//!   Part E Teardown: stop, pool destroy
//!
//! Run: RUST_LOG=vnic=debug ./target/release/vnic-smoke
//! Ring and watchdog settings honour the VNIC_* environment overrides.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use vnic_core::clock::ManualClock;
use vnic_core::config::{PlacementPolicy, PortConfig, RingConfig, WatchdogConfig};
use vnic_core::desc::{Direction, RxContext, L3Proto, L4Proto};
use vnic_core::error::VnicError;
use vnic_core::offload::{OffloadFlags, PacketType};
use vnic_core::reset::ResetReason;
use vnic_module::sim_queue::SimDevice;
use vnic_module::{PoolConfig, SegmentPool};
use vnic_port::{Port, PortRegistry};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8) ^ seed).collect()
}

// ════════════════════════════════════════════════════════════
// Part A: Segment pool
// ════════════════════════════════════════════════════════════

fn test_pool(t: &mut TestRunner) -> anyhow::Result<()> {
    t.section("Part A: Segment pool");

    let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 1024)).context("pool create")?;
    t.check("pool: 1024 x 2048 created", pool.capacity() == 1024, &format!("{}", pool.capacity()));

    let mut cache = pool.cache(64);
    let mut segs = Vec::new();
    let ok = cache.alloc_bulk(&mut segs, 256).is_ok();
    t.check("alloc_bulk(256)", ok && segs.len() == 256, &format!("got {}", segs.len()));
    t.check("outstanding == 256", pool.outstanding() == 256, &format!("{}", pool.outstanding()));

    let mut more = Vec::new();
    let err = cache.alloc_bulk(&mut more, 1000);
    t.check("alloc_bulk(1000) all-or-nothing", err.is_err() && more.is_empty(), &format!("{:?}", err));

    cache.free_bulk(segs.drain(..)).context("free_bulk")?;
    cache.flush();
    t.check("free_bulk + flush: outstanding == 0", pool.outstanding() == 0, &format!("{}", pool.outstanding()));

    let pkt = cache.packet_from_bytes(&frame(5000, 3)).context("packet_from_bytes")?;
    t.check("5000-byte packet spans 3 segments", pkt.nb_segs() == 3, &format!("{}", pkt.nb_segs()));
    let same = pkt.to_vec(&pool) == frame(5000, 3);
    cache.free_packet(pkt).context("free_packet")?;
    t.check("packet bytes intact", same, "mismatch");

    drop(cache);
    let destroyed = pool.destroy();
    t.check("destroy idle pool", destroyed.is_ok(), &format!("{:?}", destroyed.err()));
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part B: Port setup
// ════════════════════════════════════════════════════════════

fn test_setup(t: &mut TestRunner, dev: &SimDevice, pool: &SegmentPool) -> anyhow::Result<Port<SimDevice>> {
    t.section("Part B: Port setup");

    let cfg = PortConfig::from_env().with_queues(2);
    let ring_size = cfg.ring.size;
    let mut port = Port::new(0, dev.clone(), cfg).context("port create")?;

    let bad = port.configure_rx_ring(0, 100, -1, pool);
    t.check("configure size 100 rejected", matches!(bad, Err(VnicError::InvalidRingSize { .. })), &format!("{:?}", bad));

    port.configure_tx_ring(0, ring_size, -1, pool).context("configure tx 0")?;
    port.configure_rx_ring(0, ring_size, -1, pool).context("configure rx 0")?;
    t.pass(&format!("configure tx/rx 0 (size {})", ring_size));

    let twice = port.configure_tx_ring(0, ring_size, -1, pool);
    t.check("configure twice rejected", matches!(twice, Err(VnicError::AlreadyConfigured(0))), &format!("{:?}", twice));

    port.start_ring(Direction::Tx, 0).context("start tx 0")?;
    port.start_ring(Direction::Rx, 0).context("start rx 0")?;
    let rx_hw = port.hw_queue(Direction::Rx, 0).unwrap_or(u16::MAX);
    let posted = dev.posted_rx(rx_hw);
    t.check(
        &format!("rx populated with {} buffers", ring_size - 1),
        posted == ring_size as usize - 1,
        &format!("posted {}", posted),
    );
    Ok(port)
}

// ════════════════════════════════════════════════════════════
// Part C: Loopback
// ════════════════════════════════════════════════════════════

fn loop_frames(port: &mut Port<SimDevice>, dev: &SimDevice, meta: RxContext) -> usize {
    let (tx_hw, rx_hw) = match (port.hw_queue(Direction::Tx, 0), port.hw_queue(Direction::Rx, 0)) {
        (Some(tx), Some(rx)) => (tx, rx),
        _ => return 0,
    };
    let sent = dev.take_sent(tx_hw);
    let mut delivered = 0;
    for f in &sent {
        if dev.deliver(rx_hw, &f.data, meta).is_ok() {
            delivered += 1;
        }
    }
    dev.complete_tx(tx_hw, sent.len());
    delivered
}

fn test_loopback(t: &mut TestRunner, port: &mut Port<SimDevice>, dev: &SimDevice, pool: &SegmentPool) -> anyhow::Result<()> {
    t.section("Part C: Loopback datapath");

    let mut app = pool.cache(64);
    let sizes = [64usize, 1500, 2048, 4000, 9000];
    let frames: Vec<_> = sizes.iter().enumerate().map(|(i, &n)| frame(n, i as u8)).collect();
    let mut q = VecDeque::new();
    for f in &frames {
        q.push_back(app.packet_from_bytes(f)?);
    }

    let sent = port.tx_burst(0, &mut q)?;
    t.check(&format!("tx_burst {} packets", sizes.len()), sent == sizes.len(), &format!("sent {}", sent));
    let looped = loop_frames(port, dev, RxContext::default());
    t.check("device loops every frame", looped == sizes.len(), &format!("{}", looped));

    let mut out = Vec::new();
    let got = port.rx_burst(0, &mut out, 32)?;
    t.check("rx_burst receives all", got == sizes.len(), &format!("got {}", got));
    let intact = out.iter().zip(&frames).all(|(p, f)| &p.to_vec(pool) == f);
    t.check("payloads intact (multi-segment)", intact, "byte mismatch");
    app.free_packets(out.drain(..)).context("free_packets")?;

    let cleaned = port.tx_cleanup(0, 0)?;
    t.check("tx_cleanup reclaims all", cleaned == sizes.len(), &format!("{}", cleaned));

    // Checksum offload request → device → receive flags.
    let mut pkt = app.packet_from_bytes(&frame(200, 9))?;
    pkt.set_tx_offload(OffloadFlags::TX_IPV4 | OffloadFlags::TX_IP_CKSUM | OffloadFlags::TX_UDP_CKSUM, 14, 20, 8);
    pkt.packet_type = PacketType::L3_IPV4 | PacketType::L4_UDP | PacketType::L4_NONFRAG;
    q.push_back(pkt);
    port.tx_burst(0, &mut q)?;
    let meta = RxContext {
        l3_proto: L3Proto::Ipv4,
        l4_proto: L4Proto::Udp,
        l4_csum_checked: true,
        ..RxContext::default()
    };
    loop_frames(port, dev, meta);
    port.rx_burst(0, &mut out, 1)?;
    let good = out
        .first()
        .map(|p| p.ol_flags.contains(OffloadFlags::RX_L3_CKSUM_GOOD | OffloadFlags::RX_L4_CKSUM_GOOD))
        .unwrap_or(false);
    t.check("ipv4/udp checksum flags good", good, &format!("{:?}", out.first().map(|p| p.ol_flags)));
    app.free_packets(out.drain(..)).context("free_packets")?;
    port.tx_cleanup(0, 0)?;

    let tx = port.stats(Direction::Tx, 0).unwrap_or_default();
    let rx = port.stats(Direction::Rx, 0).unwrap_or_default();
    t.check("tx bytes == rx bytes", tx.bytes == rx.bytes, &format!("tx {} rx {}", tx.bytes, rx.bytes));
    Ok(())
}

fn test_push_mode(t: &mut TestRunner, pool: &SegmentPool) -> anyhow::Result<()> {
    let dev = SimDevice::new();
    let ring = RingConfig::default().with_placement(PlacementPolicy::Device { max_header_size: 96 });
    let mut port = Port::new(1, dev.clone(), PortConfig::default().with_ring(ring))?;
    port.configure_tx_ring(0, 256, -1, pool)?;
    port.start_ring(Direction::Tx, 0)?;

    let mut app = pool.cache(16);
    let data = frame(3000, 5);
    let mut q = VecDeque::from(vec![app.packet_from_bytes(&data)?]);
    port.tx_burst(0, &mut q)?;
    let sent = port.hw_queue(Direction::Tx, 0).map(|id| dev.take_sent(id)).unwrap_or_default();
    let ok = sent.first().map(|f| f.header.len() == 96 && f.data == data).unwrap_or(false);
    t.check("push mode: 96-byte inline header", ok, &format!("{:?}", sent.first().map(|f| f.header.len())));
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part D: Failure paths
// ════════════════════════════════════════════════════════════

fn test_failures(t: &mut TestRunner, pool: &SegmentPool) -> anyhow::Result<()> {
    t.section("Part D: Failure paths");

    // Completion for a request never issued.
    let dev = SimDevice::new();
    let mut port = Port::new(2, dev.clone(), PortConfig::default())?;
    port.configure_tx_ring(0, 128, -1, pool)?;
    port.start_ring(Direction::Tx, 0)?;
    if let Some(id) = port.hw_queue(Direction::Tx, 0) {
        dev.inject_tx_completion(id, 77);
    }
    let r = port.tx_cleanup(0, 0);
    t.check(
        "bogus tx completion -> reset InvalidTxReqId",
        matches!(r, Err(VnicError::Reset(ResetReason::InvalidTxReqId))),
        &format!("{:?}", r),
    );

    // Missing completions through the watchdog.
    let dev = SimDevice::new();
    let clock = ManualClock::new(1);
    let cfg = PortConfig::default().with_watchdog(WatchdogConfig {
        timeout: Some(Duration::from_millis(5)),
        threshold: Some(1),
        ..WatchdogConfig::default()
    });
    let mut port = Port::with_clock(3, dev, cfg, Arc::new(clock.clone()))?;
    port.configure_tx_ring(0, 128, -1, pool)?;
    port.start_ring(Direction::Tx, 0)?;
    let mut app = pool.cache(8);
    let mut q = VecDeque::from(vec![app.packet_from_bytes(&[0u8; 60])?]);
    port.tx_burst(0, &mut q)?;

    clock.advance(10_000_000);
    let first = port.watchdog_tick();
    t.check("one stale slot: counted, no reset", matches!(first, Ok(1)), &format!("{:?}", first));
    let second = port.watchdog_tick();
    let missing = port.stats(Direction::Tx, 0).map(|s| s.missing_tx).unwrap_or(0);
    t.check("second scan counts again", matches!(second, Ok(1)) && missing == 2, &format!("{:?} missing {}", second, missing));

    let mut q = VecDeque::from(vec![app.packet_from_bytes(&[0u8; 60])?]);
    port.tx_burst(0, &mut q)?;
    clock.advance(10_000_000);
    let third = port.watchdog_tick();
    t.check(
        "above threshold -> reset MissingTxCompletion",
        matches!(third, Err(VnicError::Reset(ResetReason::MissingTxCompletion))),
        &format!("{:?}", third),
    );
    Ok(())
}

// ════════════════════════════════════════════════════════════
// Part E: Teardown
// ════════════════════════════════════════════════════════════

fn test_teardown(t: &mut TestRunner, mut reg: PortRegistry<SimDevice>, dev: &SimDevice, pool: SegmentPool) {
    t.section("Part E: Teardown");

    if let Some(port) = reg.get_mut(0) {
        let tx = port.stop_ring(Direction::Tx, 0);
        let rx = port.stop_ring(Direction::Rx, 0);
        t.check("stop tx/rx 0", tx.is_ok() && rx.is_ok(), &format!("{:?} {:?}", tx, rx));
    }
    t.check("device queues destroyed", dev.queue_count() == 0, &format!("{}", dev.queue_count()));

    drop(reg.unregister(0));
    t.check("registry empty", reg.is_empty(), &format!("{}", reg.len()));
    t.check("pool outstanding == 0", pool.outstanding() == 0, &format!("{}", pool.outstanding()));
    let destroyed = pool.destroy();
    t.check("pool destroy", destroyed.is_ok(), &format!("{:?}", destroyed.err()));
}

// ════════════════════════════════════════════════════════════

fn run(t: &mut TestRunner) -> anyhow::Result<()> {
    test_pool(t)?;

    let dev = SimDevice::new();
    let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 8192)).context("datapath pool")?;
    let mut reg = PortRegistry::new();
    let port = test_setup(t, &dev, &pool)?;
    reg.register(port)?;

    if let Some(port) = reg.get_mut(0) {
        test_loopback(t, port, &dev, &pool)?;
    }
    {
        let side = SegmentPool::with_identity(&PoolConfig::new(2048, 1024)).context("side pool")?;
        test_push_mode(t, &side)?;
        test_failures(t, &side)?;
    }

    test_teardown(t, reg, &dev, pool);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("=== vnic End-to-End Smoke Test ===");
    let mut t = TestRunner::new();

    if let Err(e) = run(&mut t) {
        println!("\nFATAL: {:#}", e);
        t.summary();
        std::process::exit(1);
    }

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
