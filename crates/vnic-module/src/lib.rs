//! # vnic-module: Datapath engine
//!
//! Segment pool, receive and transmit rings, the completion watchdog and
//! an in-memory device model. Everything here is generic over the
//! `vnic-core` queue traits.
//!
//! | Module      | Contents                                              |
//! |-------------|-------------------------------------------------------|
//! | `backing`   | mmap'd, optionally locked memory blocks               |
//! | `pool`      | `SegmentPool` (shared store) + `PoolCache` (per ring)  |
//! | `packet`    | `Packet`: a segment chain with offload metadata       |
//! | `ring`      | Request id bookkeeping (`next_to_use` / `next_to_clean`) |
//! | `rx_ring`   | `RxRing`: post, harvest, refill                       |
//! | `tx_ring`   | `TxRing`: map, submit, reclaim                        |
//! | `watchdog`  | Missing tx completion detection                       |
//! | `sim_queue` | `SimDevice`: queue traits over plain memory           |

pub mod backing;
pub mod pool;
pub mod packet;
pub mod ring;
pub mod rx_ring;
pub mod tx_ring;
pub mod watchdog;
pub mod sim_queue;

pub use packet::Packet;
pub use pool::{PoolCache, PoolConfig, Segment, SegmentPool};
pub use rx_ring::RxRing;
pub use tx_ring::TxRing;
pub use watchdog::Watchdog;
