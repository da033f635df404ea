//! # vnic-core: Trait definitions and plain types for the vnic datapath
//!
//! This crate defines the seam between the datapath engine and the device.
//! The rings in `vnic-module` are generic over the traits here and never
//! name a concrete device type.
//!
//! | Module    | Contents                                                 |
//! |-----------|----------------------------------------------------------|
//! | `queue`   | `SubmissionQueue`, `CompletionQueue`, `QueueFactory`     |
//! | `desc`    | DMA buffers, request ids, tx/rx contexts                 |
//! | `offload` | Packet offload flags, packet type, queue capabilities    |
//! | `dma`     | Virtual → bus address translation                        |
//! | `clock`   | Monotonic nanosecond time source                         |
//! | `reset`   | Reset reasons and the latched reset signal               |
//! | `stats`   | Per-queue counters                                       |
//! | `config`  | Ring, watchdog and port configuration                    |
//! | `env`     | `VNIC_*` environment overrides                           |
//! | `error`   | Error types                                              |
//!
//! ## Design principle
//!
//! > "Program to the interface. The device is a trait object away."
//!
//! A real device and the in-memory model in `vnic-module::sim_queue`
//! implement the same traits; nothing above this crate can tell them apart.

pub mod desc;
pub mod offload;
pub mod queue;
pub mod dma;
pub mod clock;
pub mod reset;
pub mod stats;
pub mod config;
pub mod env;
pub mod error;
