//! # EMBER
//!
//! Device facade of the NPU scheduler: hardware contexts, telemetry and the
//! request interface, over the memory and command crates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Device                               │
//! │                                                                 │
//! │  uapi::dispatch ──► create / configure / exec / wait / destroy  │
//! │        │                       │                                │
//! │        ▼                       ▼                                │
//! │  ┌─────────────┐   ┌─────────────────────┐   ┌───────────────┐  │
//! │  │  telemetry  │   │ HwContext table     │   │  BoRegistry   │  │
//! │  │ (GetInfo,   │   │ (queue, timeline,   │   │  (ember-mem)  │  │
//! │  │  SetState)  │   │  CUs, bindings)     │   │               │  │
//! │  └─────────────┘   └─────────┬───────────┘   └───────────────┘  │
//! │                              │                                  │
//! │               PartitionAllocator + Scheduler (ember-cmd)        │
//! │                              │                                  │
//! └──────────────────────────────┼──────────────────────────────────┘
//!                                ▼
//!                  NpuHardware (firmware, or SimNpu)
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use ember::{ContextDesc, Device, DeviceConfig, SimNpu, Submit};
//! use ember_mem::{BoDesc, BoType, HostMemory};
//!
//! let npu = Arc::new(SimNpu::new(4, 6, 4));
//! let dev = Device::new(DeviceConfig::default(), npu, Arc::new(HostMemory::new()));
//!
//! let heap = dev.create_bo(&BoDesc::new(BoType::DevHeap, 1 << 20)).unwrap();
//! let ctx = dev.create_context(&ContextDesc::new(heap, 0x200)).unwrap().handle;
//! let seq = dev.exec(ctx, Submit::Signal).unwrap();
//! dev.wait(ctx, seq, None).unwrap();
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod hw;
pub mod hwctx;
pub mod records;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod telemetry;
pub mod uapi;

// Re-exports
pub use config::DeviceConfig;
pub use device::{Device, Submit};
pub use hw::{FwContextRequest, FwCu, HwJob, NpuHardware, ResourceLimits, Telemetry};
pub use hwctx::{
    ContextCounters, ContextCreated, ContextDesc, ContextHints, ContextParam, ContextState,
    CuConfig, DebugBufKind, HwContext, MAX_CUS,
};
#[cfg(any(test, feature = "sim"))]
pub use sim::SimNpu;
pub use telemetry::{ArrayParam, ArrayReply, InfoParam, MAX_ARRAY_ELEMENTS, StateParam};
pub use uapi::{Ext, Opcode, Request, Response};

static_assertions::assert_impl_all!(Device: Send, Sync);
