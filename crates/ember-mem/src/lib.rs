//! # EMBER Memory Management
//!
//! Buffer objects, device heaps and the device virtual address space.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      EMBER Memory System                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                    Buffer Object Registry                 │  │
//! │  │        (handle arena → Arc<BufferObject>, user counts)    │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │            │                                   │                │
//! │  ┌─────────┴─────────┐              ┌──────────┴───────────┐    │
//! │  │  Device VA Space  │              │   DevHeap Carve-out  │    │
//! │  │ (Share/Cmd/Dma/   │              │   (Dev sub-allocs,   │    │
//! │  │     DevHeap)      │              │    first-fit)        │    │
//! │  └───────────────────┘              └──────────────────────┘    │
//! │            │                                                    │
//! │  ┌─────────┴─────────────────────────────────────────────────┐  │
//! │  │         MemoryManager collaborator (pin / sync)           │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifetime Rules
//!
//! - A `Dev` object holds its `DevHeap` alive; the heap's range is returned
//!   by whichever of them is dropped last.
//! - A [`BoRef`] is a *use* of an object by a context or an in-flight
//!   command. An object with uses cannot be destroyed.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bo;
pub mod mm;
pub mod range;
pub mod registry;

// Re-exports
pub use bo::{BoDesc, BoInfo, BoType, BufferObject, SyncDirection, VaEntry};
pub use mm::{HostMemory, MemoryManager, SyncRegion};
pub use range::{RangeAllocator, VaRange};
pub use registry::{BoRef, BoRegistry, RegistryConfig, RegistryStats};
