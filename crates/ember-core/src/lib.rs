//! # EMBER Core
//!
//! Foundational types shared by every layer of the NPU scheduler.
//!
//! This crate is deliberately hardware-agnostic: it knows nothing about
//! partitions, queues or firmware. It provides the vocabulary the other crates
//! speak in.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ember-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │   Handle Arena      │  │
//! │  │  (kinds,    │  │ (DevAddr,   │  │  (generation-       │  │
//! │  │   errno)    │  │  Handle<T>) │  │   checked slots)    │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod arena;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use arena::HandleArena;
pub use error::{Error, ErrorKind, FaultCode, Resource, Result};
pub use types::*;
