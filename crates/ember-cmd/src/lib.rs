//! # EMBER Command Submission
//!
//! Everything between "a caller submitted a batch" and "a waiter woke up".
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    EMBER Command Submission                     │
//! │                                                                 │
//! │   submit ──► ┌──────────────┐   Dispatch   ┌──────────────────┐ │
//! │              │ CommandQueue │ ───────────► │    Scheduler     │ │
//! │              │ (per context)│              │ (per partition,  │ │
//! │              └──────┬───────┘              │  4 QoS bands)    │ │
//! │                     │ Retire               └────────┬─────────┘ │
//! │                     ▼                               │ complete  │
//! │              ┌──────────────┐ ◄─────────────────────┘           │
//! │   wait ────► │   Timeline   │                                   │
//! │              │ (per context)│     PartitionAllocator            │
//! │              └──────────────┘     (AIE column ranges)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! None of these types talk to hardware. The device facade owns one of
//! each and carries out what they decide.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod partition;
pub mod qos;
pub mod scheduler;
pub mod timeline;

// Re-exports
pub use command::{
    CommandQueue, ExecBuf, MAX_CMD_HANDLES, MAX_DEPENDENCIES, QueueStats, Released, SubmitType,
    Submission,
};
pub use partition::{Partition, PartitionAllocator};
pub use qos::{PriorityBand, QosInfo};
pub use scheduler::{Decision, Job, PreemptPolicy, SchedStats, Scheduler};
pub use timeline::Timeline;
