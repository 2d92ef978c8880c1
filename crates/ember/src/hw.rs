//! # Hardware Collaborator
//!
//! The firmware/device side of the scheduler. Everything the device facade
//! asks of real silicon goes through [`NpuHardware`].
//!
//! Implementations must not call back into the [`Device`](crate::Device)
//! from inside a trait method. Completions arrive later, from whatever
//! context services the device interrupt, through
//! [`Device::complete`](crate::Device::complete).

use core::fmt;

use ember_cmd::{Partition, QosInfo};
use ember_core::{ContextHandle, DevAddr, Result};

use crate::records::{AieMetadata, ClockMetadata, FirmwareVersion, PowerMode, SensorRecord};

// =============================================================================
// REQUESTS
// =============================================================================

/// Firmware context creation request
#[derive(Debug, Clone, Copy)]
pub struct FwContextRequest {
    /// Columns reserved for the context
    pub partition: Partition,
    /// Requested QoS
    pub qos: QosInfo,
    /// Device address of the bound heap
    pub heap_addr: DevAddr,
    /// Heap size in bytes
    pub heap_size: u64,
    /// Maximum opcode hint
    pub max_opc: u32,
    /// Memory size hint
    pub mem_size: u32,
}

/// Compute unit as handed to firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwCu {
    /// Device address of the CU image
    pub image: DevAddr,
    /// CU function
    pub func: u8,
}

/// A job started on a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwJob {
    /// Driver context
    pub ctx: ContextHandle,
    /// Firmware context
    pub fw_ctx: u32,
    /// Sequence number to report back on completion
    pub seq: u64,
    /// Partition the job runs on
    pub partition: Partition,
    /// Command buffer addresses in execution order
    pub cmds: Vec<DevAddr>,
    /// Argument buffer addresses
    pub args: Vec<DevAddr>,
}

/// Raw firmware telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// Interface major version
    pub major: u32,
    /// Interface minor version
    pub minor: u32,
    /// Firmware context slots the map must cover
    pub context_slots: u32,
    /// Opaque firmware bytes
    pub data: Vec<u8>,
}

/// Static hardware limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum NPU clock in MHz
    pub clk_max: u64,
    /// Maximum TOPS
    pub tops_max: u64,
    /// Maximum concurrent tasks
    pub task_max: u64,
}

// =============================================================================
// TRAIT
// =============================================================================

/// NPU firmware and device access
pub trait NpuHardware: Send + Sync + fmt::Debug {
    /// Instantiate a firmware context, returning its firmware id
    fn create_context(&self, req: &FwContextRequest) -> Result<u32>;

    /// Tear down a firmware context
    fn destroy_context(&self, fw_ctx: u32) -> Result<()>;

    /// Load the compute units of a context
    fn configure_cus(&self, fw_ctx: u32, cus: &[FwCu]) -> Result<()>;

    /// Start a job; the partition is idle when this is called
    fn submit(&self, job: &HwJob) -> Result<()>;

    /// Stop the job `seq` of `fw_ctx`; returns once it no longer runs
    fn preempt(&self, fw_ctx: u32, seq: u64) -> Result<()>;

    /// Array geometry
    fn aie_metadata(&self) -> AieMetadata;

    /// Bytes of raw column status
    fn aie_status_size(&self) -> usize;

    /// Fill `out` with raw column status, returning the columns covered
    fn aie_status(&self, out: &mut [u8]) -> Result<u32>;

    /// Read tile memory
    fn read_aie_mem(&self, col: u32, row: u32, addr: u32, out: &mut [u8]) -> Result<()>;

    /// Write tile memory
    fn write_aie_mem(&self, col: u32, row: u32, addr: u32, data: &[u8]) -> Result<()>;

    /// Read a tile register
    fn read_aie_reg(&self, col: u32, row: u32, addr: u32) -> Result<u32>;

    /// Write a tile register
    fn write_aie_reg(&self, col: u32, row: u32, addr: u32, val: u32) -> Result<()>;

    /// Clock domains
    fn clocks(&self) -> ClockMetadata;

    /// Sensor readings
    fn sensors(&self) -> Vec<SensorRecord>;

    /// Running firmware version
    fn firmware_version(&self) -> FirmwareVersion;

    /// Current power mode
    fn power_mode(&self) -> PowerMode;

    /// Change the power mode
    fn set_power_mode(&self, mode: PowerMode) -> Result<()>;

    /// Harvest firmware telemetry of the given type
    fn telemetry(&self, kind: u32) -> Result<Telemetry>;

    /// Static limits
    fn resource_limits(&self) -> ResourceLimits;
}
