//! # Query Records
//!
//! Plain-old-data records exchanged through the query and state
//! interfaces. Layouts are fixed: `#[repr(C)]`, no implicit padding, every
//! size pinned by a static assertion.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use ember_core::{Error, Result};

// =============================================================================
// AIE
// =============================================================================

/// AIE array version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AieVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

/// Per-tile-kind metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AieTileMetadata {
    /// Rows of this tile kind
    pub row_count: u16,
    /// First row of this tile kind
    pub row_start: u16,
    /// DMA channels per tile
    pub dma_channel_count: u16,
    /// Locks per tile
    pub lock_count: u16,
    /// Event registers per tile
    pub event_reg_count: u16,
    /// Reserved
    pub pad: [u16; 3],
}

/// AIE array geometry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AieMetadata {
    /// Bytes of address space per column
    pub col_size: u32,
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
    /// Array version
    pub version: AieVersion,
    /// Core tiles
    pub core: AieTileMetadata,
    /// Memory tiles
    pub mem: AieTileMetadata,
    /// Shim tiles
    pub shim: AieTileMetadata,
}

/// Header of an AIE status reply; raw column status bytes follow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AieStatusHeader {
    /// Status bytes following the header
    pub size: u32,
    /// Columns the status covers
    pub cols_filled: u32,
}

/// AIE memory access; for reads and writes the data follows the record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AieMemAccess {
    /// Column
    pub col: u32,
    /// Row
    pub row: u32,
    /// Tile-local address
    pub addr: u32,
    /// Bytes to transfer
    pub size: u32,
    /// Must be zero; the data is carried inline
    pub buf_p: u64,
}

/// AIE register access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AieRegAccess {
    /// Column
    pub col: u32,
    /// Row
    pub row: u32,
    /// Register address
    pub addr: u32,
    /// Value read or to write
    pub val: u32,
}

// =============================================================================
// CLOCKS, SENSORS, FIRMWARE
// =============================================================================

/// One clock domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ClockRecord {
    /// NUL-padded name
    pub name: [u8; 16],
    /// Frequency in MHz
    pub freq_mhz: u32,
    /// Reserved
    pub pad: u32,
}

impl ClockRecord {
    /// Build a record, truncating the name to 15 bytes
    pub fn new(name: &str, freq_mhz: u32) -> Self {
        let mut rec = Self {
            freq_mhz,
            ..Self::default()
        };
        copy_label(&mut rec.name, name);
        rec
    }
}

/// Clock metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ClockMetadata {
    /// NPU clock
    pub mp_npu_clock: ClockRecord,
    /// H clock
    pub h_clock: ClockRecord,
}

/// Sensor type: power
pub const SENSOR_TYPE_POWER: u8 = 0;

/// One sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SensorRecord {
    /// NUL-padded label
    pub label: [u8; 64],
    /// Current reading
    pub input: u32,
    /// Maximum reading
    pub max: u32,
    /// Average reading
    pub average: u32,
    /// Highest reading
    pub highest: u32,
    /// NUL-padded status text
    pub status: [u8; 64],
    /// NUL-padded unit text
    pub units: [u8; 16],
    /// Unit exponent
    pub unitm: i8,
    /// Sensor type
    pub kind: u8,
    /// Reserved
    pub pad: [u8; 6],
}

impl SensorRecord {
    /// Build a reading with text fields filled in
    pub fn new(label: &str, input: u32, units: &str, unitm: i8, kind: u8) -> Self {
        let mut rec = Self::zeroed();
        copy_label(&mut rec.label, label);
        copy_label(&mut rec.units, units);
        copy_label(&mut rec.status, "present");
        rec.input = input;
        rec.unitm = unitm;
        rec.kind = kind;
        rec
    }
}

/// Firmware version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch level
    pub patch: u32,
    /// Build number
    pub build: u32,
}

// =============================================================================
// STATE RECORDS
// =============================================================================

/// Power mode, numbered as on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PowerMode {
    /// Firmware chooses
    #[default]
    Default = 0,
    /// Low power
    Low     = 1,
    /// Balanced
    Medium  = 2,
    /// High performance
    High    = 3,
    /// Maximum clocks
    Turbo   = 4,
}

impl PowerMode {
    /// Decode a wire value
    pub const fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Default),
            1 => Ok(Self::Low),
            2 => Ok(Self::Medium),
            3 => Ok(Self::High),
            4 => Ok(Self::Turbo),
            _ => Err(Error::InvalidArgument("unknown power mode")),
        }
    }
}

/// Power mode get/set payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PowerModeRecord {
    /// [`PowerMode`] value
    pub power_mode: u8,
    /// Must be zero
    pub pad: [u8; 7],
}

/// Boolean attribute get/set payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AttributeState {
    /// 1 enabled, 0 disabled
    pub state: u8,
    /// Must be zero
    pub pad: [u8; 7],
}

impl AttributeState {
    /// Encode a flag
    pub const fn new(enabled: bool) -> Self {
        Self {
            state: enabled as u8,
            pad: [0; 7],
        }
    }

    /// Decode, rejecting anything but 0 and 1 and non-zero padding
    pub fn enabled(&self) -> Result<bool> {
        if self.pad != [0; 7] {
            return Err(Error::InvalidArgument("non-zero padding"));
        }
        match self.state {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidArgument("attribute state must be 0 or 1")),
        }
    }
}

/// Aggregated resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ResourceInfo {
    /// Maximum NPU clock
    pub npu_clk_max: u64,
    /// Maximum TOPS
    pub npu_tops_max: u64,
    /// Maximum concurrent tasks
    pub npu_task_max: u64,
    /// TOPS requested by live contexts
    pub npu_tops_curr: u64,
    /// Live contexts
    pub npu_task_curr: u64,
}

/// Telemetry reply header; the context map and raw bytes follow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TelemetryHeader {
    /// Firmware telemetry major version
    pub major: u32,
    /// Firmware telemetry minor version
    pub minor: u32,
    /// Query type, set by the caller
    pub kind: u32,
    /// `u32` map entries following the header
    pub map_num_elements: u32,
}

// =============================================================================
// HARDWARE CONTEXT RECORDS
// =============================================================================

/// Context state: no outstanding commands
pub const HWCTX_STATE_IDLE: u32 = 0;
/// Context state: commands outstanding
pub const HWCTX_STATE_ACTIVE: u32 = 1;

/// Hardware context, single-record query layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct HwCtxRecord {
    /// Driver handle
    pub context_id: u32,
    /// First column
    pub start_col: u32,
    /// Column count
    pub num_col: u32,
    /// Reserved
    pub pad: u32,
    /// Creating process
    pub pid: i64,
    /// Submitted commands
    pub command_submissions: u64,
    /// Retired commands
    pub command_completions: u64,
    /// Partition moves
    pub migrations: u64,
    /// Times preempted
    pub preemptions: u64,
    /// Commands that faulted
    pub errors: u64,
}

/// Hardware context, array query layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct HwCtxArrayRecord {
    /// Driver handle
    pub context_id: u32,
    /// First column
    pub start_col: u32,
    /// Column count
    pub num_col: u32,
    /// Firmware context id
    pub hwctx_id: u32,
    /// Creating process
    pub pid: i64,
    /// Submitted commands
    pub command_submissions: u64,
    /// Retired commands
    pub command_completions: u64,
    /// Partition moves
    pub migrations: u64,
    /// Times preempted
    pub preemptions: u64,
    /// Commands that faulted
    pub errors: u64,
    /// Raw QoS priority
    pub priority: u64,
    /// Bytes carved from the bound heap
    pub heap_usage: u64,
    /// Times suspended
    pub suspensions: u64,
    /// [`HWCTX_STATE_IDLE`] or [`HWCTX_STATE_ACTIVE`]
    pub state: u32,
    /// Process address space id
    pub pasid: u32,
    /// QoS giga operations per second
    pub gops: u32,
    /// QoS frames per second
    pub fps: u32,
    /// QoS DMA bandwidth
    pub dma_bandwidth: u32,
    /// QoS latency
    pub latency: u32,
    /// QoS frame execution time
    pub frame_exec_time: u32,
    /// Reserved
    pub pad: u32,
}

// =============================================================================
// CONFIGURATION PAYLOADS
// =============================================================================

/// Header of a CU configuration payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CuConfigHeader {
    /// Entries following the header
    pub num_cus: u16,
    /// Must be zero
    pub pad: [u16; 3],
}

/// One CU configuration entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CuConfigEntry {
    /// Buffer object holding the CU image
    pub cu_bo: u32,
    /// CU function
    pub cu_func: u8,
    /// Must be zero
    pub pad: [u8; 3],
}

/// Debug buffer assignment/removal payload; `UcInfo` entries follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DebugBufferRecord {
    /// Buffer kind
    pub buf_type: u8,
    /// `UcInfo` entries following the record
    pub num_ucs: u8,
    /// Reserved
    pub reserved: [u8; 48],
    /// Reserved
    pub pad: [u8; 6],
    /// Command id used for tracing
    pub command_id: u64,
    /// Buffer object handle
    pub bo_handle: u64,
}

/// Microcontroller share of a debug buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct UcInfo {
    /// Microcontroller index
    pub index: u32,
    /// Bytes given to it
    pub size: u32,
}

const_assert_eq!(core::mem::size_of::<AieMetadata>(), 64);
const_assert_eq!(core::mem::size_of::<AieMemAccess>(), 24);
const_assert_eq!(core::mem::size_of::<ClockMetadata>(), 48);
const_assert_eq!(core::mem::size_of::<SensorRecord>(), 168);
const_assert_eq!(core::mem::size_of::<ResourceInfo>(), 40);
const_assert_eq!(core::mem::size_of::<TelemetryHeader>(), 16);
const_assert_eq!(core::mem::size_of::<HwCtxRecord>(), 64);
const_assert_eq!(core::mem::size_of::<HwCtxArrayRecord>(), 120);
const_assert_eq!(core::mem::size_of::<CuConfigEntry>(), 8);
const_assert_eq!(core::mem::size_of::<DebugBufferRecord>(), 72);

// =============================================================================
// HELPERS
// =============================================================================

fn copy_label(dst: &mut [u8], src: &str) {
    let len = src.len().min(dst.len().saturating_sub(1));
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
}

/// Copy `records` into `buf` back to back
///
/// Nothing is written unless all of them fit.
pub fn write_records<T: Pod>(buf: &mut [u8], records: &[T]) -> Result<usize> {
    let bytes: &[u8] = bytemuck::cast_slice(records);
    if buf.len() < bytes.len() {
        return Err(Error::BufferTooSmall {
            needed: bytes.len(),
        });
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

/// Read a record from the front of an unaligned byte slice
pub fn read_record<T: Pod>(buf: &[u8]) -> Result<T> {
    let size = core::mem::size_of::<T>();
    let bytes = buf.get(..size).ok_or(Error::InvalidArgument("payload too short"))?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_records_all_or_nothing() {
        let recs = [FirmwareVersion { major: 1, minor: 2, patch: 3, build: 4 }];
        let mut small = [0xaau8; 8];
        assert_eq!(
            write_records(&mut small, &recs),
            Err(Error::BufferTooSmall { needed: 16 })
        );
        assert_eq!(small, [0xaa; 8]);

        let mut buf = [0u8; 20];
        assert_eq!(write_records(&mut buf, &recs), Ok(16));
        assert_eq!(read_record::<FirmwareVersion>(&buf).unwrap(), recs[0]);
    }

    #[test]
    fn test_read_record_unaligned() {
        let reg = AieRegAccess { col: 1, row: 2, addr: 0x40, val: 7 };
        let mut buf = vec![0u8; 1 + 16];
        buf[1..].copy_from_slice(bytemuck::bytes_of(&reg));
        assert_eq!(read_record::<AieRegAccess>(&buf[1..]).unwrap(), reg);
        assert!(read_record::<AieRegAccess>(&buf[..8]).is_err());
    }

    #[test]
    fn test_attribute_state_validation() {
        assert_eq!(AttributeState::new(true).enabled(), Ok(true));
        let bad = AttributeState { state: 2, pad: [0; 7] };
        assert!(bad.enabled().is_err());
        let padded = AttributeState { state: 1, pad: [1, 0, 0, 0, 0, 0, 0] };
        assert!(padded.enabled().is_err());
    }

    #[test]
    fn test_labels_are_nul_terminated() {
        let clock = ClockRecord::new("a-very-long-clock-name", 1000);
        assert_eq!(clock.name[15], 0);
        assert_eq!(&clock.name[..4], b"a-ve");
        assert_eq!(PowerMode::from_raw(4), Ok(PowerMode::Turbo));
        assert!(PowerMode::from_raw(5).is_err());
    }
}
