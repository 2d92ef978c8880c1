//! # Telemetry and State Queries
//!
//! Read path over the device's own state plus raw hardware counters, and
//! the handful of writable device attributes.
//!
//! Two query shapes exist:
//!
//! - single-record queries fill a byte buffer with one `#[repr(C)]` reply
//!   (possibly followed by variable data) and return the bytes written;
//! - array queries return up to [`MAX_ARRAY_ELEMENTS`] fixed-size records.
//!
//! Either shape reports `BufferTooSmall { needed }` without writing a byte
//! when the reply does not fit, so callers can ask for the size and retry.

use ember_cmd::PreemptPolicy;
use ember_core::{Error, Result};

use crate::device::Device;
use crate::records::{
    AieMemAccess, AieRegAccess, AieStatusHeader, AttributeState, HwCtxArrayRecord, HwCtxRecord,
    PowerMode, PowerModeRecord, ResourceInfo, TelemetryHeader, read_record, write_records,
};

/// Element cap of array queries
pub const MAX_ARRAY_ELEMENTS: usize = 1024;

// =============================================================================
// PARAMETERS
// =============================================================================

/// Single-record query, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InfoParam {
    /// Raw column status
    AieStatus         = 0,
    /// Array geometry
    AieMetadata       = 1,
    /// Array version
    AieVersion        = 2,
    /// Clock domains
    ClockMetadata     = 3,
    /// Sensor readings
    Sensors           = 4,
    /// Live hardware contexts
    HwContexts        = 5,
    /// Tile memory read
    ReadAieMem        = 6,
    /// Tile register read
    ReadAieReg        = 7,
    /// Firmware version
    FirmwareVersion   = 8,
    /// Power mode
    PowerMode         = 9,
    /// Firmware telemetry
    Telemetry         = 10,
    /// Force preemption enabled
    ForcePreempt      = 11,
    /// Resource usage
    ResourceInfo      = 12,
    /// Frame-boundary preemption enabled
    FramePreempt      = 13,
}

impl InfoParam {
    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::AieStatus,
            1 => Self::AieMetadata,
            2 => Self::AieVersion,
            3 => Self::ClockMetadata,
            4 => Self::Sensors,
            5 => Self::HwContexts,
            6 => Self::ReadAieMem,
            7 => Self::ReadAieReg,
            8 => Self::FirmwareVersion,
            9 => Self::PowerMode,
            10 => Self::Telemetry,
            11 => Self::ForcePreempt,
            12 => Self::ResourceInfo,
            13 => Self::FramePreempt,
            _ => return Err(Error::InvalidArgument("unknown query parameter")),
        })
    }
}

/// Array query, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ArrayParam {
    /// Live hardware contexts
    HwContexts = 0,
}

impl ArrayParam {
    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::HwContexts),
            _ => Err(Error::InvalidArgument("unknown array query parameter")),
        }
    }
}

/// Writable attribute, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StateParam {
    /// Power mode
    PowerMode    = 0,
    /// Tile memory write
    WriteAieMem  = 1,
    /// Tile register write
    WriteAieReg  = 2,
    /// Force preemption
    ForcePreempt = 3,
    /// Frame-boundary preemption
    FramePreempt = 4,
}

impl StateParam {
    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::PowerMode),
            1 => Ok(Self::WriteAieMem),
            2 => Ok(Self::WriteAieReg),
            3 => Ok(Self::ForcePreempt),
            4 => Ok(Self::FramePreempt),
            _ => Err(Error::InvalidArgument("unknown state parameter")),
        }
    }
}

/// Shape of an array reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayReply {
    /// Bytes per element written
    pub element_size: u32,
    /// Elements written, or available for a size query
    pub num_element: u32,
}

// =============================================================================
// HELPERS
// =============================================================================

fn need(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(Error::BufferTooSmall { needed });
    }
    Ok(())
}

fn mem_access(buf: &[u8]) -> Result<(AieMemAccess, usize)> {
    let access: AieMemAccess = read_record(buf)?;
    if access.buf_p != 0 {
        return Err(Error::InvalidArgument("AIE memory data must be inline"));
    }
    if access.size == 0 {
        return Err(Error::InvalidArgument("zero-sized AIE memory access"));
    }
    let header = core::mem::size_of::<AieMemAccess>();
    Ok((access, header + access.size as usize))
}

// =============================================================================
// QUERIES
// =============================================================================

impl Device {
    /// Answer a single-record query into `buf`, returning the bytes written
    ///
    /// `ReadAieMem`, `ReadAieReg` and `Telemetry` read their request record
    /// from the front of `buf` first.
    pub fn get_info(&self, param: InfoParam, buf: &mut [u8]) -> Result<usize> {
        match param {
            InfoParam::AieStatus => {
                let header = core::mem::size_of::<AieStatusHeader>();
                let size = self.hw.aie_status_size();
                need(buf, header + size)?;
                let mut status = vec![0u8; size];
                let cols_filled = self.hw.aie_status(&mut status)?;
                let reply = AieStatusHeader {
                    size: size as u32,
                    cols_filled,
                };
                write_records(buf, &[reply])?;
                buf[header..header + size].copy_from_slice(&status);
                Ok(header + size)
            },
            InfoParam::AieMetadata => write_records(buf, &[self.hw.aie_metadata()]),
            InfoParam::AieVersion => write_records(buf, &[self.hw.aie_metadata().version]),
            InfoParam::ClockMetadata => write_records(buf, &[self.hw.clocks()]),
            InfoParam::Sensors => write_records(buf, &self.hw.sensors()),
            InfoParam::HwContexts => {
                let records: Vec<HwCtxRecord> = self
                    .contexts()
                    .iter()
                    .map(|(handle, ctx)| ctx.record(*handle))
                    .collect();
                write_records(buf, &records)
            },
            InfoParam::ReadAieMem => {
                let (access, needed) = mem_access(buf)?;
                need(buf, needed)?;
                let header = core::mem::size_of::<AieMemAccess>();
                let mut data = vec![0u8; needed - header];
                self.hw.read_aie_mem(access.col, access.row, access.addr, &mut data)?;
                buf[header..needed].copy_from_slice(&data);
                Ok(needed)
            },
            InfoParam::ReadAieReg => {
                let mut access: AieRegAccess = read_record(buf)?;
                access.val = self.hw.read_aie_reg(access.col, access.row, access.addr)?;
                write_records(buf, &[access])
            },
            InfoParam::FirmwareVersion => write_records(buf, &[self.hw.firmware_version()]),
            InfoParam::PowerMode => {
                let reply = PowerModeRecord {
                    power_mode: self.hw.power_mode() as u8,
                    pad: [0; 7],
                };
                write_records(buf, &[reply])
            },
            InfoParam::Telemetry => self.telemetry(buf),
            InfoParam::ForcePreempt => {
                let enabled = self.preempt_policy().contains(PreemptPolicy::FORCE);
                write_records(buf, &[AttributeState::new(enabled)])
            },
            InfoParam::ResourceInfo => {
                let limits = self.hw.resource_limits();
                let contexts = self.contexts();
                let reply = ResourceInfo {
                    npu_clk_max: limits.clk_max,
                    npu_tops_max: limits.tops_max,
                    npu_task_max: limits.task_max,
                    npu_tops_curr: contexts
                        .iter()
                        .map(|(_, ctx)| u64::from(ctx.qos().gops))
                        .sum(),
                    npu_task_curr: contexts.len() as u64,
                };
                write_records(buf, &[reply])
            },
            InfoParam::FramePreempt => {
                let enabled = self.preempt_policy().contains(PreemptPolicy::FRAME_BOUNDARY);
                write_records(buf, &[AttributeState::new(enabled)])
            },
        }
    }

    /// Header, firmware-context map, raw firmware bytes
    fn telemetry(&self, buf: &mut [u8]) -> Result<usize> {
        let request: TelemetryHeader = read_record(buf)?;
        let raw = self.hw.telemetry(request.kind)?;

        let mut map = vec![0u32; raw.context_slots as usize];
        for (handle, ctx) in self.contexts() {
            if let Some(slot) = map.get_mut(ctx.fw_ctx() as usize) {
                *slot = handle.raw();
            }
        }

        let header = core::mem::size_of::<TelemetryHeader>();
        let map_bytes = map.len() * core::mem::size_of::<u32>();
        let needed = header + map_bytes + raw.data.len();
        need(buf, needed)?;

        let reply = TelemetryHeader {
            major: raw.major,
            minor: raw.minor,
            kind: request.kind,
            map_num_elements: map.len() as u32,
        };
        write_records(buf, &[reply])?;
        write_records(&mut buf[header..], &map)?;
        buf[header + map_bytes..needed].copy_from_slice(&raw.data);
        Ok(needed)
    }

    /// Answer an array query
    ///
    /// `element_size == 0` is a size query: nothing is written and the
    /// reply carries the record size and the element count available. Otherwise
    /// `element_size` must be at least the record size, `num_element` at
    /// least the count available (`BufferTooSmall { needed: count }`
    /// otherwise) and `buf` must hold that many records.
    pub fn get_info_array(
        &self,
        param: ArrayParam,
        element_size: u32,
        num_element: u32,
        buf: &mut [u8],
    ) -> Result<ArrayReply> {
        let ArrayParam::HwContexts = param;
        let mut records: Vec<HwCtxArrayRecord> = self
            .contexts()
            .iter()
            .map(|(handle, ctx)| ctx.array_record(*handle))
            .collect();
        records.truncate(MAX_ARRAY_ELEMENTS);

        let record_size = core::mem::size_of::<HwCtxArrayRecord>();
        let reply = ArrayReply {
            element_size: record_size as u32,
            num_element: records.len() as u32,
        };

        if element_size == 0 {
            return Ok(reply);
        }
        if (element_size as usize) < record_size {
            return Err(Error::InvalidArgument("element size smaller than the record"));
        }
        if (num_element as usize) < records.len() {
            log::debug!(
                "ember: array query for {num_element} elements, {} available",
                records.len()
            );
            return Err(Error::BufferTooSmall {
                needed: records.len(),
            });
        }
        if buf.len() < record_size * records.len() {
            return Err(Error::InvalidArgument("buffer shorter than num_element records"));
        }

        write_records(buf, &records)?;
        Ok(reply)
    }

    /// Change a device attribute from a payload
    pub fn set_state(&self, param: StateParam, buf: &[u8]) -> Result<()> {
        match param {
            StateParam::PowerMode => {
                let request: PowerModeRecord = read_record(buf)?;
                if request.pad != [0; 7] {
                    return Err(Error::InvalidArgument("non-zero padding"));
                }
                let mode = PowerMode::from_raw(request.power_mode)?;
                log::info!("ember: power mode {mode:?}");
                self.hw.set_power_mode(mode)
            },
            StateParam::WriteAieMem => {
                let (access, needed) = mem_access(buf)?;
                let data = buf
                    .get(core::mem::size_of::<AieMemAccess>()..needed)
                    .ok_or(Error::InvalidArgument("payload shorter than the access"))?;
                self.hw.write_aie_mem(access.col, access.row, access.addr, data)
            },
            StateParam::WriteAieReg => {
                let access: AieRegAccess = read_record(buf)?;
                self.hw
                    .write_aie_reg(access.col, access.row, access.addr, access.val)
            },
            StateParam::ForcePreempt => {
                let state: AttributeState = read_record(buf)?;
                self.set_preempt_policy(PreemptPolicy::FORCE, state.enabled()?);
                Ok(())
            },
            StateParam::FramePreempt => {
                let state: AttributeState = read_record(buf)?;
                self.set_preempt_policy(PreemptPolicy::FRAME_BOUNDARY, state.enabled()?);
                Ok(())
            },
        }
    }
}
