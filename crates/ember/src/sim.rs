//! # Simulated NPU
//!
//! In-process [`NpuHardware`] for tests and host bring-up. Jobs are only
//! recorded; the test drives completion through
//! [`Device::complete`](crate::Device::complete).

use std::collections::BTreeMap;

use ember_core::{Error, FaultCode, Resource, Result};

use crate::hw::{FwContextRequest, FwCu, HwJob, NpuHardware, ResourceLimits, Telemetry};
use crate::records::{
    AieMetadata, AieTileMetadata, AieVersion, ClockMetadata, ClockRecord, FirmwareVersion,
    PowerMode, SENSOR_TYPE_POWER, SensorRecord,
};

/// Bytes of data memory per simulated tile
pub const TILE_MEM_SIZE: u32 = 0x1_0000;

/// Bytes of status per column
const STATUS_BYTES_PER_COL: usize = 8;

#[derive(Debug, Default)]
struct SimState {
    fw_slots: Vec<bool>,
    cus: BTreeMap<u32, Vec<FwCu>>,
    submitted: Vec<HwJob>,
    running: Vec<HwJob>,
    preempted: Vec<(u32, u64)>,
    tile_mem: BTreeMap<(u32, u32), Vec<u8>>,
    regs: BTreeMap<(u32, u32, u32), u32>,
    power: PowerMode,
    fail_create: bool,
    fail_submit: bool,
    fail_preempt: bool,
    fail_status: bool,
    hold_configure: bool,
    configure_held: bool,
}

/// Simulated NPU
#[derive(Debug)]
pub struct SimNpu {
    columns: u32,
    rows: u32,
    state: spin::Mutex<SimState>,
}

impl SimNpu {
    /// Create an array of `columns` x `rows` tiles with `fw_contexts`
    /// firmware context slots
    pub fn new(columns: u32, rows: u32, fw_contexts: usize) -> Self {
        Self {
            columns,
            rows,
            state: spin::Mutex::new(SimState {
                fw_slots: vec![false; fw_contexts],
                ..SimState::default()
            }),
        }
    }

    /// Fail the next firmware context creation
    pub fn fail_next_create(&self) {
        self.state.lock().fail_create = true;
    }

    /// Fail the next job submission
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_submit = true;
    }

    /// Fail the next preemption
    pub fn fail_next_preempt(&self) {
        self.state.lock().fail_preempt = true;
    }

    /// Abort the next status read after the first column was copied out
    pub fn fail_next_status(&self) {
        self.state.lock().fail_status = true;
    }

    /// Park the next CU configuration until
    /// [`release_configure`](Self::release_configure)
    pub fn hold_next_configure(&self) {
        self.state.lock().hold_configure = true;
    }

    /// Check whether a CU configuration is parked
    pub fn configure_held(&self) -> bool {
        self.state.lock().configure_held
    }

    /// Let a parked CU configuration finish
    pub fn release_configure(&self) {
        self.state.lock().configure_held = false;
    }

    /// Every job ever started, in start order
    pub fn submitted(&self) -> Vec<HwJob> {
        self.state.lock().submitted.clone()
    }

    /// Jobs started and neither preempted nor retired through
    /// [`retire`](Self::retire)
    pub fn running(&self) -> Vec<HwJob> {
        self.state.lock().running.clone()
    }

    /// Forget a running job once its completion was reported
    pub fn retire(&self, fw_ctx: u32, seq: u64) {
        self.state
            .lock()
            .running
            .retain(|job| !(job.fw_ctx == fw_ctx && job.seq == seq));
    }

    /// Preemptions carried out, as `(fw_ctx, seq)`
    pub fn preempted(&self) -> Vec<(u32, u64)> {
        self.state.lock().preempted.clone()
    }

    /// Live firmware contexts
    pub fn live_contexts(&self) -> usize {
        self.state.lock().fw_slots.iter().filter(|used| **used).count()
    }

    /// CUs loaded into a firmware context
    pub fn cus(&self, fw_ctx: u32) -> Vec<FwCu> {
        self.state.lock().cus.get(&fw_ctx).cloned().unwrap_or_default()
    }

    fn check_tile(&self, col: u32, row: u32) -> Result<()> {
        if col >= self.columns || row >= self.rows {
            return Err(Error::InvalidArgument("tile outside the array"));
        }
        Ok(())
    }

    fn check_mem(&self, col: u32, row: u32, addr: u32, len: usize) -> Result<()> {
        self.check_tile(col, row)?;
        let end = (addr as u64).checked_add(len as u64);
        match end {
            Some(end) if end <= TILE_MEM_SIZE as u64 => Ok(()),
            _ => Err(Error::InvalidArgument("tile memory access out of range")),
        }
    }
}

impl NpuHardware for SimNpu {
    fn create_context(&self, req: &FwContextRequest) -> Result<u32> {
        let mut state = self.state.lock();
        if core::mem::take(&mut state.fail_create) {
            return Err(FaultCode::FirmwareRejected.into());
        }
        if req.partition.end_col() > self.columns {
            return Err(FaultCode::FirmwareRejected.into());
        }
        let slot = state
            .fw_slots
            .iter()
            .position(|used| !used)
            .ok_or(Error::ResourceExhausted(Resource::FirmwareContexts))?;
        state.fw_slots[slot] = true;
        Ok(slot as u32)
    }

    fn destroy_context(&self, fw_ctx: u32) -> Result<()> {
        let mut state = self.state.lock();
        match state.fw_slots.get_mut(fw_ctx as usize) {
            Some(used) if *used => {
                *used = false;
                state.cus.remove(&fw_ctx);
                Ok(())
            },
            _ => Err(Error::InvalidArgument("unknown firmware context")),
        }
    }

    fn configure_cus(&self, fw_ctx: u32, cus: &[FwCu]) -> Result<()> {
        {
            let mut state = self.state.lock();
            if core::mem::take(&mut state.hold_configure) {
                state.configure_held = true;
            }
        }
        while self.state.lock().configure_held {
            std::thread::yield_now();
        }
        self.state.lock().cus.insert(fw_ctx, cus.to_vec());
        Ok(())
    }

    fn submit(&self, job: &HwJob) -> Result<()> {
        let mut state = self.state.lock();
        if core::mem::take(&mut state.fail_submit) {
            return Err(FaultCode::CommandAborted.into());
        }
        if state.running.iter().any(|r| r.partition.overlaps(&job.partition)) {
            return Err(Error::InvalidState("partition busy"));
        }
        state.submitted.push(job.clone());
        state.running.push(job.clone());
        Ok(())
    }

    fn preempt(&self, fw_ctx: u32, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if core::mem::take(&mut state.fail_preempt) {
            return Err(FaultCode::FirmwareRejected.into());
        }
        state.running.retain(|job| !(job.fw_ctx == fw_ctx && job.seq == seq));
        state.preempted.push((fw_ctx, seq));
        Ok(())
    }

    fn aie_metadata(&self) -> AieMetadata {
        let tiles = |row_start: u16, row_count: u16, locks: u16| AieTileMetadata {
            row_count,
            row_start,
            dma_channel_count: 2,
            lock_count: locks,
            event_reg_count: 4,
            pad: [0; 3],
        };
        AieMetadata {
            col_size: 0x200_0000,
            cols: self.columns as u16,
            rows: self.rows as u16,
            version: AieVersion { major: 2, minor: 0 },
            core: tiles(2, self.rows.saturating_sub(2) as u16, 16),
            mem: tiles(1, 1, 64),
            shim: tiles(0, 1, 16),
        }
    }

    fn aie_status_size(&self) -> usize {
        self.columns as usize * STATUS_BYTES_PER_COL
    }

    fn aie_status(&self, out: &mut [u8]) -> Result<u32> {
        let size = self.aie_status_size();
        let out = out
            .get_mut(..size)
            .ok_or(Error::BufferTooSmall { needed: size })?;
        let mut state = self.state.lock();
        let fail = core::mem::take(&mut state.fail_status);
        for (col, chunk) in out.chunks_mut(STATUS_BYTES_PER_COL).enumerate() {
            if fail && col == 1 {
                return Err(FaultCode::FirmwareRejected.into());
            }
            chunk.fill(0);
            let col = col as u32;
            let busy = state
                .running
                .iter()
                .any(|job| (job.partition.start_col..job.partition.end_col()).contains(&col));
            chunk[0] = busy as u8;
        }
        Ok(self.columns)
    }

    fn read_aie_mem(&self, col: u32, row: u32, addr: u32, out: &mut [u8]) -> Result<()> {
        self.check_mem(col, row, addr, out.len())?;
        let state = self.state.lock();
        match state.tile_mem.get(&(col, row)) {
            Some(mem) => out.copy_from_slice(&mem[addr as usize..addr as usize + out.len()]),
            None => out.fill(0),
        }
        Ok(())
    }

    fn write_aie_mem(&self, col: u32, row: u32, addr: u32, data: &[u8]) -> Result<()> {
        self.check_mem(col, row, addr, data.len())?;
        let mut state = self.state.lock();
        let mem = state
            .tile_mem
            .entry((col, row))
            .or_insert_with(|| vec![0; TILE_MEM_SIZE as usize]);
        mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_aie_reg(&self, col: u32, row: u32, addr: u32) -> Result<u32> {
        self.check_tile(col, row)?;
        Ok(self.state.lock().regs.get(&(col, row, addr)).copied().unwrap_or(0))
    }

    fn write_aie_reg(&self, col: u32, row: u32, addr: u32, val: u32) -> Result<()> {
        self.check_tile(col, row)?;
        self.state.lock().regs.insert((col, row, addr), val);
        Ok(())
    }

    fn clocks(&self) -> ClockMetadata {
        let turbo = self.state.lock().power == PowerMode::Turbo;
        ClockMetadata {
            mp_npu_clock: ClockRecord::new("MP-NPU Clock", if turbo { 1267 } else { 1056 }),
            h_clock: ClockRecord::new("H Clock", if turbo { 1800 } else { 1500 }),
        }
    }

    fn sensors(&self) -> Vec<SensorRecord> {
        vec![SensorRecord::new("Total Power", 1500, "mW", -3, SENSOR_TYPE_POWER)]
    }

    fn firmware_version(&self) -> FirmwareVersion {
        FirmwareVersion {
            major: 1,
            minor: 5,
            patch: 0,
            build: 0,
        }
    }

    fn power_mode(&self) -> PowerMode {
        self.state.lock().power
    }

    fn set_power_mode(&self, mode: PowerMode) -> Result<()> {
        self.state.lock().power = mode;
        Ok(())
    }

    fn telemetry(&self, kind: u32) -> Result<Telemetry> {
        if kind != 0 {
            return Err(Error::InvalidArgument("unsupported telemetry type"));
        }
        let state = self.state.lock();
        Ok(Telemetry {
            major: 1,
            minor: 0,
            context_slots: state.fw_slots.len() as u32,
            data: (0..64u8).collect(),
        })
    }

    fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            clk_max: 1267,
            tops_max: 50,
            task_max: self.state.lock().fw_slots.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cmd::{Partition, QosInfo};
    use ember_core::{ContextHandle, DevAddr};

    fn request(partition: Partition) -> FwContextRequest {
        FwContextRequest {
            partition,
            qos: QosInfo::default(),
            heap_addr: DevAddr::new(0x1000),
            heap_size: 0x1000,
            max_opc: 0,
            mem_size: 0,
        }
    }

    #[test]
    fn test_firmware_slots_exhaust() {
        let npu = SimNpu::new(4, 6, 1);
        let id = npu.create_context(&request(Partition::new(0, 1))).unwrap();
        assert_eq!(
            npu.create_context(&request(Partition::new(1, 1))),
            Err(Error::ResourceExhausted(Resource::FirmwareContexts))
        );
        npu.destroy_context(id).unwrap();
        assert_eq!(npu.live_contexts(), 0);
    }

    #[test]
    fn test_busy_partition_rejects_second_job() {
        let npu = SimNpu::new(4, 6, 4);
        let job = HwJob {
            ctx: ContextHandle::from_raw(1),
            fw_ctx: 0,
            seq: 1,
            partition: Partition::new(0, 2),
            cmds: vec![],
            args: vec![],
        };
        npu.submit(&job).unwrap();
        let second = HwJob { seq: 2, ..job.clone() };
        assert!(npu.submit(&second).is_err());
        npu.retire(0, 1);
        npu.submit(&second).unwrap();
    }

    #[test]
    fn test_tile_memory_roundtrip_and_bounds() {
        let npu = SimNpu::new(2, 4, 1);
        npu.write_aie_mem(1, 2, 0x10, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        npu.read_aie_mem(1, 2, 0x10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(npu.write_aie_mem(2, 0, 0, &[0]).is_err());
        assert!(npu.read_aie_mem(0, 0, TILE_MEM_SIZE - 1, &mut out).is_err());
    }
}
