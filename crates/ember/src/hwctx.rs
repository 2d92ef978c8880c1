//! # Hardware Contexts
//!
//! A hardware context is an isolated execution environment on a column
//! partition: a command queue, a completion timeline, a set of compute
//! units and the buffers bound to it.
//!
//! ```text
//!   HwContext
//!   ├── partition, qos, hints         fixed at creation
//!   ├── timeline (Arc)                shared with waiters
//!   ├── counters                      lock-free
//!   └── inner (spin::Mutex)
//!       ├── queue                     pending + in-flight submissions
//!       ├── cus        ─► BoRef ...   replaced wholesale
//!       ├── debug      ─► BoRef ...   Debug / Trace / DebugQueue / Log
//!       ├── heap       ─► BoRef       DevHeap backing Dev allocations
//!       └── closed, configuring, op_timeout
//! ```
//!
//! Buffers bound to a context hold a use on their object, so the registry
//! refuses to destroy them while the binding exists.
//!
//! Firmware is told about a new CU table with the lock dropped. While that
//! call is out, `configuring` turns away hardware submissions and other
//! reconfigurations.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;

use arrayvec::ArrayVec;

use ember_cmd::{CommandQueue, Partition, QosInfo, Timeline};
use ember_core::{BoHandle, ContextHandle, Error, Result, TimelineHandle};
use ember_mem::BoRef;

use crate::hw::{FwCu, NpuHardware};
use crate::records::{HWCTX_STATE_ACTIVE, HWCTX_STATE_IDLE, HwCtxArrayRecord, HwCtxRecord, UcInfo};

/// Compute units per context
pub const MAX_CUS: usize = 32;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Firmware hints given at creation; recorded and reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextHints {
    /// Maximum opcode
    pub max_opc: u32,
    /// Tiles requested; determines the partition width
    pub num_tiles: u32,
    /// Memory size the context expects from its heap
    pub mem_size: u32,
}

/// Context creation request
#[derive(Debug, Clone, Copy)]
pub struct ContextDesc {
    /// Requested QoS
    pub qos: QosInfo,
    /// `DevHeap` buffer object
    pub heap: BoHandle,
    /// Optional log buffer, [`BoHandle::INVALID`] for none
    pub log: BoHandle,
    /// Firmware hints
    pub hints: ContextHints,
    /// Creating process
    pub pid: i64,
}

impl ContextDesc {
    /// Minimal request: a heap and a priority
    pub const fn new(heap: BoHandle, priority: u32) -> Self {
        Self {
            qos: QosInfo::with_priority(priority),
            heap,
            log: BoHandle::INVALID,
            hints: ContextHints {
                max_opc: 0,
                num_tiles: 0,
                mem_size: 0,
            },
            pid: 0,
        }
    }

    /// Request `num_tiles` tiles
    pub const fn with_tiles(mut self, num_tiles: u32) -> Self {
        self.hints.num_tiles = num_tiles;
        self
    }

    /// Bind a log buffer
    pub const fn with_log(mut self, log: BoHandle) -> Self {
        self.log = log;
        self
    }
}

/// Result of context creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCreated {
    /// Context handle
    pub handle: ContextHandle,
    /// User-mode queue doorbell offset
    pub doorbell: u64,
    /// Completion timeline handle
    pub timeline: TimelineHandle,
    /// Assigned columns
    pub partition: Partition,
}

/// CU configuration entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuConfig {
    /// Buffer object holding the CU image
    pub bo: BoHandle,
    /// CU function
    pub func: u8,
}

/// Debug buffer kind, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DebugBufKind {
    /// Firmware debug output
    Debug      = 0,
    /// Trace events
    Trace      = 1,
    /// Debug queue
    DebugQueue = 2,
    /// Firmware log
    Log        = 3,
}

impl DebugBufKind {
    /// Decode a wire value
    pub const fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Debug),
            1 => Ok(Self::Trace),
            2 => Ok(Self::DebugQueue),
            3 => Ok(Self::Log),
            _ => Err(Error::InvalidArgument("unknown debug buffer type")),
        }
    }
}

/// Context configuration parameter
#[derive(Debug, Clone)]
pub enum ContextParam {
    /// Replace the CU configuration
    ConfigureCus(Vec<CuConfig>),
    /// Bind a debug buffer
    AssignDebugBuffer {
        /// Buffer kind
        kind: DebugBufKind,
        /// Buffer object
        bo: BoHandle,
        /// Command id used for tracing
        command_id: u64,
        /// Per-microcontroller split
        ucs: Vec<UcInfo>,
    },
    /// Unbind a debug buffer
    RemoveDebugBuffer {
        /// Buffer object
        bo: BoHandle,
    },
    /// Drain bound in milliseconds, 0 clears it
    OpTimeout(u32),
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No outstanding commands
    Idle,
    /// Some submitted sequence number is unretired
    Active,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextCounters {
    /// Accepted submissions
    pub submissions: u64,
    /// Retired submissions
    pub completions: u64,
    /// Times preempted
    pub preemptions: u64,
    /// Times queued work lost a time-shared partition to another context
    pub suspensions: u64,
    /// Submissions that retired with a fault
    pub errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submissions: AtomicU64,
    pub(crate) completions: AtomicU64,
    pub(crate) preemptions: AtomicU64,
    pub(crate) suspensions: AtomicU64,
    pub(crate) errors: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ContextCounters {
        ContextCounters {
            submissions: self.submissions.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// BINDINGS
// =============================================================================

#[derive(Debug)]
pub(crate) struct CuBinding {
    pub(crate) bo: BoRef,
    pub(crate) func: u8,
}

#[derive(Debug)]
pub(crate) struct DebugBinding {
    pub(crate) kind: DebugBufKind,
    pub(crate) bo: BoRef,
    pub(crate) command_id: u64,
    pub(crate) ucs: Vec<UcInfo>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) queue: CommandQueue,
    pub(crate) cus: ArrayVec<CuBinding, MAX_CUS>,
    pub(crate) debug: Vec<DebugBinding>,
    pub(crate) heap: Option<BoRef>,
    pub(crate) closed: bool,
    /// A CU table is on its way to firmware
    pub(crate) configuring: bool,
    pub(crate) op_timeout: Option<Duration>,
}

// =============================================================================
// HARDWARE CONTEXT
// =============================================================================

/// A hardware context
#[derive(Debug)]
pub struct HwContext {
    fw_ctx: u32,
    partition: Partition,
    qos: QosInfo,
    hints: ContextHints,
    pid: i64,
    timeline: Arc<Timeline>,
    timeline_handle: TimelineHandle,
    pub(crate) counters: Counters,
    pub(crate) inner: spin::Mutex<Inner>,
}

impl HwContext {
    pub(crate) fn new(
        fw_ctx: u32,
        partition: Partition,
        desc: &ContextDesc,
        heap: BoRef,
        log: Option<BoRef>,
        timeline: Arc<Timeline>,
        timeline_handle: TimelineHandle,
        max_pending: usize,
    ) -> Self {
        let debug = log
            .into_iter()
            .map(|bo| DebugBinding {
                kind: DebugBufKind::Log,
                bo,
                command_id: 0,
                ucs: Vec::new(),
            })
            .collect();

        Self {
            fw_ctx,
            partition,
            qos: desc.qos,
            hints: desc.hints,
            pid: desc.pid,
            timeline,
            timeline_handle,
            counters: Counters::default(),
            inner: spin::Mutex::new(Inner {
                queue: CommandQueue::new(max_pending),
                cus: ArrayVec::new(),
                debug,
                heap: Some(heap),
                closed: false,
                configuring: false,
                op_timeout: None,
            }),
        }
    }

    /// Firmware context id
    pub fn fw_ctx(&self) -> u32 {
        self.fw_ctx
    }

    /// Assigned columns
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Requested QoS
    pub fn qos(&self) -> QosInfo {
        self.qos
    }

    /// Creation hints
    pub fn hints(&self) -> ContextHints {
        self.hints
    }

    /// Completion timeline
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Handle of the completion timeline
    pub fn timeline_handle(&self) -> TimelineHandle {
        self.timeline_handle
    }

    /// Lifecycle state
    pub fn state(&self) -> ContextState {
        if self.timeline.is_idle() {
            ContextState::Idle
        } else {
            ContextState::Active
        }
    }

    /// Counter snapshot
    pub fn counters(&self) -> ContextCounters {
        self.counters.snapshot()
    }

    /// Bytes carved from the bound heap
    pub fn heap_usage(&self) -> u64 {
        self.inner
            .lock()
            .heap
            .as_ref()
            .map(|heap| heap.object().heap_usage().as_bytes())
            .unwrap_or(0)
    }

    /// Configured CUs as `(buffer, function)`
    pub fn cus(&self) -> Vec<(BoHandle, u8)> {
        self.inner
            .lock()
            .cus
            .iter()
            .map(|cu| (cu.bo.handle(), cu.func))
            .collect()
    }

    /// Bound debug buffers as `(kind, buffer)`
    pub fn debug_buffers(&self) -> Vec<(DebugBufKind, BoHandle)> {
        self.inner
            .lock()
            .debug
            .iter()
            .map(|binding| (binding.kind, binding.bo.handle()))
            .collect()
    }

    /// Drain bound set through configuration
    pub fn op_timeout(&self) -> Option<Duration> {
        self.inner.lock().op_timeout
    }

    /// Replace the CU configuration
    pub(crate) fn set_cus(&self, hw: &dyn NpuHardware, cus: Vec<CuBinding>) -> Result<()> {
        let mut table = ArrayVec::<CuBinding, MAX_CUS>::new();
        for cu in cus {
            table
                .try_push(cu)
                .map_err(|_| Error::InvalidArgument("too many CUs"))?;
        }
        let fw_cus: Vec<FwCu> = table
            .iter()
            .map(|cu| FwCu {
                image: cu.bo.dev_addr(),
                func: cu.func,
            })
            .collect();

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::InvalidHandle);
            }
            if inner.configuring {
                return Err(Error::InvalidState("CU configuration in progress"));
            }
            if inner.queue.has_exec_in_flight() {
                return Err(Error::InvalidState("commands outstanding"));
            }
            inner.configuring = true;
        }

        let result = hw.configure_cus(self.fw_ctx, &fw_cus);

        let mut inner = self.inner.lock();
        inner.configuring = false;
        if let Err(err) = result {
            log::warn!("hwctx fw {}: CU configuration refused: {err}", self.fw_ctx);
            return Err(err);
        }
        if inner.closed {
            return Err(Error::InvalidHandle);
        }
        let old = core::mem::replace(&mut inner.cus, table);
        drop(inner);
        drop(old);

        log::debug!("hwctx fw {}: {} CUs configured", self.fw_ctx, fw_cus.len());
        Ok(())
    }

    pub(crate) fn assign_debug(&self, binding: DebugBinding) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::InvalidHandle);
        }
        if inner.debug.iter().any(|b| b.bo.handle() == binding.bo.handle()) {
            return Err(Error::InvalidArgument("debug buffer already assigned"));
        }
        log::debug!(
            "hwctx fw {}: {:?} buffer {} assigned (command {}, {} ucs)",
            self.fw_ctx,
            binding.kind,
            binding.bo.handle(),
            binding.command_id,
            binding.ucs.len()
        );
        inner.debug.push(binding);
        Ok(())
    }

    pub(crate) fn remove_debug(&self, bo: BoHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::InvalidHandle);
        }
        let index = inner
            .debug
            .iter()
            .position(|b| b.bo.handle() == bo)
            .ok_or(Error::InvalidArgument("debug buffer not assigned"))?;
        let binding = inner.debug.remove(index);
        drop(inner);
        log::debug!("hwctx fw {}: {:?} buffer {} removed", self.fw_ctx, binding.kind, bo);
        Ok(())
    }

    pub(crate) fn set_op_timeout(&self, ms: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::InvalidHandle);
        }
        inner.op_timeout = (ms != 0).then(|| Duration::from_millis(u64::from(ms)));
        Ok(())
    }

    /// Drop every buffer binding
    pub(crate) fn unbind(&self) {
        let mut inner = self.inner.lock();
        let cus = core::mem::take(&mut inner.cus);
        let debug = core::mem::take(&mut inner.debug);
        let heap = inner.heap.take();
        drop(inner);
        drop((cus, debug, heap));
    }

    /// Single-record query layout
    pub fn record(&self, handle: ContextHandle) -> HwCtxRecord {
        let c = self.counters();
        HwCtxRecord {
            context_id: handle.raw(),
            start_col: self.partition.start_col,
            num_col: self.partition.num_col,
            pad: 0,
            pid: self.pid,
            command_submissions: c.submissions,
            command_completions: c.completions,
            // A context keeps its partition for life.
            migrations: 0,
            preemptions: c.preemptions,
            errors: c.errors,
        }
    }

    /// Array query layout
    pub fn array_record(&self, handle: ContextHandle) -> HwCtxArrayRecord {
        let c = self.counters();
        let state = match self.state() {
            ContextState::Idle => HWCTX_STATE_IDLE,
            ContextState::Active => HWCTX_STATE_ACTIVE,
        };
        HwCtxArrayRecord {
            context_id: handle.raw(),
            start_col: self.partition.start_col,
            num_col: self.partition.num_col,
            hwctx_id: self.fw_ctx,
            pid: self.pid,
            command_submissions: c.submissions,
            command_completions: c.completions,
            migrations: 0,
            preemptions: c.preemptions,
            errors: c.errors,
            priority: u64::from(self.qos.priority),
            heap_usage: self.heap_usage(),
            suspensions: c.suspensions,
            state,
            pasid: 0,
            gops: self.qos.gops,
            fps: self.qos.fps,
            dma_bandwidth: self.qos.dma_bandwidth,
            latency: self.qos.latency,
            frame_exec_time: self.qos.frame_exec_time,
            pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimNpu;
    use ember_mem::{BoDesc, BoRegistry, BoType, HostMemory, RegistryConfig};

    fn setup() -> (BoRegistry, HwContext) {
        let reg = BoRegistry::new(&RegistryConfig::default(), Arc::new(HostMemory::new()));
        let heap = reg.create(&BoDesc::new(BoType::DevHeap, 0x10_000)).unwrap();
        let heap = reg.acquire(heap, Some(&[BoType::DevHeap])).unwrap();
        let ctx = HwContext::new(
            0,
            Partition::new(0, 1),
            &ContextDesc::new(heap.handle(), 0x200),
            heap,
            None,
            Arc::new(Timeline::new()),
            TimelineHandle::from_raw(1),
            8,
        );
        (reg, ctx)
    }

    fn cu(reg: &BoRegistry, func: u8) -> CuBinding {
        let h = reg.create(&BoDesc::new(BoType::Share, 4096)).unwrap();
        CuBinding {
            bo: reg.acquire(h, None).unwrap(),
            func,
        }
    }

    #[test]
    fn test_cus_replaced_wholesale() {
        let (reg, ctx) = setup();
        let npu = SimNpu::new(4, 6, 4);
        ctx.set_cus(&npu, vec![cu(&reg, 0), cu(&reg, 1)]).unwrap();
        assert_eq!(ctx.cus().len(), 2);

        let old = ctx.cus()[0].0;
        ctx.set_cus(&npu, vec![cu(&reg, 7)]).unwrap();
        assert_eq!(ctx.cus().len(), 1);
        assert_eq!(ctx.cus()[0].1, 7);
        assert_eq!(npu.cus(0).len(), 1);
        // The replaced binding no longer pins its buffer.
        reg.destroy(old).unwrap();
    }

    #[test]
    fn test_heap_binding_blocks_destroy_until_unbind() {
        let (reg, ctx) = setup();
        let heap = ctx.inner.lock().heap.as_ref().unwrap().handle();
        assert!(matches!(reg.destroy(heap), Err(Error::InvalidState(_))));
        ctx.unbind();
        reg.destroy(heap).unwrap();
    }

    #[test]
    fn test_debug_buffer_assign_and_remove() {
        let (reg, ctx) = setup();
        let binding = |reg: &BoRegistry| DebugBinding {
            kind: DebugBufKind::Trace,
            bo: cu(reg, 0).bo,
            command_id: 9,
            ucs: vec![UcInfo { index: 0, size: 4096 }],
        };
        let b = binding(&reg);
        let handle = b.bo.handle();
        ctx.assign_debug(b).unwrap();
        assert_eq!(ctx.debug_buffers(), vec![(DebugBufKind::Trace, handle)]);

        let dup = DebugBinding {
            kind: DebugBufKind::Debug,
            bo: reg.acquire(handle, None).unwrap(),
            command_id: 0,
            ucs: Vec::new(),
        };
        assert!(ctx.assign_debug(dup).is_err());

        ctx.remove_debug(handle).unwrap();
        assert!(matches!(ctx.remove_debug(handle), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_op_timeout_zero_clears() {
        let (_reg, ctx) = setup();
        ctx.set_op_timeout(250).unwrap();
        assert_eq!(ctx.op_timeout(), Some(Duration::from_millis(250)));
        ctx.set_op_timeout(0).unwrap();
        assert_eq!(ctx.op_timeout(), None);
    }

    #[test]
    fn test_state_follows_timeline() {
        let (_reg, ctx) = setup();
        assert_eq!(ctx.state(), ContextState::Idle);
        ctx.timeline().publish(1);
        assert_eq!(ctx.state(), ContextState::Active);
        assert_eq!(ctx.array_record(ContextHandle::from_raw(5)).state, HWCTX_STATE_ACTIVE);
        ctx.timeline().retire(1, None);
        assert_eq!(ctx.state(), ContextState::Idle);
    }
}
