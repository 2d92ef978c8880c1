//! # Device
//!
//! The scheduler state of one NPU: buffer objects, hardware contexts and
//! their timelines, the column allocator and the QoS scheduler.
//!
//! ## Submission Flow
//!
//! ```text
//!   exec ──► ctx.inner ──► CommandQueue::submit ──► Timeline::publish
//!                 │
//!                 ├── pump ──► Retire ──► Timeline::retire ──► (pump again)
//!                 │
//!                 └── pump ──► Dispatch ──► Scheduler::enqueue
//!                                                 │
//!                        locks released           ▼
//!                 NpuHardware::submit / preempt ◄── Decision
//!
//!   complete ──► ctx.inner ──► CommandQueue::complete ──► Timeline::retire
//!                         └──► Scheduler::complete ──► next Decision
//! ```
//!
//! ## Lock Order
//!
//! context inner → scheduler → timeline, context table → draining list →
//! timeline. Tables are only held long enough to clone an `Arc`. No lock
//! is held across a call into the hardware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ember_cmd::{
    Decision, ExecBuf, Job, PartitionAllocator, PreemptPolicy, Released, Scheduler, Submission,
    Timeline,
};
use ember_core::{
    BoHandle, ContextHandle, ContextMarker, Error, FaultCode, HandleArena, Result, TimelineHandle,
    TimelineMarker,
};
use ember_mem::{
    BoDesc, BoInfo, BoRef, BoRegistry, BoType, MemoryManager, RegistryStats, SyncDirection,
};

use crate::config::DeviceConfig;
use crate::hw::{FwContextRequest, HwJob, NpuHardware};
use crate::hwctx::{
    ContextCreated, ContextDesc, ContextParam, Counters, CuBinding, DebugBinding, HwContext,
    MAX_CUS,
};

type ContextTable = HandleArena<ContextMarker, Arc<HwContext>>;

/// What a caller submits to a context
#[derive(Debug, Clone, Copy)]
pub enum Submit<'a> {
    /// Hardware job over `Cmd` buffers and argument buffers
    ExecBuf {
        /// `Cmd` buffer objects in execution order
        cmds: &'a [BoHandle],
        /// Argument buffer objects
        args: &'a [BoHandle],
    },
    /// Barrier on earlier sequence numbers of the same context
    Dependency(&'a [u64]),
    /// Counter advance
    Signal,
}

/// NPU device
pub struct Device {
    config: DeviceConfig,
    pub(crate) hw: Arc<dyn NpuHardware>,
    registry: BoRegistry,
    pub(crate) contexts: spin::RwLock<ContextTable>,
    timelines: spin::RwLock<HandleArena<TimelineMarker, Arc<Timeline>>>,
    partitions: spin::Mutex<PartitionAllocator>,
    pub(crate) scheduler: spin::Mutex<Scheduler<HwJob>>,
    /// Destroyed contexts with commands still outstanding
    draining: spin::Mutex<Vec<Draining>>,
}

#[derive(Debug)]
struct Draining {
    handle: ContextHandle,
    ctx: Arc<HwContext>,
    /// The destroyer gave up waiting; the completion path tears it down
    orphaned: bool,
}

impl Device {
    /// Create a device over a hardware and a memory collaborator
    pub fn new(
        config: DeviceConfig,
        hw: Arc<dyn NpuHardware>,
        mm: Arc<dyn MemoryManager>,
    ) -> Self {
        let mut scheduler = Scheduler::new();
        scheduler.set_policy(PreemptPolicy::FORCE, config.force_preempt);
        scheduler.set_policy(PreemptPolicy::FRAME_BOUNDARY, config.frame_boundary_preempt);

        log::info!(
            "ember: {} columns, min partition {}, time share {}",
            config.columns,
            config.min_partition_width,
            config.time_share
        );

        Self {
            registry: BoRegistry::new(&config.registry, mm),
            contexts: spin::RwLock::new(HandleArena::with_limit(config.max_contexts)),
            timelines: spin::RwLock::new(HandleArena::with_limit(config.max_contexts)),
            partitions: spin::Mutex::new(PartitionAllocator::new(
                config.columns,
                config.min_partition_width,
                config.time_share,
            )),
            scheduler: spin::Mutex::new(scheduler),
            draining: spin::Mutex::new(Vec::new()),
            config,
            hw,
        }
    }

    /// Configuration the device was created with
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Hardware collaborator
    pub fn hardware(&self) -> &Arc<dyn NpuHardware> {
        &self.hw
    }

    /// Buffer object registry
    pub fn registry(&self) -> &BoRegistry {
        &self.registry
    }

    // =========================================================================
    // BUFFER OBJECTS
    // =========================================================================

    /// Create a buffer object
    pub fn create_bo(&self, desc: &BoDesc<'_>) -> Result<BoHandle> {
        self.registry.create(desc)
    }

    /// Mapping information of a buffer object
    pub fn bo_info(&self, handle: BoHandle) -> Result<BoInfo> {
        self.registry.info(handle)
    }

    /// Cache-coherence boundary on a buffer object range
    pub fn sync_bo(
        &self,
        handle: BoHandle,
        direction: SyncDirection,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        self.registry.sync(handle, direction, offset, size)
    }

    /// Destroy a buffer object
    pub fn destroy_bo(&self, handle: BoHandle) -> Result<()> {
        self.registry.destroy(handle)
    }

    /// Registry statistics
    pub fn bo_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    // =========================================================================
    // CONTEXT LIFECYCLE
    // =========================================================================

    /// Create a hardware context
    pub fn create_context(&self, desc: &ContextDesc) -> Result<ContextCreated> {
        let heap = self
            .registry
            .acquire(desc.heap, Some(&[BoType::DevHeap]))
            .map_err(|err| match err {
                Error::InvalidHandle => Error::InvalidArgument("heap is not a live buffer object"),
                err => err,
            })?;
        if u64::from(desc.hints.mem_size) > heap.object().size().as_bytes() {
            return Err(Error::InvalidArgument("heap smaller than requested memory"));
        }
        let log = if desc.log.is_invalid() {
            None
        } else {
            Some(self.registry.acquire(desc.log, None)?)
        };

        let rows = u32::from(self.hw.aie_metadata().core.row_count).max(1);
        let width = desc.hints.num_tiles.div_ceil(rows);
        let partition = self.partitions.lock().allocate(width)?;

        let request = FwContextRequest {
            partition,
            qos: desc.qos,
            heap_addr: heap.dev_addr(),
            heap_size: heap.object().size().as_bytes(),
            max_opc: desc.hints.max_opc,
            mem_size: desc.hints.mem_size,
        };
        let fw_ctx = match self.hw.create_context(&request) {
            Ok(fw_ctx) => fw_ctx,
            Err(err) => {
                log::warn!("ember: firmware refused context on {partition}: {err}");
                self.release_partition(partition);
                return Err(err);
            },
        };

        let timeline = Arc::new(Timeline::new());
        let timeline_handle = match self.timelines.write().insert(timeline.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                self.destroy_fw_context(fw_ctx);
                self.release_partition(partition);
                return Err(err);
            },
        };

        let ctx = Arc::new(HwContext::new(
            fw_ctx,
            partition,
            desc,
            heap,
            log,
            timeline,
            timeline_handle,
            self.config.max_pending,
        ));
        let handle = match self.contexts.write().insert(ctx.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                self.timelines.write().remove(timeline_handle);
                self.destroy_fw_context(fw_ctx);
                self.release_partition(partition);
                ctx.unbind();
                return Err(err);
            },
        };

        let doorbell = ContextTable::slot_index(handle) as u64 * self.config.doorbell_stride;
        log::info!(
            "ember: context {handle} created on {partition} (fw {fw_ctx}, {})",
            desc.qos.band()
        );
        Ok(ContextCreated {
            handle,
            doorbell,
            timeline: timeline_handle,
            partition,
        })
    }

    /// Apply a configuration parameter to a context
    pub fn configure(&self, handle: ContextHandle, param: ContextParam) -> Result<()> {
        let ctx = self.context(handle)?;
        match param {
            ContextParam::ConfigureCus(cus) => {
                let limit = (ctx.partition().num_col as usize * self.config.max_cus_per_column)
                    .min(MAX_CUS);
                if cus.is_empty() {
                    return Err(Error::InvalidArgument("empty CU configuration"));
                }
                if cus.len() > limit {
                    return Err(Error::InvalidArgument("too many CUs for the partition"));
                }
                let bindings = cus
                    .iter()
                    .map(|cu| {
                        self.acquire_bound(cu.bo)
                            .map(|bo| CuBinding { bo, func: cu.func })
                    })
                    .collect::<Result<Vec<_>>>()?;
                ctx.set_cus(&*self.hw, bindings)
            },
            ContextParam::AssignDebugBuffer {
                kind,
                bo,
                command_id,
                ucs,
            } => {
                let bo = self.acquire_bound(bo)?;
                ctx.assign_debug(DebugBinding {
                    kind,
                    bo,
                    command_id,
                    ucs,
                })
            },
            ContextParam::RemoveDebugBuffer { bo } => ctx.remove_debug(bo),
            ContextParam::OpTimeout(ms) => ctx.set_op_timeout(ms),
        }
    }

    /// Destroy a context once everything submitted to it has retired
    ///
    /// The handle is invalid as soon as this is called. If the drain
    /// exceeds the context's operation timeout, `Timeout` is returned and
    /// the context is torn down by the completion that retires its last
    /// command.
    pub fn destroy_context(&self, handle: ContextHandle) -> Result<()> {
        // Listed as draining before the table lock drops, so a completion
        // never finds the context in neither place.
        let ctx = {
            let mut contexts = self.contexts.write();
            let ctx = contexts.remove(handle).ok_or(Error::InvalidHandle)?;
            self.draining.lock().push(Draining {
                handle,
                ctx: ctx.clone(),
                orphaned: false,
            });
            ctx
        };

        let timeout = {
            let mut inner = ctx.inner.lock();
            inner.closed = true;
            inner.op_timeout.or(self.config.default_op_timeout)
        };

        match ctx.timeline().wait_idle(timeout) {
            Ok(()) => {
                self.draining.lock().retain(|d| d.handle != handle);
                self.finalize(handle, &ctx);
                Ok(())
            },
            Err(err) => {
                log::warn!(
                    "ember: context {handle} did not drain ({err}), {} outstanding",
                    ctx.timeline().published() - ctx.timeline().completed()
                );
                if let Some(entry) = self.draining.lock().iter_mut().find(|d| d.handle == handle) {
                    entry.orphaned = true;
                }
                ctx.timeline().cancel();
                // The last completion may have landed before the orphan mark.
                self.reap(handle);
                Err(err)
            },
        }
    }

    fn finalize(&self, handle: ContextHandle, ctx: &HwContext) {
        ctx.timeline().cancel();
        self.timelines.write().remove(ctx.timeline_handle());
        self.destroy_fw_context(ctx.fw_ctx());
        self.release_partition(ctx.partition());
        ctx.unbind();
        log::info!("ember: context {handle} destroyed");
    }

    /// Tear down an orphaned context once it has drained
    fn reap(&self, handle: ContextHandle) {
        let ctx = {
            let mut draining = self.draining.lock();
            let Some(index) = draining.iter().position(|d| {
                d.handle == handle && d.orphaned && d.ctx.timeline().is_idle()
            }) else {
                return;
            };
            draining.swap_remove(index).ctx
        };
        self.finalize(handle, &ctx);
    }

    fn destroy_fw_context(&self, fw_ctx: u32) {
        if let Err(err) = self.hw.destroy_context(fw_ctx) {
            log::warn!("ember: firmware context {fw_ctx} teardown failed: {err}");
        }
    }

    fn release_partition(&self, partition: ember_cmd::Partition) {
        if let Err(err) = self.partitions.lock().release(partition) {
            log::error!("ember: releasing {partition}: {err}");
        }
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    /// Resolve a live context
    pub fn context(&self, handle: ContextHandle) -> Result<Arc<HwContext>> {
        self.contexts
            .read()
            .get(handle)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Resolve a live timeline
    pub fn timeline(&self, handle: TimelineHandle) -> Result<Arc<Timeline>> {
        self.timelines
            .read()
            .get(handle)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Live contexts, in handle slot order
    pub fn contexts(&self) -> Vec<(ContextHandle, Arc<HwContext>)> {
        self.contexts
            .read()
            .iter()
            .map(|(handle, ctx)| (handle, ctx.clone()))
            .collect()
    }

    /// Contexts destroyed but still draining
    pub fn draining(&self) -> usize {
        self.draining.lock().len()
    }

    /// Live or draining context; completions still arrive for the latter
    fn context_or_draining(&self, handle: ContextHandle) -> Result<Arc<HwContext>> {
        self.context(handle).or_else(|_| {
            self.draining
                .lock()
                .iter()
                .find(|d| d.handle == handle)
                .map(|d| d.ctx.clone())
                .ok_or(Error::InvalidHandle)
        })
    }

    fn acquire_bound(&self, bo: BoHandle) -> Result<BoRef> {
        self.registry.acquire(bo, None).map_err(|err| match err {
            Error::InvalidHandle => Error::InvalidArgument("unknown buffer object"),
            err => err,
        })
    }

    // =========================================================================
    // SUBMISSION AND COMPLETION
    // =========================================================================

    /// Submit to a context, returning the sequence number
    pub fn exec(&self, handle: ContextHandle, submit: Submit<'_>) -> Result<u64> {
        let ctx = self.context(handle)?;

        let submission = match submit {
            Submit::ExecBuf { cmds, args } => {
                let cmds = cmds
                    .iter()
                    .map(|&bo| self.registry.acquire(bo, Some(&[BoType::Cmd])))
                    .collect::<Result<Vec<_>>>()?;
                let args = args
                    .iter()
                    .map(|&bo| self.registry.acquire(bo, None))
                    .collect::<Result<Vec<_>>>()?;
                Submission::ExecBuf(ExecBuf { cmds, args })
            },
            Submit::Dependency(seqs) => Submission::Dependency(seqs.to_vec()),
            Submit::Signal => Submission::Signal,
        };

        let (seq, decisions) = {
            let mut inner = ctx.inner.lock();
            if inner.closed {
                return Err(Error::InvalidHandle);
            }
            if matches!(submission, Submission::ExecBuf(_)) {
                if inner.configuring {
                    return Err(Error::InvalidState("CU configuration in progress"));
                }
                if inner.cus.is_empty() {
                    return Err(Error::InvalidState("no compute units configured"));
                }
            }
            let seq = inner.queue.submit(submission)?;
            ctx.timeline().publish(seq);
            Counters::bump(&ctx.counters.submissions);

            let jobs = self.advance(handle, &ctx, &mut inner.queue);
            let mut scheduler = self.scheduler.lock();
            let decisions: Vec<_> = jobs
                .into_iter()
                .flat_map(|job| scheduler.enqueue(ctx.partition(), job))
                .collect();
            (seq, decisions)
        };

        log::trace!("ember: context {handle} seq {seq} submitted");
        self.carry_out(decisions);
        Ok(seq)
    }

    /// Release everything the head of the queue allows
    ///
    /// Barriers and signals retire on the spot, which may satisfy the next
    /// barrier, so this pumps until nothing moves.
    fn advance(
        &self,
        handle: ContextHandle,
        ctx: &HwContext,
        queue: &mut ember_cmd::CommandQueue,
    ) -> Vec<Job<HwJob>> {
        let mut jobs = Vec::new();
        loop {
            let released = queue.pump(|seq| ctx.timeline().is_retired(seq));
            if released.is_empty() {
                return jobs;
            }
            for entry in released {
                match entry {
                    Released::Retire(seq) => {
                        ctx.timeline().retire(seq, None);
                        Counters::bump(&ctx.counters.completions);
                    },
                    Released::Dispatch(seq) => {
                        let Some(exec) = queue.in_flight(seq) else {
                            continue;
                        };
                        jobs.push(Job {
                            ctx: handle,
                            seq,
                            band: ctx.qos().band(),
                            payload: HwJob {
                                ctx: handle,
                                fw_ctx: ctx.fw_ctx(),
                                seq,
                                partition: ctx.partition(),
                                cmds: exec.cmds.iter().map(BoRef::dev_addr).collect(),
                                args: exec.args.iter().map(BoRef::dev_addr).collect(),
                            },
                        });
                    },
                }
            }
        }
    }

    /// Report the completion of a dispatched job
    ///
    /// Called by whatever services device interrupts. A fault retires the
    /// sequence number; waiters on it get `HardwareFault`. Only the job
    /// running on the context's partition can complete; anything else is
    /// `InvalidArgument` and changes nothing.
    pub fn complete(
        &self,
        handle: ContextHandle,
        seq: u64,
        status: core::result::Result<(), FaultCode>,
    ) -> Result<()> {
        let decisions = self.retire_job(handle, seq, status)?;
        self.carry_out(decisions);
        self.reap(handle);
        Ok(())
    }

    fn retire_job(
        &self,
        handle: ContextHandle,
        seq: u64,
        status: core::result::Result<(), FaultCode>,
    ) -> Result<Vec<Decision<HwJob>>> {
        let ctx = self.context_or_draining(handle)?;

        let (exec, decisions) = {
            let mut inner = ctx.inner.lock();
            let mut scheduler = self.scheduler.lock();
            let running = scheduler
                .running(ctx.partition())
                .is_some_and(|job| job.ctx == handle && job.seq == seq);
            if !running {
                log::debug!("ember: context {handle} seq {seq} is not running, ignored");
                return Err(Error::InvalidArgument("job is not running"));
            }

            let exec = inner.queue.complete(seq)?;
            let fault = status.err();
            if let Some(code) = fault {
                log::warn!("ember: context {handle} seq {seq} faulted: {code}");
                Counters::bump(&ctx.counters.errors);
            }
            ctx.timeline().retire(seq, fault);
            Counters::bump(&ctx.counters.completions);

            let jobs = self.advance(handle, &ctx, &mut inner.queue);
            let mut decisions = scheduler.complete(ctx.partition(), handle, seq)?;
            for job in jobs {
                decisions.extend(scheduler.enqueue(ctx.partition(), job));
            }
            (exec, decisions)
        };
        drop(exec);
        Ok(decisions)
    }

    /// The job running on a context's partition reached a frame boundary
    pub fn frame_boundary(&self, handle: ContextHandle) -> Result<()> {
        let ctx = self.context(handle)?;
        let decision = self.scheduler.lock().frame_boundary(ctx.partition(), handle);
        self.carry_out(decision.into_iter().collect());
        Ok(())
    }

    /// Enabled preemption policies
    pub fn preempt_policy(&self) -> PreemptPolicy {
        self.scheduler.lock().policy()
    }

    /// Enable or disable a preemption policy
    pub fn set_preempt_policy(&self, policy: PreemptPolicy, enabled: bool) {
        log::info!("ember: preemption {policy:?} {}", if enabled { "on" } else { "off" });
        self.scheduler.lock().set_policy(policy, enabled);
    }

    fn carry_out(&self, decisions: Vec<Decision<HwJob>>) {
        let mut work: VecDeque<_> = decisions.into();
        while let Some(decision) = work.pop_front() {
            match decision {
                Decision::Dispatch {
                    partition,
                    job,
                    switched_out,
                } => {
                    if let Some(ctx) = switched_out.and_then(|h| self.context_or_draining(h).ok()) {
                        Counters::bump(&ctx.counters.suspensions);
                    }
                    if let Err(err) = self.hw.submit(&job.payload) {
                        log::warn!(
                            "ember: context {} seq {} failed to start on {partition}: {err}",
                            job.ctx,
                            job.seq
                        );
                        let code = match err {
                            Error::HardwareFault(code) => code,
                            _ => FaultCode::CommandAborted,
                        };
                        match self.retire_job(job.ctx, job.seq, Err(code)) {
                            Ok(next) => work.extend(next),
                            Err(err) => log::error!("ember: retiring failed start: {err}"),
                        }
                        self.reap(job.ctx);
                    }
                },
                Decision::Preempt {
                    partition,
                    ctx,
                    seq,
                } => {
                    let victim = match self.context_or_draining(ctx) {
                        Ok(victim) => victim,
                        Err(_) => {
                            self.scheduler.lock().preempt_failed(partition);
                            continue;
                        },
                    };
                    match self.hw.preempt(victim.fw_ctx(), seq) {
                        Ok(()) => {
                            Counters::bump(&victim.counters.preemptions);
                            log::debug!("ember: preempted context {ctx} seq {seq} on {partition}");
                            match self.scheduler.lock().preempted(partition) {
                                Ok(next) => work.extend(next),
                                Err(err) => log::debug!("ember: preemption raced: {err}"),
                            }
                        },
                        Err(err) => {
                            log::warn!("ember: preempting context {ctx} failed: {err}");
                            self.scheduler.lock().preempt_failed(partition);
                        },
                    }
                },
            }
        }
    }

    /// Block until `seq` of a context retires
    ///
    /// `None` waits without bound.
    pub fn wait(&self, handle: ContextHandle, seq: u64, timeout: Option<Duration>) -> Result<()> {
        let ctx = self.context(handle)?;
        ctx.timeline().wait(seq, timeout)
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("contexts", &self.contexts.read().len())
            .field("registry", &self.registry)
            .field("draining", &self.draining())
            .finish()
    }
}
