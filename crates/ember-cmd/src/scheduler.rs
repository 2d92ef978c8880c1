//! # QoS Scheduler
//!
//! Strict-priority dispatch of hardware jobs onto column partitions.
//!
//! ```text
//!   partition (0, 2)                         partition (2, 4)
//!   ┌──────────────────────────┐             ┌──────────────────────────┐
//!   │ Realtime │ ▪ ▪           │             │ Realtime │               │
//!   │ High     │               │             │ High     │ ▪             │
//!   │ Normal   │ ▪ ▪ ▪         │             │ Normal   │               │
//!   │ Low      │ ▪             │             │ Low      │ ▪ ▪           │
//!   ├──────────┴───────────────┤             ├──────────┴───────────────┤
//!   │ running: ▪               │             │ running: -               │
//!   └──────────────────────────┘             └──────────────────────────┘
//! ```
//!
//! The scheduler never talks to hardware. Every call returns the
//! [`Decision`]s the caller has to carry out, in order. A preemption is
//! two-phase: the scheduler asks for it with [`Decision::Preempt`] and only
//! requeues the victim once the caller reports [`Scheduler::preempted`].

use std::collections::{BTreeMap, VecDeque};

use ember_core::{ContextHandle, Error, Result};

use crate::partition::Partition;
use crate::qos::PriorityBand;

bitflags::bitflags! {
    /// Enabled preemption policies
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PreemptPolicy: u32 {
        /// Interrupt a running job at any point
        const FORCE = 1 << 0;
        /// Interrupt a running job at a reported frame boundary
        const FRAME_BOUNDARY = 1 << 1;
    }
}

// =============================================================================
// JOBS AND DECISIONS
// =============================================================================

/// A hardware job waiting for, or holding, a partition
#[derive(Debug, Clone)]
pub struct Job<T> {
    /// Owning context
    pub ctx: ContextHandle,
    /// Sequence number on the context's timeline
    pub seq: u64,
    /// Run queue band
    pub band: PriorityBand,
    /// What the caller needs to start the job
    pub payload: T,
}

/// Action the caller must carry out
#[derive(Debug, Clone)]
pub enum Decision<T> {
    /// Start `job` on `partition`
    Dispatch {
        /// Target partition
        partition: Partition,
        /// Job to start
        job: Job<T>,
        /// Context whose queued work lost the partition to `job`
        switched_out: Option<ContextHandle>,
    },
    /// Stop the job running on `partition`
    Preempt {
        /// Partition whose running job is the victim
        partition: Partition,
        /// Victim context
        ctx: ContextHandle,
        /// Victim sequence number
        seq: u64,
    },
}

#[derive(Debug)]
struct Running<T> {
    job: Job<T>,
    preempting: bool,
}

#[derive(Debug)]
struct Lane<T> {
    ready: [VecDeque<Job<T>>; PriorityBand::COUNT],
    running: Option<Running<T>>,
    /// Context of the job dispatched last
    last: Option<ContextHandle>,
}

impl<T> Lane<T> {
    fn new() -> Self {
        Self {
            ready: Default::default(),
            running: None,
            last: None,
        }
    }

    fn has_queued(&self, ctx: ContextHandle) -> bool {
        self.ready.iter().flatten().any(|job| job.ctx == ctx)
    }

    fn top_band(&self) -> Option<PriorityBand> {
        PriorityBand::ALL
            .into_iter()
            .find(|band| !self.ready[band.index()].is_empty())
    }

    fn is_idle(&self) -> bool {
        self.running.is_none() && self.ready.iter().all(VecDeque::is_empty)
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Jobs started
    pub dispatches: u64,
    /// Preemptions carried out
    pub preemptions: u64,
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Per-partition strict-priority scheduler
#[derive(Debug)]
pub struct Scheduler<T> {
    lanes: BTreeMap<Partition, Lane<T>>,
    policy: PreemptPolicy,
    stats: SchedStats,
}

impl<T: Clone> Scheduler<T> {
    /// Create a scheduler with preemption disabled
    pub fn new() -> Self {
        Self {
            lanes: BTreeMap::new(),
            policy: PreemptPolicy::empty(),
            stats: SchedStats::default(),
        }
    }

    /// Enabled preemption policies
    pub fn policy(&self) -> PreemptPolicy {
        self.policy
    }

    /// Enable or disable one policy
    pub fn set_policy(&mut self, policy: PreemptPolicy, enabled: bool) {
        self.policy.set(policy, enabled);
    }

    /// Queue a job at the tail of its band
    pub fn enqueue(&mut self, partition: Partition, job: Job<T>) -> Vec<Decision<T>> {
        log::trace!("sched: {} seq {} queued on {partition} ({})", job.ctx, job.seq, job.band);
        let lane = self.lanes.entry(partition).or_insert_with(Lane::new);
        lane.ready[job.band.index()].push_back(job);
        self.schedule(partition)
    }

    fn schedule(&mut self, partition: Partition) -> Vec<Decision<T>> {
        let mut decisions = Vec::new();
        let Some(lane) = self.lanes.get_mut(&partition) else {
            return decisions;
        };
        let Some(top) = lane.top_band() else {
            return decisions;
        };

        if let Some(running) = lane.running.as_mut() {
            if self.policy.contains(PreemptPolicy::FORCE)
                && !running.preempting
                && top.outranks(running.job.band)
            {
                running.preempting = true;
                decisions.push(Decision::Preempt {
                    partition,
                    ctx: running.job.ctx,
                    seq: running.job.seq,
                });
            }
        } else if let Some(job) = lane.ready[top.index()].pop_front() {
            log::debug!("sched: dispatch {} seq {} on {partition}", job.ctx, job.seq);
            let switched_out = lane
                .last
                .replace(job.ctx)
                .filter(|&prev| prev != job.ctx && lane.has_queued(prev));
            lane.running = Some(Running {
                job: job.clone(),
                preempting: false,
            });
            self.stats.dispatches += 1;
            decisions.push(Decision::Dispatch {
                partition,
                job,
                switched_out,
            });
        }

        decisions
    }

    /// The running job reached a frame boundary
    pub fn frame_boundary(
        &mut self,
        partition: Partition,
        ctx: ContextHandle,
    ) -> Option<Decision<T>> {
        if !self.policy.contains(PreemptPolicy::FRAME_BOUNDARY) {
            return None;
        }
        let lane = self.lanes.get_mut(&partition)?;
        let top = lane.top_band()?;
        let running = lane.running.as_mut()?;
        if running.job.ctx != ctx || running.preempting || !top.outranks(running.job.band) {
            return None;
        }

        running.preempting = true;
        Some(Decision::Preempt {
            partition,
            ctx: running.job.ctx,
            seq: running.job.seq,
        })
    }

    /// The caller stopped the victim of a [`Decision::Preempt`]
    ///
    /// The victim goes back to the head of its band and the partition is
    /// handed to the best waiting job.
    pub fn preempted(&mut self, partition: Partition) -> Result<Vec<Decision<T>>> {
        let lane = self
            .lanes
            .get_mut(&partition)
            .ok_or(Error::InvalidState("no preemption pending"))?;
        match lane.running.take() {
            Some(running) if running.preempting => {
                let job = running.job;
                log::debug!("sched: preempted {} seq {} on {partition}", job.ctx, job.seq);
                lane.ready[job.band.index()].push_front(job);
                self.stats.preemptions += 1;
            },
            other => {
                lane.running = other;
                return Err(Error::InvalidState("no preemption pending"));
            },
        }
        Ok(self.schedule(partition))
    }

    /// The caller failed to stop the victim; it keeps running
    pub fn preempt_failed(&mut self, partition: Partition) {
        if let Some(running) = self
            .lanes
            .get_mut(&partition)
            .and_then(|lane| lane.running.as_mut())
        {
            running.preempting = false;
        }
    }

    /// The job running on `partition` finished
    pub fn complete(
        &mut self,
        partition: Partition,
        ctx: ContextHandle,
        seq: u64,
    ) -> Result<Vec<Decision<T>>> {
        let lane = self
            .lanes
            .get_mut(&partition)
            .ok_or(Error::InvalidArgument("job is not running"))?;
        match &lane.running {
            Some(running) if running.job.ctx == ctx && running.job.seq == seq => {
                lane.running = None;
            },
            _ => return Err(Error::InvalidArgument("job is not running")),
        }

        let decisions = self.schedule(partition);
        if self.lanes.get(&partition).is_some_and(Lane::is_idle) {
            self.lanes.remove(&partition);
        }
        Ok(decisions)
    }

    /// Job currently holding `partition`
    pub fn running(&self, partition: Partition) -> Option<&Job<T>> {
        self.lanes
            .get(&partition)
            .and_then(|lane| lane.running.as_ref())
            .map(|running| &running.job)
    }

    /// Statistics
    pub fn stats(&self) -> SchedStats {
        self.stats
    }
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P0: Partition = Partition::new(0, 2);
    const P1: Partition = Partition::new(2, 2);

    fn job(ctx: u32, seq: u64, band: PriorityBand) -> Job<()> {
        Job {
            ctx: ContextHandle::from_raw(ctx),
            seq,
            band,
            payload: (),
        }
    }

    fn dispatched(decisions: &[Decision<()>]) -> Vec<(u32, u64)> {
        decisions
            .iter()
            .filter_map(|d| match d {
                Decision::Dispatch { job, .. } => Some((job.ctx.raw(), job.seq)),
                Decision::Preempt { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_one_job_per_partition() {
        let mut s = Scheduler::new();
        assert_eq!(dispatched(&s.enqueue(P0, job(1, 1, PriorityBand::Normal))), vec![(1, 1)]);
        assert!(s.enqueue(P0, job(1, 2, PriorityBand::Normal)).is_empty());
        assert_eq!(dispatched(&s.enqueue(P1, job(2, 1, PriorityBand::Low))), vec![(2, 1)]);

        let next = s.complete(P0, ContextHandle::from_raw(1), 1).unwrap();
        assert_eq!(dispatched(&next), vec![(1, 2)]);
    }

    #[test]
    fn test_strict_priority_order() {
        let mut s = Scheduler::new();
        s.enqueue(P0, job(9, 1, PriorityBand::Normal));
        s.enqueue(P0, job(1, 1, PriorityBand::Low));
        s.enqueue(P0, job(2, 1, PriorityBand::High));
        s.enqueue(P0, job(3, 1, PriorityBand::Realtime));
        s.enqueue(P0, job(2, 2, PriorityBand::High));

        let mut order = Vec::new();
        let mut running = (9, 1);
        loop {
            let next = s
                .complete(P0, ContextHandle::from_raw(running.0), running.1)
                .unwrap();
            match dispatched(&next).first() {
                Some(&d) => {
                    order.push(d);
                    running = d;
                },
                None => break,
            }
        }
        assert_eq!(order, vec![(3, 1), (2, 1), (2, 2), (1, 1)]);
    }

    #[test]
    fn test_complete_wrong_job_rejected() {
        let mut s = Scheduler::new();
        s.enqueue(P0, job(1, 1, PriorityBand::Normal));
        assert!(s.complete(P0, ContextHandle::from_raw(1), 2).is_err());
        assert!(s.complete(P1, ContextHandle::from_raw(1), 1).is_err());
    }

    #[test]
    fn test_no_preemption_without_policy() {
        let mut s = Scheduler::new();
        s.enqueue(P0, job(1, 1, PriorityBand::Low));
        assert!(s.enqueue(P0, job(2, 1, PriorityBand::Realtime)).is_empty());
        assert!(s.frame_boundary(P0, ContextHandle::from_raw(1)).is_none());
    }

    #[test]
    fn test_force_preempt_requeues_victim_at_head() {
        let mut s = Scheduler::new();
        s.set_policy(PreemptPolicy::FORCE, true);
        s.enqueue(P0, job(1, 1, PriorityBand::Low));
        s.enqueue(P0, job(1, 2, PriorityBand::Low));

        let d = s.enqueue(P0, job(2, 1, PriorityBand::Realtime));
        assert!(matches!(d.as_slice(), [Decision::Preempt { seq: 1, .. }]));
        // A second arrival does not ask again while one is pending.
        assert!(s.enqueue(P0, job(3, 1, PriorityBand::High)).is_empty());

        let d = s.preempted(P0).unwrap();
        assert_eq!(dispatched(&d), vec![(2, 1)]);
        assert_eq!(s.stats().preemptions, 1);

        let d = s.complete(P0, ContextHandle::from_raw(2), 1).unwrap();
        assert_eq!(dispatched(&d), vec![(3, 1)]);
        let d = s.complete(P0, ContextHandle::from_raw(3), 1).unwrap();
        assert_eq!(dispatched(&d), vec![(1, 1)]);
    }

    #[test]
    fn test_frame_boundary_preempt() {
        let mut s = Scheduler::new();
        s.set_policy(PreemptPolicy::FRAME_BOUNDARY, true);
        s.enqueue(P0, job(1, 1, PriorityBand::Normal));
        assert!(s.enqueue(P0, job(2, 1, PriorityBand::High)).is_empty());

        assert!(s.frame_boundary(P0, ContextHandle::from_raw(2)).is_none());
        let d = s.frame_boundary(P0, ContextHandle::from_raw(1));
        assert!(matches!(d, Some(Decision::Preempt { seq: 1, .. })));
        assert!(s.frame_boundary(P0, ContextHandle::from_raw(1)).is_none());
    }

    #[test]
    fn test_preempt_failed_keeps_victim_running() {
        let mut s = Scheduler::new();
        s.set_policy(PreemptPolicy::FORCE, true);
        s.enqueue(P0, job(1, 1, PriorityBand::Low));
        s.enqueue(P0, job(2, 1, PriorityBand::Realtime));
        s.preempt_failed(P0);

        assert!(s.preempted(P0).is_err());
        assert_eq!(s.running(P0).map(|j| j.seq), Some(1));
        let next = s.complete(P0, ContextHandle::from_raw(1), 1).unwrap();
        assert_eq!(dispatched(&next), vec![(2, 1)]);
    }

    #[test]
    fn test_switch_reports_context_with_queued_work() {
        let mut s = Scheduler::new();
        s.set_policy(PreemptPolicy::FORCE, true);
        s.enqueue(P0, job(1, 1, PriorityBand::Low));
        s.enqueue(P0, job(1, 2, PriorityBand::Low));
        s.enqueue(P0, job(2, 1, PriorityBand::Realtime));

        let next = s.preempted(P0).unwrap();
        assert!(matches!(
            next.as_slice(),
            [Decision::Dispatch { switched_out: Some(ctx), .. }] if ctx.raw() == 1
        ));

        // Back to the only context with work: nothing is switched out.
        let next = s.complete(P0, ContextHandle::from_raw(2), 1).unwrap();
        assert!(matches!(
            next.as_slice(),
            [Decision::Dispatch { switched_out: None, job, .. }] if job.seq == 1
        ));
        let next = s.complete(P0, ContextHandle::from_raw(1), 1).unwrap();
        assert!(matches!(next.as_slice(), [Decision::Dispatch { switched_out: None, .. }]));
    }
}
