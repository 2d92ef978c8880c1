//! # Command Queue
//!
//! Per-context admission, sequencing and in-order release of submissions.
//!
//! ```text
//!   submit ──► seq ──► pending (FIFO) ──► pump ──┬──► Dispatch(ExecBuf) ──► in flight
//!                                                 └──► Retire(Dependency | Signal)
//! ```
//!
//! The head of the pending FIFO gates everything behind it: an unsatisfied
//! `Dependency` stalls later submissions of the same context, so dispatch
//! order always equals admission order.

use std::collections::{BTreeMap, VecDeque};

use ember_core::{Error, Resource, Result};
use ember_mem::BoRef;

/// Command buffers per `ExecBuf`
pub const MAX_CMD_HANDLES: usize = 256;

/// Sequence numbers per `Dependency`
pub const MAX_DEPENDENCIES: usize = 256;

// =============================================================================
// SUBMISSIONS
// =============================================================================

/// Submission type, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SubmitType {
    /// Run on hardware
    ExecBuf    = 0,
    /// Wait for earlier sequence numbers
    Dependency = 1,
    /// Advance the counter without hardware work
    Signal     = 2,
}

impl SubmitType {
    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::ExecBuf),
            1 => Ok(Self::Dependency),
            2 => Ok(Self::Signal),
            _ => Err(Error::InvalidArgument("unknown submission type")),
        }
    }
}

/// Buffers of one hardware job, held until the job retires
#[derive(Debug, Clone)]
pub struct ExecBuf {
    /// `Cmd` buffers in execution order
    pub cmds: Vec<BoRef>,
    /// Argument buffers
    pub args: Vec<BoRef>,
}

/// A validated submission
#[derive(Debug, Clone)]
pub enum Submission {
    /// Hardware job
    ExecBuf(ExecBuf),
    /// Ordering barrier on earlier sequence numbers of the same context
    Dependency(Vec<u64>),
    /// Counter advance
    Signal,
}

impl Submission {
    /// Wire type of this submission
    pub fn kind(&self) -> SubmitType {
        match self {
            Self::ExecBuf(_) => SubmitType::ExecBuf,
            Self::Dependency(_) => SubmitType::Dependency,
            Self::Signal => SubmitType::Signal,
        }
    }
}

/// What [`CommandQueue::pump`] released
#[derive(Debug)]
pub enum Released {
    /// Hand to the scheduler; the queue keeps the buffers until retired
    Dispatch(u64),
    /// Retires immediately, no hardware involved
    Retire(u64),
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Accepted submissions
    pub submitted: u64,
    /// Hardware jobs handed to the scheduler
    pub dispatched: u64,
    /// Retired sequence numbers
    pub retired: u64,
}

/// Per-context command queue
#[derive(Debug)]
pub struct CommandQueue {
    next_seq: u64,
    max_pending: usize,
    pending: VecDeque<(u64, Submission)>,
    in_flight: BTreeMap<u64, ExecBuf>,
    stats: QueueStats,
}

impl CommandQueue {
    /// Create a queue admitting at most `max_pending` outstanding entries
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_seq: 1,
            max_pending,
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            stats: QueueStats::default(),
        }
    }

    /// Admit a submission and assign its sequence number
    pub fn submit(&mut self, submission: Submission) -> Result<u64> {
        match &submission {
            Submission::ExecBuf(exec) => {
                if exec.cmds.is_empty() {
                    return Err(Error::InvalidArgument("no command buffers"));
                }
                if exec.cmds.len() > MAX_CMD_HANDLES {
                    return Err(Error::InvalidArgument("too many command buffers"));
                }
            },
            Submission::Dependency(seqs) => {
                if seqs.len() > MAX_DEPENDENCIES {
                    return Err(Error::InvalidArgument("too many dependencies"));
                }
                if seqs.iter().any(|&s| s == 0 || s >= self.next_seq) {
                    return Err(Error::InvalidArgument("dependency on unissued sequence"));
                }
            },
            Submission::Signal => {},
        }

        if self.outstanding() >= self.max_pending {
            return Err(Resource::QueueDepth.into());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back((seq, submission));
        self.stats.submitted += 1;
        Ok(seq)
    }

    /// Release everything the head of the queue allows
    ///
    /// `is_retired` reports whether a sequence number of this context has
    /// retired. Returned entries are in sequence order; the caller retires
    /// every [`Released::Retire`] on the context's timeline.
    pub fn pump(&mut self, is_retired: impl Fn(u64) -> bool) -> Vec<Released> {
        let mut released = Vec::new();

        while let Some((seq, head)) = self.pending.front() {
            let seq = *seq;
            let dispatch = match head {
                Submission::Dependency(seqs) if !seqs.iter().all(|&s| is_retired(s)) => break,
                Submission::Dependency(_) | Submission::Signal => false,
                Submission::ExecBuf(_) => true,
            };

            match self.pending.pop_front() {
                Some((_, Submission::ExecBuf(exec))) if dispatch => {
                    self.in_flight.insert(seq, exec);
                    self.stats.dispatched += 1;
                    released.push(Released::Dispatch(seq));
                },
                Some(_) => {
                    self.stats.retired += 1;
                    released.push(Released::Retire(seq));
                },
                None => break,
            }
        }

        released
    }

    /// Buffers of a dispatched job
    pub fn in_flight(&self, seq: u64) -> Option<&ExecBuf> {
        self.in_flight.get(&seq)
    }

    /// Retire a dispatched job, returning its buffers to the caller to drop
    pub fn complete(&mut self, seq: u64) -> Result<ExecBuf> {
        let exec = self
            .in_flight
            .remove(&seq)
            .ok_or(Error::InvalidArgument("sequence number not in flight"))?;
        self.stats.retired += 1;
        Ok(exec)
    }

    /// Entries admitted but not retired
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    /// Any hardware job admitted and not yet retired
    pub fn has_exec_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
            || self
                .pending
                .iter()
                .any(|(_, s)| matches!(s, Submission::ExecBuf(_)))
    }

    /// Statistics
    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use ember_mem::{BoDesc, BoRegistry, BoType, HostMemory, RegistryConfig};

    use super::*;

    fn exec(reg: &BoRegistry) -> Submission {
        let h = reg.create(&BoDesc::new(BoType::Cmd, 4096)).unwrap();
        Submission::ExecBuf(ExecBuf {
            cmds: vec![reg.acquire(h, Some(&[BoType::Cmd])).unwrap()],
            args: Vec::new(),
        })
    }

    fn registry() -> BoRegistry {
        BoRegistry::new(&RegistryConfig::default(), Arc::new(HostMemory::new()))
    }

    #[test]
    fn test_sequence_numbers_start_at_one_and_increase() {
        let reg = registry();
        let mut q = CommandQueue::new(16);
        let a = q.submit(exec(&reg)).unwrap();
        let b = q.submit(Submission::Signal).unwrap();
        let c = q.submit(Submission::Dependency(vec![a])).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(q.submit(Submission::Signal), Ok(4));
    }

    #[test]
    fn test_rejections_do_not_consume_sequence_numbers() {
        let mut q = CommandQueue::new(16);
        assert!(q.submit(Submission::Dependency(vec![1])).is_err());
        assert!(
            q.submit(Submission::ExecBuf(ExecBuf { cmds: vec![], args: vec![] }))
                .is_err()
        );
        assert_eq!(q.submit(Submission::Signal).unwrap(), 1);
    }

    #[test]
    fn test_queue_depth_bound() {
        let mut q = CommandQueue::new(2);
        q.submit(Submission::Signal).unwrap();
        q.submit(Submission::Signal).unwrap();
        assert_eq!(
            q.submit(Submission::Signal),
            Err(Error::ResourceExhausted(Resource::QueueDepth))
        );
    }

    #[test]
    fn test_dependency_gates_later_submissions() {
        let reg = registry();
        let mut q = CommandQueue::new(16);
        let retired = RefCell::new(BTreeSet::new());

        let e1 = q.submit(exec(&reg)).unwrap();
        let dep = q.submit(Submission::Dependency(vec![e1])).unwrap();
        let e2 = q.submit(exec(&reg)).unwrap();

        let out = q.pump(|s| retired.borrow().contains(&s));
        assert!(matches!(out.as_slice(), [Released::Dispatch(s)] if *s == e1));

        // Still stalled: nothing changes until e1 retires.
        assert!(q.pump(|s| retired.borrow().contains(&s)).is_empty());

        q.complete(e1).unwrap();
        retired.borrow_mut().insert(e1);
        let out = q.pump(|s| retired.borrow().contains(&s));
        assert!(matches!(
            out.as_slice(),
            [Released::Retire(d), Released::Dispatch(e)] if *d == dep && *e == e2
        ));
    }

    #[test]
    fn test_buffers_held_until_complete() {
        let reg = registry();
        let mut q = CommandQueue::new(16);
        let seq = q.submit(exec(&reg)).unwrap();
        q.pump(|_| false);

        let handle = q.in_flight(seq).unwrap().cmds[0].handle();
        assert!(matches!(reg.destroy(handle), Err(Error::InvalidState(_))));

        drop(q.complete(seq).unwrap());
        reg.destroy(handle).unwrap();
        assert_eq!(q.outstanding(), 0);
    }

    #[test]
    fn test_submit_type_codes() {
        assert_eq!(SubmitType::from_raw(2), Ok(SubmitType::Signal));
        assert!(SubmitType::from_raw(3).is_err());
        assert_eq!(Submission::Signal.kind(), SubmitType::Signal);
    }
}
