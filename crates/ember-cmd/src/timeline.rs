//! # Completion Timeline
//!
//! Per-context fence: a counter of retired sequence numbers that callers
//! block on.
//!
//! ```text
//!   published ─────────────────────────────────────────────► 7
//!   retired     1  2  3  .  5  6  .
//!                        ▲        ▲
//!                 completed = 3   held in `ahead` until 4 retires
//! ```
//!
//! The counter only covers a prefix: `completed = n` means every sequence
//! number up to `n` has retired. Retirements past a gap wait in `ahead`.
//!
//! Every counter change happens under the mutex and is followed by
//! `notify_all`, and every waiter re-checks the counter under the same
//! mutex before sleeping, so no advance is missed.
//!
//! Faults are remembered for the last [`FAULT_HISTORY`] faulted sequence
//! numbers. Older ones, once inside the prefix, wait as success.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use ember_core::{Error, FaultCode, Result};

/// Faulted sequence numbers remembered per timeline
pub const FAULT_HISTORY: usize = 256;

#[derive(Debug, Default)]
struct State {
    /// Highest sequence number made visible to callers
    published: u64,
    /// Every sequence number `<= completed` has retired
    completed: u64,
    /// Retired out of order, above `completed`
    ahead: BTreeSet<u64>,
    /// Sequence numbers that retired with a device error
    faulted: BTreeMap<u64, FaultCode>,
    cancelled: bool,
    waiters: usize,
}

impl State {
    fn is_retired(&self, seq: u64) -> bool {
        seq <= self.completed || self.ahead.contains(&seq)
    }
}

/// Completion timeline of one hardware context
#[derive(Debug, Default)]
pub struct Timeline {
    state: Mutex<State>,
    cond: Condvar,
}

impl Timeline {
    /// Create an empty timeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `seq` visible to waiters; publication is monotonic
    pub fn publish(&self, seq: u64) {
        let mut state = self.state.lock();
        if seq > state.published {
            state.published = seq;
        }
    }

    /// Retire a sequence number, with the fault it ended in if any
    ///
    /// Returns `false` for a sequence number that already retired or was
    /// never published.
    pub fn retire(&self, seq: u64, fault: Option<FaultCode>) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if seq == 0 || seq > state.published || state.is_retired(seq) {
            log::warn!("timeline: ignoring retirement of seq {seq}");
            return false;
        }

        if let Some(code) = fault {
            state.faulted.insert(seq, code);
        }
        state.ahead.insert(seq);

        let before = state.completed;
        while state.ahead.remove(&(state.completed + 1)) {
            state.completed += 1;
        }

        while state.faulted.len() > FAULT_HISTORY {
            match state.faulted.first_key_value() {
                Some((&oldest, _)) if oldest <= state.completed => {
                    state.faulted.remove(&oldest);
                },
                _ => break,
            }
        }

        if state.completed != before && state.waiters > 0 {
            self.cond.notify_all();
        }
        true
    }

    /// Block until `seq` retires
    ///
    /// `None` waits without bound. Returns the fault `seq` retired with as
    /// `HardwareFault`, and `InvalidHandle` once the timeline is cancelled.
    pub fn wait(&self, seq: u64, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        if seq == 0 || seq > state.published {
            return Err(Error::InvalidArgument("sequence number was never issued"));
        }

        loop {
            if seq <= state.completed {
                return match state.faulted.get(&seq) {
                    Some(code) => Err(Error::HardwareFault(*code)),
                    None => Ok(()),
                };
            }
            if state.cancelled {
                return Err(Error::InvalidHandle);
            }

            state.waiters += 1;
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.cond.wait(&mut state);
                    false
                },
            };
            state.waiters -= 1;

            if timed_out && seq > state.completed && !state.cancelled {
                return Err(Error::Timeout);
            }
        }
    }

    /// Block until every published sequence number has retired
    ///
    /// Faults and cancellation do not end the wait early.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        while state.completed < state.published {
            state.waiters += 1;
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.cond.wait(&mut state);
                    false
                },
            };
            state.waiters -= 1;

            if timed_out && state.completed < state.published {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Wake every waiter with `InvalidHandle`; later waits fail the same way
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.cond.notify_all();
    }

    /// Check whether `seq` has retired (in or out of order)
    pub fn is_retired(&self, seq: u64) -> bool {
        self.state.lock().is_retired(seq)
    }

    /// Current counter value
    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    /// Highest published sequence number
    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// No published sequence number is outstanding
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.completed >= state.published
    }

    /// Threads currently blocked on this timeline
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn published(n: u64) -> Timeline {
        let tl = Timeline::new();
        tl.publish(n);
        tl
    }

    #[test]
    fn test_wait_on_retired_returns_immediately() {
        let tl = published(2);
        assert!(tl.retire(1, None));
        tl.wait(1, Some(Duration::from_millis(0))).unwrap();
        assert_eq!(tl.completed(), 1);
    }

    #[test]
    fn test_unissued_sequence_rejected() {
        let tl = published(2);
        assert!(matches!(tl.wait(3, None), Err(Error::InvalidArgument(_))));
        assert!(matches!(tl.wait(0, None), Err(Error::InvalidArgument(_))));
        assert!(!tl.retire(3, None));
    }

    #[test]
    fn test_out_of_order_retirement_holds_gap() {
        let tl = published(3);
        tl.retire(2, None);
        tl.retire(3, None);
        assert_eq!(tl.completed(), 0);
        assert!(tl.is_retired(3));
        assert_eq!(tl.wait(3, Some(Duration::from_millis(10))), Err(Error::Timeout));

        tl.retire(1, None);
        assert_eq!(tl.completed(), 3);
        tl.wait(3, None).unwrap();
    }

    #[test]
    fn test_duplicate_retirement_ignored() {
        let tl = published(1);
        assert!(tl.retire(1, None));
        assert!(!tl.retire(1, None));
    }

    #[test]
    fn test_fault_reported_on_exact_sequence() {
        let tl = published(2);
        tl.retire(1, Some(FaultCode::TileException));
        tl.retire(2, None);
        assert_eq!(
            tl.wait(1, None),
            Err(Error::HardwareFault(FaultCode::TileException))
        );
        tl.wait(2, None).unwrap();
    }

    #[test]
    fn test_fault_history_bounded() {
        let last = FAULT_HISTORY as u64 + 8;
        let tl = published(last);
        for seq in 1..=last {
            tl.retire(seq, Some(FaultCode::CommandAborted));
        }
        assert_eq!(tl.state.lock().faulted.len(), FAULT_HISTORY);
        assert_eq!(tl.wait(1, None), Ok(()));
        assert_eq!(
            tl.wait(last, None),
            Err(Error::HardwareFault(FaultCode::CommandAborted))
        );
    }

    #[test]
    fn test_fault_above_gap_kept() {
        let last = FAULT_HISTORY as u64 + 2;
        let tl = published(last);
        for seq in 2..=last {
            tl.retire(seq, Some(FaultCode::TileException));
        }
        // Nothing has entered the prefix, so nothing may be forgotten.
        assert_eq!(tl.state.lock().faulted.len(), FAULT_HISTORY + 1);
        tl.retire(1, None);
        assert_eq!(tl.state.lock().faulted.len(), FAULT_HISTORY);
        assert_eq!(
            tl.wait(last, None),
            Err(Error::HardwareFault(FaultCode::TileException))
        );
    }

    #[test]
    fn test_single_advance_wakes_all_waiters() {
        let tl = Arc::new(published(3));
        let mut threads = Vec::new();
        for seq in [1, 2, 3, 3] {
            let tl = tl.clone();
            threads.push(thread::spawn(move || tl.wait(seq, Some(Duration::from_secs(10)))));
        }

        while tl.waiters() < 4 {
            thread::yield_now();
        }
        tl.retire(2, None);
        tl.retire(3, None);
        tl.retire(1, None);

        for t in threads {
            assert_eq!(t.join().unwrap(), Ok(()));
        }
        assert_eq!(tl.waiters(), 0);
    }

    #[test]
    fn test_cancel_releases_waiters() {
        let tl = Arc::new(published(1));
        let waiter = {
            let tl = tl.clone();
            thread::spawn(move || tl.wait(1, None))
        };
        while tl.waiters() < 1 {
            thread::yield_now();
        }
        tl.cancel();
        assert_eq!(waiter.join().unwrap(), Err(Error::InvalidHandle));
        assert_eq!(tl.waiters(), 0);
    }

    #[test]
    fn test_wait_idle_ignores_faults() {
        let tl = published(2);
        assert_eq!(tl.wait_idle(Some(Duration::from_millis(5))), Err(Error::Timeout));
        tl.retire(1, Some(FaultCode::CommandAborted));
        tl.retire(2, None);
        tl.wait_idle(Some(Duration::from_millis(5))).unwrap();
        assert!(tl.is_idle());
    }
}
