//! # Resume Synchronizer
//!
//! Rendezvous between the listener thread and the command thread that
//! guarantees every trap is replied to exactly once.
//!
//! All state lives in one [`ReplyState`] behind one mutex:
//!
//! - the queue of traps that have been received but not replied to
//! - `replied_to_latest`, which the listener waits on after a stop
//! - a stop sequence number and the last [`StopEvent`], which the command
//!   thread waits on after resuming
//! - the close reason once the session is being torn down
//!
//! A reply is only ever sent by whoever removes the trap from the queue,
//! and removal happens under the lock, so no trap can be answered twice.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::controller::{ProcessController, ReplyToken};
use crate::error::{ArmtrapError, ArmtrapResult};
use crate::events::StopEvent;
use crate::types::ThreadPort;

/// A trap waiting for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTrap
{
    /// Reply handle
    pub token: ReplyToken,
    /// Thread blocked on the reply
    pub thread: ThreadPort,
}

/// Why the synchronizer stopped accepting traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason
{
    /// The user detached.
    Detached,
    /// The target process with this pid died.
    TargetDied(u32),
}

impl CloseReason
{
    fn into_error(self) -> ArmtrapError
    {
        match self {
            Self::Detached => ArmtrapError::NotAttached,
            Self::TargetDied(pid) => ArmtrapError::TargetDied(pid),
        }
    }
}

#[derive(Debug)]
struct ReplyState
{
    pending: VecDeque<PendingTrap>,
    replied_to_latest: bool,
    stop_seq: u64,
    last_stop: StopEvent,
    closed: Option<CloseReason>,
}

/// Mutex + condition variable around [`ReplyState`].
#[derive(Debug)]
pub struct ResumeSynchronizer
{
    state: Mutex<ReplyState>,
    changed: Condvar,
}

impl Default for ResumeSynchronizer
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl ResumeSynchronizer
{
    /// Open synchronizer with nothing pending.
    pub fn new() -> Self
    {
        Self {
            state: Mutex::new(ReplyState {
                pending: VecDeque::new(),
                replied_to_latest: true,
                stop_seq: 0,
                last_stop: StopEvent::default(),
                closed: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplyState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a received trap.
    ///
    /// Returns `false` once closed; the caller then owns the reply.
    pub fn enqueue(&self, trap: PendingTrap) -> bool
    {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        state.pending.push_back(trap);
        state.replied_to_latest = false;
        true
    }

    /// Reply success to the oldest pending trap.
    ///
    /// Returns the token replied to, or `None` if nothing was pending. The
    /// trap counts as answered even if the reply itself fails.
    pub fn resume_oldest(&self, ctl: &dyn ProcessController) -> ArmtrapResult<Option<ReplyToken>>
    {
        let mut state = self.lock();
        let Some(trap) = state.pending.pop_front() else {
            return Ok(None);
        };
        let result = ctl.reply_trap(trap.token, true);
        state.replied_to_latest = true;
        self.changed.notify_all();
        drop(state);

        debug!(token = trap.token.0, thread = %trap.thread, "replied to trap");
        result.map(|()| Some(trap.token))
    }

    /// Reply to one specific trap if it is still pending.
    ///
    /// Returns `false` if someone else already answered it.
    pub fn resolve(&self, ctl: &dyn ProcessController, token: ReplyToken, success: bool) -> ArmtrapResult<bool>
    {
        let mut state = self.lock();
        let Some(position) = state.pending.iter().position(|t| t.token == token) else {
            return Ok(false);
        };
        state.pending.remove(position);
        let result = ctl.reply_trap(token, success);
        state.replied_to_latest = true;
        self.changed.notify_all();
        result.map(|()| true)
    }

    /// Block the listener until its latest trap has been replied to.
    ///
    /// ## Errors
    ///
    /// The close reason's error if the session ends first.
    pub fn wait_replied(&self) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        loop {
            if let Some(reason) = state.closed {
                return Err(reason.into_error());
            }
            if state.replied_to_latest {
                return Ok(());
            }
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Publish a stop and return its sequence number.
    pub fn record_stop(&self, stop: StopEvent) -> u64
    {
        let mut state = self.lock();
        state.stop_seq += 1;
        state.last_stop = stop;
        self.changed.notify_all();
        state.stop_seq
    }

    /// Sequence number of the latest stop.
    pub fn stop_seq(&self) -> u64
    {
        self.lock().stop_seq
    }

    /// Block until a stop newer than `seq` is recorded.
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// ## Errors
    ///
    /// The close reason's error if the session ends first.
    pub fn wait_for_stop_after(&self, seq: u64, timeout: Option<Duration>) -> ArmtrapResult<Option<StopEvent>>
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if state.stop_seq > seq {
                return Ok(Some(state.last_stop.clone()));
            }
            if let Some(reason) = state.closed {
                return Err(reason.into_error());
            }
            state = match deadline {
                None => self.changed.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Reply success to everything pending, refuse new traps and wake all
    /// waiters. Returns how many traps were drained.
    pub fn drain_and_close(&self, ctl: &dyn ProcessController, reason: CloseReason) -> usize
    {
        let mut state = self.lock();
        let drained = state.pending.len();
        while let Some(trap) = state.pending.pop_front() {
            if let Err(err) = ctl.reply_trap(trap.token, true) {
                warn!(token = trap.token.0, "reply during teardown failed: {err}");
            }
        }
        state.replied_to_latest = true;
        state.closed.get_or_insert(reason);
        self.changed.notify_all();
        debug!(drained, ?reason, "reply queue closed");
        drained
    }

    /// Traps received but not yet replied to.
    pub fn pending_count(&self) -> usize
    {
        self.lock().pending.len()
    }

    /// Whether [`ResumeSynchronizer::drain_and_close`] ran.
    pub fn is_closed(&self) -> bool
    {
        self.lock().closed.is_some()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::exception::ExceptionType;
    use crate::platform::simulated::SimulatedController;

    fn trap(sim: &SimulatedController, port: u32) -> PendingTrap
    {
        let token = sim.inject_trap(ThreadPort(port), ExceptionType::BadAccess, &[1, 0]).unwrap();
        PendingTrap {
            token,
            thread: ThreadPort(port),
        }
    }

    #[test]
    fn test_resume_oldest_is_fifo()
    {
        let sim = SimulatedController::new(1)
            .with_thread(ThreadPort(1), 0)
            .with_thread(ThreadPort(2), 0);
        let sync = ResumeSynchronizer::new();
        let first = trap(&sim, 1);
        let second = trap(&sim, 2);
        assert!(sync.enqueue(first));
        assert!(sync.enqueue(second));

        assert_eq!(sync.resume_oldest(&sim).unwrap(), Some(first.token));
        assert_eq!(sync.pending_count(), 1);
        assert_eq!(sync.resume_oldest(&sim).unwrap(), Some(second.token));
        assert_eq!(sync.resume_oldest(&sim).unwrap(), None);
    }

    #[test]
    fn test_resolve_after_drain_does_not_reply_twice()
    {
        let sim = SimulatedController::new(1).with_thread(ThreadPort(1), 0);
        let sync = ResumeSynchronizer::new();
        let pending = trap(&sim, 1);
        sync.enqueue(pending);

        assert_eq!(sync.drain_and_close(&sim, CloseReason::Detached), 1);
        assert!(!sync.resolve(&sim, pending.token, false).unwrap());
        assert!(!sync.enqueue(pending));
        assert_eq!(sim.replies(), vec![(pending.token, true)]);
    }

    #[test]
    fn test_close_wakes_waiters()
    {
        let sync = std::sync::Arc::new(ResumeSynchronizer::new());
        let waiter = {
            let sync = sync.clone();
            std::thread::spawn(move || sync.wait_for_stop_after(0, None))
        };
        let sim = SimulatedController::new(1);
        sync.drain_and_close(&sim, CloseReason::TargetDied(1));
        assert!(matches!(waiter.join().unwrap(), Err(ArmtrapError::TargetDied(1))));
    }

    #[test]
    fn test_wait_for_stop_times_out()
    {
        let sync = ResumeSynchronizer::new();
        assert_eq!(sync.wait_for_stop_after(0, Some(Duration::from_millis(10))).unwrap(), None);
        let seq = sync.record_stop(StopEvent::default());
        assert!(sync.wait_for_stop_after(seq - 1, None).unwrap().is_some());
    }
}
