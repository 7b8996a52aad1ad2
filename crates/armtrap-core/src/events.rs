//! Debugger event types and helpers.
//!
//! The listener thread publishes an event for every stop, for every trap
//! that was reported but auto-resumed (a passed signal, a watchpoint hit),
//! and when the session ends. Front ends subscribe with
//! [`crate::Debugger::subscribe`] instead of polling.

use std::fmt;
use std::sync::mpsc;

use smallvec::SmallVec;

use crate::breakpoints::BreakpointId;
use crate::exception::ExceptionType;
use crate::types::{Address, ThreadId};
use crate::watchpoints::{ValueChange, WatchpointId};

/// Something worth telling the user about a trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapEvent
{
    /// A thread in scope reached a breakpoint.
    BreakpointHit
    {
        /// Thread that trapped
        thread: ThreadId,
        /// Lowest-numbered breakpoint at the address
        id: BreakpointId,
        /// Breakpoint address
        address: Address,
        /// Hits including this one
        hit_count: u64,
    },
    /// A watched location was accessed.
    WatchpointHit
    {
        /// Thread that accessed it
        thread: ThreadId,
        /// Watchpoint
        id: WatchpointId,
        /// Address reported by the fault
        address: Address,
        /// PC of the accessing instruction
        pc: Address,
        /// Value before and after
        change: ValueChange,
    },
    /// A user-requested single step finished.
    StepCompleted
    {
        /// Stepped thread
        thread: ThreadId,
        /// New PC
        pc: Address,
    },
    /// The target received a signal.
    Signal
    {
        /// Receiving thread
        thread: ThreadId,
        /// Signal number
        signal: i32,
        /// Whether it was left pending for the target
        passed: bool,
    },
    /// An exception the engine has no special handling for.
    Exception
    {
        /// Faulting thread
        thread: ThreadId,
        /// Exception class
        exception: ExceptionType,
        /// Raw codes
        codes: SmallVec<[i64; 2]>,
    },
    /// The user interrupted a running target.
    Interrupted,
}

impl fmt::Display for TrapEvent
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::BreakpointHit {
                thread,
                id,
                address,
                hit_count,
            } => write!(f, "[thread {thread}] breakpoint {id} hit {hit_count} time(s) at {address}"),
            Self::WatchpointHit {
                thread,
                id,
                address,
                pc,
                change,
            } => write!(
                f,
                "[thread {thread}] watchpoint {id} hit at {address} by instruction at {pc}: {change}"
            ),
            Self::StepCompleted { thread, pc } => write!(f, "[thread {thread}] single step, pc = {pc}"),
            Self::Signal { thread, signal, passed } => {
                let name = crate::signals::signal_name(*signal).unwrap_or("unknown signal");
                write!(f, "[thread {thread}] received signal {signal}, {name}")?;
                if *passed {
                    f.write_str(", passed to target")?;
                }
                Ok(())
            }
            Self::Exception {
                thread,
                exception,
                codes,
            } => {
                write!(f, "[thread {thread}] {exception}")?;
                for code in codes {
                    write!(f, " {code:#x}")?;
                }
                Ok(())
            }
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// The target stopped and is waiting for a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopEvent
{
    /// Thread that caused the stop, if any
    pub thread: Option<ThreadId>,
    /// What to show; `None` when the signal policy suppresses reporting
    pub report: Option<TrapEvent>,
}

impl fmt::Display for StopEvent
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match (&self.report, self.thread) {
            (Some(report), _) => write!(f, "{report}"),
            (None, Some(thread)) => write!(f, "[thread {thread}] stopped"),
            (None, None) => f.write_str("stopped"),
        }
    }
}

/// Event emitted by the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerEvent
{
    /// Target stopped.
    Stopped(StopEvent),
    /// A trap was reported but the target kept running.
    Notification(TrapEvent),
    /// Target resumed after a command.
    Resumed,
    /// Session ended.
    Detached
    {
        /// Whether the target died rather than being released
        target_died: bool,
    },
}

impl DebuggerEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Stopped(stop) => stop.to_string(),
            Self::Notification(report) => report.to_string(),
            Self::Resumed => "Target resumed execution".to_string(),
            Self::Detached { target_died: true } => "Target exited, detached".to_string(),
            Self::Detached { target_died: false } => "Detached".to_string(),
        }
    }
}

/// Sender side of the debugger event channel.
pub type DebuggerEventSender = mpsc::Sender<DebuggerEvent>;
/// Receiver side of the debugger event channel.
pub type DebuggerEventReceiver = mpsc::Receiver<DebuggerEvent>;

/// Create a new debugger event channel.
#[must_use]
pub fn event_channel() -> (DebuggerEventSender, DebuggerEventReceiver)
{
    mpsc::channel()
}

/// Fan-out list of subscribers; disconnected receivers are dropped on send.
#[derive(Debug, Default)]
pub(crate) struct Subscribers
{
    senders: Vec<DebuggerEventSender>,
}

impl Subscribers
{
    pub(crate) fn add(&mut self) -> DebuggerEventReceiver
    {
        let (tx, rx) = event_channel();
        self.senders.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, event: &DebuggerEvent)
    {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
