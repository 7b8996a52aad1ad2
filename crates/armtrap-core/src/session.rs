//! # Debuggee
//!
//! Everything the debugger knows about the attached process. One value
//! exists per session and it lives behind the debugger's session mutex; the
//! listener thread and the command thread both take that mutex before
//! touching any of it.

use tracing::debug;

use crate::breakpoints::{BreakpointId, BreakpointManager};
use crate::controller::{ProcessController, TaskInfo};
use crate::error::{ArmtrapError, ArmtrapResult};
use crate::threads::ThreadRegistry;
use crate::types::{Address, ProcessId, ThreadId, ThreadPort};
use crate::watchpoints::{WatchpointId, WatchpointManager};

/// Where the most recent watchpoint fault happened.
///
/// Held between the fault and the completion of the step that retires the
/// access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchpointSite
{
    /// Watchpoint that fired
    pub id: WatchpointId,
    /// Address reported by the fault
    pub address: Address,
    /// PC of the accessing instruction
    pub pc: Address,
}

/// The attached process.
#[derive(Debug)]
pub struct Debuggee
{
    /// Target pid
    pub pid: ProcessId,
    /// Process name
    pub name: String,
    /// Load address of the main image minus its link-time base
    pub aslr_slide: u64,
    /// Target is stopped, either by a trap or by the user
    pub interrupted: bool,
    /// A detach has been requested
    pub want_detach: bool,
    /// `Some(thread)` while a user-requested step on `thread` is in flight
    pub single_stepping: Option<ThreadId>,
    /// Breakpoint register pairs on this core
    pub hw_breakpoints: usize,
    /// Watchpoint register pairs on this core
    pub hw_watchpoints: usize,
    /// Breakpoints
    pub breakpoints: BreakpointManager,
    /// Watchpoints
    pub watchpoints: WatchpointManager,
    /// Threads
    pub threads: ThreadRegistry,
    /// Breakpoint reported by the latest stop
    pub last_hit_breakpoint: Option<BreakpointId>,
    /// Watchpoint fault awaiting its step
    pub last_hit_watchpoint: Option<WatchpointSite>,
    /// Ports suspended by the stop in progress; empty while running
    pub suspended: Vec<ThreadPort>,
}

impl Debuggee
{
    /// Fresh record for a target just attached to.
    ///
    /// `load_base` is the link-time address of the main image; the slide is
    /// how far above it the first mapped region landed.
    pub fn new(pid: ProcessId, info: TaskInfo, first_region: Address, load_base: u64) -> Self
    {
        let aslr_slide = first_region.value().saturating_sub(load_base);
        debug!(%pid, slide = format_args!("{aslr_slide:#x}"), "new debuggee");
        Self {
            pid,
            name: info.name,
            aslr_slide,
            interrupted: false,
            want_detach: false,
            single_stepping: None,
            hw_breakpoints: info.hw_breakpoints,
            hw_watchpoints: info.hw_watchpoints,
            breakpoints: BreakpointManager::new(info.hw_breakpoints),
            watchpoints: WatchpointManager::new(info.hw_watchpoints),
            threads: ThreadRegistry::new(),
            last_hit_breakpoint: None,
            last_hit_watchpoint: None,
            suspended: Vec::new(),
        }
    }

    /// Refresh the thread list and replay all-threads breakpoints and
    /// watchpoints onto threads seen for the first time.
    pub fn sync_threads(&mut self, ctl: &dyn ProcessController) -> ArmtrapResult<Vec<ThreadId>>
    {
        let added = self.threads.refresh(ctl)?;
        for thread in &added {
            self.breakpoints.program_thread(ctl, &mut self.threads, *thread)?;
            self.watchpoints.program_thread(ctl, &mut self.threads, *thread)?;
        }
        Ok(added)
    }

    /// Registry id of the thread behind `port`, refreshing once if it is new.
    ///
    /// ## Errors
    ///
    /// `ProtocolError` if the port is still unknown after the refresh.
    pub fn resolve_thread(&mut self, ctl: &dyn ProcessController, port: ThreadPort) -> ArmtrapResult<ThreadId>
    {
        if let Some(id) = self.threads.id_for_port(port) {
            return Ok(id);
        }
        self.sync_threads(ctl)?;
        self.threads
            .id_for_port(port)
            .ok_or_else(|| ArmtrapError::ProtocolError(format!("trap from unknown thread {port}")))
    }

    /// Fail with `NotStopped` unless the target is stopped.
    pub fn require_stopped(&self) -> ArmtrapResult<()>
    {
        if self.interrupted {
            Ok(())
        } else {
            Err(ArmtrapError::NotStopped)
        }
    }
}
