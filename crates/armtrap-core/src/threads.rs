//! # Thread Registry
//!
//! Per-session table of the target's threads.
//!
//! Threads are keyed by a registry-assigned [`ThreadId`] that stays stable
//! while the thread lives and is never handed out twice. The registry also
//! caches each thread's general and debug registers and carries the
//! transient `just_hit_*` flags the exception dispatcher uses to sequence a
//! step-over.
//!
//! Exactly one thread is focused at any time while the registry is non-empty.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::breakpoints::BreakpointId;
use crate::controller::ProcessController;
use crate::debug_state::DebugState;
use crate::error::{ArmtrapError, ArmtrapResult, ObjectKind};
use crate::types::{Arm64Registers, ThreadId, ThreadPort};

/// Cached view of one target thread.
#[derive(Debug, Clone)]
pub struct ThreadState
{
    /// Registry id
    pub id: ThreadId,
    /// OS handle
    pub port: ThreadPort,
    /// Kernel thread id
    pub kernel_id: u64,
    /// Thread name (may be empty)
    pub name: String,
    /// Last general registers read
    pub registers: Arm64Registers,
    /// Last debug registers written or read
    pub debug: DebugState,
    /// Thread trapped on a breakpoint and is stepping over it
    pub just_hit_breakpoint: bool,
    /// The breakpoint it trapped on was software
    pub just_hit_software_breakpoint: bool,
    /// Thread faulted on a watchpoint and is stepping the access
    pub just_hit_watchpoint: bool,
    /// Breakpoints disabled while this thread steps over them
    pub stepped_over: SmallVec<[BreakpointId; 2]>,
}

impl ThreadState
{
    /// Clear every transient flag.
    pub fn clear_transient(&mut self)
    {
        self.just_hit_breakpoint = false;
        self.just_hit_software_breakpoint = false;
        self.just_hit_watchpoint = false;
        self.stepped_over.clear();
    }
}

/// Table of threads plus the focused one.
#[derive(Debug, Default)]
pub struct ThreadRegistry
{
    threads: BTreeMap<ThreadId, ThreadState>,
    next_id: u32,
    focused: Option<ThreadId>,
}

impl ThreadRegistry
{
    /// Empty registry; ids start at 1.
    pub fn new() -> Self
    {
        Self {
            threads: BTreeMap::new(),
            next_id: 1,
            focused: None,
        }
    }

    /// Synchronise with the OS thread list.
    ///
    /// Threads that disappeared are dropped, new ones get the next id and a
    /// fresh register snapshot. Returns the ids of new threads so callers
    /// can replay scope-wide breakpoints and watchpoints onto them.
    pub fn refresh(&mut self, ctl: &dyn ProcessController) -> ArmtrapResult<Vec<ThreadId>>
    {
        let live = ctl.threads()?;

        self.threads.retain(|_, t| live.iter().any(|info| info.port == t.port));

        let mut added = Vec::new();
        for info in live {
            if self.threads.values().any(|t| t.port == info.port) {
                continue;
            }
            let id = ThreadId(self.next_id);
            self.next_id += 1;
            let registers = ctl.registers(info.port)?;
            let debug = ctl.debug_state(info.port)?;
            trace!(%id, port = %info.port, "new thread");
            self.threads.insert(
                id,
                ThreadState {
                    id,
                    port: info.port,
                    kernel_id: info.kernel_id,
                    name: info.name,
                    registers,
                    debug,
                    just_hit_breakpoint: false,
                    just_hit_software_breakpoint: false,
                    just_hit_watchpoint: false,
                    stepped_over: SmallVec::new(),
                },
            );
            added.push(id);
        }

        if self.focused.is_none_or(|id| !self.threads.contains_key(&id)) {
            self.focused = self.threads.keys().next().copied();
        }

        if !added.is_empty() {
            debug!(count = added.len(), total = self.threads.len(), "thread list updated");
        }
        Ok(added)
    }

    /// Threads in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadState>
    {
        self.threads.values()
    }

    /// Number of known threads.
    pub fn len(&self) -> usize
    {
        self.threads.len()
    }

    /// Whether no threads are known.
    pub fn is_empty(&self) -> bool
    {
        self.threads.is_empty()
    }

    /// Look up a thread.
    pub fn get(&self, id: ThreadId) -> ArmtrapResult<&ThreadState>
    {
        self.threads.get(&id).ok_or_else(|| ArmtrapError::not_found(ObjectKind::Thread, id))
    }

    /// Look up a thread mutably.
    pub fn get_mut(&mut self, id: ThreadId) -> ArmtrapResult<&mut ThreadState>
    {
        self.threads.get_mut(&id).ok_or_else(|| ArmtrapError::not_found(ObjectKind::Thread, id))
    }

    /// Registry id of the thread behind `port`.
    pub fn id_for_port(&self, port: ThreadPort) -> Option<ThreadId>
    {
        self.threads.values().find(|t| t.port == port).map(|t| t.id)
    }

    /// The focused thread's id.
    pub fn focused(&self) -> Option<ThreadId>
    {
        self.focused
    }

    /// Focus a thread by id.
    pub fn focus(&mut self, id: ThreadId) -> ArmtrapResult<()>
    {
        self.get(id)?;
        self.focused = Some(id);
        Ok(())
    }

    /// Whether some thread is in the middle of stepping over `id`.
    pub fn stepping_over(&self, id: BreakpointId) -> bool
    {
        self.threads.values().any(|t| t.stepped_over.contains(&id))
    }

    /// Drop `id` from every pending step-over so that finishing the step
    /// leaves it alone.
    pub fn forget_stepped_over(&mut self, id: BreakpointId)
    {
        for thread in self.threads.values_mut() {
            thread.stepped_over.retain(|held| *held != id);
        }
    }

    /// Re-read the general registers of `id`.
    pub fn refresh_registers(&mut self, ctl: &dyn ProcessController, id: ThreadId) -> ArmtrapResult<Arm64Registers>
    {
        let thread = self.get_mut(id)?;
        thread.registers = ctl.registers(thread.port)?;
        Ok(thread.registers)
    }

    /// Read-modify-write the debug registers of `id`.
    ///
    /// The current state is fetched from the OS first so that changes made
    /// behind the registry's back (by the kernel on exec, say) are not lost.
    pub fn modify_debug_state<F>(&mut self, ctl: &dyn ProcessController, id: ThreadId, change: F) -> ArmtrapResult<()>
    where
        F: FnOnce(&mut DebugState),
    {
        let thread = self.get_mut(id)?;
        let mut state = ctl.debug_state(thread.port)?;
        change(&mut state);
        ctl.set_debug_state(thread.port, &state)?;
        thread.debug = state;
        Ok(())
    }

    /// Ids of every thread, or just `id`, matching a scope.
    pub fn scoped(&self, scope: ThreadScope) -> ArmtrapResult<Vec<ThreadId>>
    {
        match scope {
            ThreadScope::All => Ok(self.threads.keys().copied().collect()),
            ThreadScope::Thread(id) => {
                self.get(id)?;
                Ok(vec![id])
            }
        }
    }
}

/// Which threads a breakpoint or watchpoint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadScope
{
    /// Every thread, including ones created later
    #[default]
    All,
    /// One thread only
    Thread(ThreadId),
}

impl ThreadScope
{
    /// Whether a trap on `thread` falls inside this scope.
    pub fn includes(self, thread: ThreadId) -> bool
    {
        match self {
            Self::All => true,
            Self::Thread(id) => id == thread,
        }
    }
}
