//! # Simulated Target
//!
//! An in-process [`ProcessController`] that models just enough of a Mach
//! task to exercise the trap engine without a real debuggee:
//!
//! - sparse memory regions
//! - threads with suspend counts, general registers and debug registers
//! - a trap queue with reply tokens
//! - single-step: whenever the task runs, every runnable thread with
//!   `MDSCR_EL1.SS` set retires one instruction (PC += 4) and raises a step
//!   trap
//!
//! Tests drive execution explicitly with [`SimulatedController::run_to`],
//! [`SimulatedController::store`] and [`SimulatedController::inject_trap`].
//!
//! ## Example
//!
//! ```rust
//! use armtrap_core::controller::ProcessController;
//! use armtrap_core::platform::simulated::SimulatedController;
//! use armtrap_core::types::{Address, ProcessId, ThreadPort};
//!
//! let sim = SimulatedController::new(100)
//!     .with_region(0x1_0000_0000, vec![0; 0x4000])
//!     .with_thread(ThreadPort(0x103), 0x1_0000_0000);
//! let info = sim.attach(ProcessId(100))?;
//! assert_eq!(info.hw_breakpoints, 6);
//! assert_eq!(sim.read_memory(Address::new(0x1_0000_0000), 4)?, vec![0; 4]);
//! # Ok::<(), armtrap_core::error::ArmtrapError>(())
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace, warn};

use crate::breakpoints::TRAP_OPCODE;
use crate::controller::{ProcessController, ReplyToken, TaskInfo, ThreadInfo, TrapMessage};
use crate::debug_state::DebugState;
use crate::error::{ArmtrapError, ArmtrapResult};
use crate::exception::{ExceptionType, EXC_ARM_BREAKPOINT, EXC_ARM_DA_DEBUG, EXC_SOFT_SIGNAL};
use crate::types::{Address, Arm64Registers, ProcessId, ThreadPort};

/// A pending memory store, applied when the thread retires its next step.
type StoreEffect = (Address, Vec<u8>);

#[derive(Debug)]
struct SimThread
{
    port: ThreadPort,
    kernel_id: u64,
    name: String,
    registers: Arm64Registers,
    debug: DebugState,
    suspend_count: u32,
    blocked_on: Option<ReplyToken>,
    pending_stores: Vec<StoreEffect>,
}

impl SimThread
{
    fn runnable(&self, task_suspend_count: u32) -> bool
    {
        task_suspend_count == 0 && self.suspend_count == 0 && self.blocked_on.is_none()
    }
}

#[derive(Debug)]
struct SimState
{
    pid: ProcessId,
    name: String,
    hw_breakpoints: usize,
    hw_watchpoints: usize,
    alive: bool,
    attached: bool,
    released: bool,
    deny_attach: bool,
    handler_registered: bool,
    detached: Option<bool>,
    task_suspend_count: u32,
    regions: BTreeMap<u64, Vec<u8>>,
    threads: Vec<SimThread>,
    traps: VecDeque<TrapMessage>,
    next_token: u64,
    replies: Vec<(ReplyToken, bool)>,
    signals: Vec<(ThreadPort, Option<i32>)>,
}

impl SimState
{
    fn thread_mut(&mut self, port: ThreadPort) -> ArmtrapResult<&mut SimThread>
    {
        self.threads
            .iter_mut()
            .find(|t| t.port == port)
            .ok_or_else(|| ArmtrapError::InvalidArgument(format!("no thread with port {port}")))
    }

    fn thread(&self, port: ThreadPort) -> ArmtrapResult<&SimThread>
    {
        self.threads
            .iter()
            .find(|t| t.port == port)
            .ok_or_else(|| ArmtrapError::InvalidArgument(format!("no thread with port {port}")))
    }

    fn region_for(&mut self, address: Address, len: usize) -> Option<(&mut Vec<u8>, usize)>
    {
        let (base, bytes) = self.regions.range_mut(..=address.value()).next_back()?;
        let offset = usize::try_from(address.value() - base).ok()?;
        if offset.checked_add(len)? > bytes.len() {
            return None;
        }
        Some((bytes, offset))
    }

    fn write(&mut self, address: Address, data: &[u8]) -> ArmtrapResult<()>
    {
        let (bytes, offset) = self
            .region_for(address, data.len())
            .ok_or_else(|| ArmtrapError::invalid_address(address.value(), "unmapped"))?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, address: Address, len: usize) -> ArmtrapResult<Vec<u8>>
    {
        let (bytes, offset) = self
            .region_for(address, len)
            .ok_or_else(|| ArmtrapError::invalid_address(address.value(), "unmapped"))?;
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn raise(&mut self, index: usize, exception: ExceptionType, codes: SmallVec<[i64; 2]>, front: bool) -> ReplyToken
    {
        self.next_token += 1;
        let token = ReplyToken(self.next_token);
        let thread = &mut self.threads[index];
        thread.blocked_on = Some(token);
        let message = TrapMessage {
            token,
            thread: thread.port,
            exception,
            codes,
        };
        trace!(?message, "simulated trap");
        if front {
            self.traps.push_front(message);
        } else {
            self.traps.push_back(message);
        }
        token
    }

    /// Drop every queued trap the way destroying the exception port does:
    /// the raising threads go on without a reply being recorded.
    fn discard_queued(&mut self) -> usize
    {
        let dropped: Vec<ReplyToken> = self.traps.drain(..).map(|message| message.token).collect();
        for thread in &mut self.threads {
            if thread.blocked_on.is_some_and(|token| dropped.contains(&token)) {
                thread.blocked_on = None;
            }
        }
        dropped.len()
    }

    /// Let every runnable thread with single-step armed retire one instruction.
    fn run_steps(&mut self)
    {
        if !self.alive {
            return;
        }
        for index in 0..self.threads.len() {
            let thread = &mut self.threads[index];
            if !thread.runnable(self.task_suspend_count) || !thread.debug.single_step() {
                continue;
            }
            thread.registers.pc += 4;
            let stores = std::mem::take(&mut thread.pending_stores);
            for (address, data) in stores {
                let _ = self.write(address, &data);
            }
            self.raise(index, ExceptionType::Breakpoint, smallvec![EXC_ARM_BREAKPOINT, 0], true);
        }
    }

    fn breakpoint_armed_at(&mut self, index: usize, address: Address) -> bool
    {
        let debug = &self.threads[index].debug;
        let hardware = (0..self.hw_breakpoints).any(|i| debug.bcr[i] & 1 == 1 && debug.bvr[i] == address.value() & !0x3);
        hardware || self.read(address, 4).is_ok_and(|bytes| bytes == TRAP_OPCODE)
    }

    fn watchpoint_armed_for(&self, index: usize, address: Address, len: usize) -> bool
    {
        let debug = &self.threads[index].debug;
        (0..self.hw_watchpoints).any(|i| {
            let control = debug.wcr[i];
            let stores = (control >> 3) & 0b10 != 0;
            if control & 1 == 0 || !stores {
                return false;
            }
            let bas = (control >> 5) & 0xff;
            (0..len as u64).any(|k| {
                let byte = address.value() + k;
                byte & !0x7 == debug.wvr[i] && bas & (1 << (byte & 0x7)) != 0
            })
        })
    }
}

/// In-process stand-in for a debuggable task.
#[derive(Debug)]
pub struct SimulatedController
{
    state: Mutex<SimState>,
    changed: Condvar,
}

impl SimulatedController
{
    /// A live process `pid` named `sim` with 6 breakpoint and 4 watchpoint
    /// register pairs, no memory and no threads.
    pub fn new(pid: u32) -> Self
    {
        Self {
            state: Mutex::new(SimState {
                pid: ProcessId(pid),
                name: "sim".to_string(),
                hw_breakpoints: 6,
                hw_watchpoints: 4,
                alive: true,
                attached: false,
                released: false,
                deny_attach: false,
                handler_registered: false,
                detached: None,
                task_suspend_count: 0,
                regions: BTreeMap::new(),
                threads: Vec::new(),
                traps: VecDeque::new(),
                next_token: 0,
                replies: Vec::new(),
                signals: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Override the debug register counts.
    #[must_use]
    pub fn with_hardware(self, breakpoints: usize, watchpoints: usize) -> Self
    {
        {
            let mut state = self.lock();
            state.hw_breakpoints = breakpoints;
            state.hw_watchpoints = watchpoints;
        }
        self
    }

    /// Map `bytes` at `base`.
    #[must_use]
    pub fn with_region(self, base: u64, bytes: Vec<u8>) -> Self
    {
        self.lock().regions.insert(base, bytes);
        self
    }

    /// Add a thread whose PC is `pc`.
    #[must_use]
    pub fn with_thread(self, port: ThreadPort, pc: u64) -> Self
    {
        self.add_thread(port, pc);
        self
    }

    /// Make the next attach fail as if entitlements were missing.
    #[must_use]
    pub fn deny_attach(self) -> Self
    {
        self.lock().deny_attach = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState>
    {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Spawn a thread in the running target.
    pub fn add_thread(&self, port: ThreadPort, pc: u64)
    {
        let mut state = self.lock();
        let kernel_id = 0x1000 + state.threads.len() as u64;
        let name = if state.threads.is_empty() {
            "main".to_string()
        } else {
            String::new()
        };
        state.threads.push(SimThread {
            port,
            kernel_id,
            name,
            registers: Arm64Registers {
                pc,
                ..Arm64Registers::default()
            },
            debug: DebugState::default(),
            suspend_count: 0,
            blocked_on: None,
            pending_stores: Vec::new(),
        });
        self.changed.notify_all();
    }

    /// Move `port` to `address`. If a hardware or software breakpoint is
    /// armed there the thread traps and `true` is returned.
    ///
    /// Nothing happens (and `false` is returned) unless the thread is
    /// runnable: task and thread resumed and no trap outstanding.
    pub fn run_to(&self, port: ThreadPort, address: u64) -> bool
    {
        let mut state = self.lock();
        let suspend = state.task_suspend_count;
        let Some(index) = state.threads.iter().position(|t| t.port == port && t.runnable(suspend)) else {
            return false;
        };
        state.threads[index].registers.pc = address;
        let address = Address::new(address);
        if !state.breakpoint_armed_at(index, address) {
            return false;
        }
        #[allow(clippy::cast_possible_wrap)]
        let subcode = address.value() as i64;
        state.raise(index, ExceptionType::Breakpoint, smallvec![EXC_ARM_BREAKPOINT, subcode], false);
        self.changed.notify_all();
        true
    }

    /// Move the PC of `port` without running anything.
    pub fn set_pc(&self, port: ThreadPort, pc: u64) -> ArmtrapResult<()>
    {
        self.lock().thread_mut(port)?.registers.pc = pc;
        Ok(())
    }

    /// Execute a store of `data` at `address` on `port`.
    ///
    /// If a write watchpoint covers the range the store is held back, a
    /// data-abort debug trap is raised and the store lands once the thread
    /// single-steps. Otherwise memory is written immediately.
    pub fn store(&self, port: ThreadPort, address: u64, data: &[u8]) -> ArmtrapResult<bool>
    {
        let mut state = self.lock();
        let suspend = state.task_suspend_count;
        let index = state
            .threads
            .iter()
            .position(|t| t.port == port)
            .ok_or_else(|| ArmtrapError::InvalidArgument(format!("no thread with port {port}")))?;
        if !state.threads[index].runnable(suspend) {
            return Err(ArmtrapError::NotStopped);
        }
        let address = Address::new(address);
        if !state.watchpoint_armed_for(index, address, data.len()) {
            state.write(address, data)?;
            return Ok(false);
        }
        state.threads[index].pending_stores.push((address, data.to_vec()));
        #[allow(clippy::cast_possible_wrap)]
        let subcode = address.value() as i64;
        state.raise(index, ExceptionType::Breakpoint, smallvec![EXC_ARM_DA_DEBUG, subcode], false);
        self.changed.notify_all();
        Ok(true)
    }

    /// Raise an arbitrary exception on `port`.
    pub fn inject_trap(&self, port: ThreadPort, exception: ExceptionType, codes: &[i64]) -> ArmtrapResult<ReplyToken>
    {
        let mut state = self.lock();
        let index = state
            .threads
            .iter()
            .position(|t| t.port == port)
            .ok_or_else(|| ArmtrapError::InvalidArgument(format!("no thread with port {port}")))?;
        let token = state.raise(index, exception, SmallVec::from_slice(codes), false);
        self.changed.notify_all();
        Ok(token)
    }

    /// Deliver `signal` to `port` as a soft-signal exception.
    pub fn raise_signal(&self, port: ThreadPort, signal: i32) -> ArmtrapResult<ReplyToken>
    {
        self.inject_trap(port, ExceptionType::Software, &[EXC_SOFT_SIGNAL, i64::from(signal)])
    }

    /// Terminate the target. Blocked receives stay blocked until release.
    pub fn kill(&self)
    {
        self.lock().alive = false;
        self.changed.notify_all();
    }

    /// Wait until no trap is queued or outstanding and the task is running.
    pub fn wait_idle(&self, timeout: Duration) -> bool
    {
        self.wait_until(timeout, |s| {
            s.traps.is_empty() && s.task_suspend_count == 0 && s.threads.iter().all(|t| t.blocked_on.is_none())
        })
    }

    /// Wait until `predicate` holds over the simulated state.
    fn wait_until(&self, timeout: Duration, predicate: impl Fn(&SimState) -> bool) -> bool
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !predicate(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Every reply sent so far, in order.
    pub fn replies(&self) -> Vec<(ReplyToken, bool)>
    {
        self.lock().replies.clone()
    }

    /// Every soft-signal resolution so far, in order.
    pub fn signal_updates(&self) -> Vec<(ThreadPort, Option<i32>)>
    {
        self.lock().signals.clone()
    }

    /// Read memory without going through the controller interface.
    pub fn peek(&self, address: u64, len: usize) -> Option<Vec<u8>>
    {
        self.lock().read(Address::new(address), len).ok()
    }

    /// Debug registers of `port` as the hardware sees them.
    pub fn thread_debug_state(&self, port: ThreadPort) -> Option<DebugState>
    {
        self.lock().thread(port).ok().map(|t| t.debug)
    }

    /// Program counter of `port`.
    pub fn thread_pc(&self, port: ThreadPort) -> Option<u64>
    {
        self.lock().thread(port).ok().map(|t| t.registers.pc)
    }

    /// Task suspend count.
    pub fn task_suspend_count(&self) -> u32
    {
        self.lock().task_suspend_count
    }

    /// Suspend count of `port`.
    pub fn thread_suspend_count(&self, port: ThreadPort) -> Option<u32>
    {
        self.lock().thread(port).ok().map(|t| t.suspend_count)
    }

    /// Whether the exception ports currently point at the debugger.
    pub fn trap_handler_registered(&self) -> bool
    {
        self.lock().handler_registered
    }

    /// `Some(graceful)` once [`ProcessController::detach`] ran.
    pub fn detached(&self) -> Option<bool>
    {
        self.lock().detached
    }

    /// Whether [`ProcessController::release`] has been called since attach.
    pub fn is_released(&self) -> bool
    {
        self.lock().released
    }
}

impl ProcessController for SimulatedController
{
    fn attach(&self, pid: ProcessId) -> ArmtrapResult<TaskInfo>
    {
        let mut state = self.lock();
        if !state.alive || state.pid != pid {
            return Err(ArmtrapError::ProcessNotFound(pid.0));
        }
        if state.deny_attach {
            return Err(ArmtrapError::PermissionDenied(format!("task_for_pid({pid}) refused")));
        }
        let stale = state.discard_queued();
        if stale > 0 {
            debug!(stale, "discarded traps left from the previous session");
        }
        state.attached = true;
        state.released = false;
        state.detached = None;
        Ok(TaskInfo {
            name: state.name.clone(),
            hw_breakpoints: state.hw_breakpoints,
            hw_watchpoints: state.hw_watchpoints,
        })
    }

    fn detach(&self, graceful: bool) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        state.attached = false;
        state.detached = Some(graceful);
        Ok(())
    }

    fn suspend(&self) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        if !state.alive {
            return Err(ArmtrapError::SuspendFailed("task is gone".to_string()));
        }
        state.task_suspend_count += 1;
        Ok(())
    }

    fn resume(&self) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        if state.task_suspend_count == 0 {
            return Err(ArmtrapError::ResumeFailed("task is not suspended".to_string()));
        }
        state.task_suspend_count -= 1;
        state.run_steps();
        self.changed.notify_all();
        Ok(())
    }

    fn suspend_thread(&self, port: ThreadPort) -> ArmtrapResult<()>
    {
        self.lock().thread_mut(port)?.suspend_count += 1;
        Ok(())
    }

    fn resume_thread(&self, port: ThreadPort) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        let thread = state.thread_mut(port)?;
        if thread.suspend_count == 0 {
            return Err(ArmtrapError::ResumeFailed(format!("thread {port} is not suspended")));
        }
        thread.suspend_count -= 1;
        state.run_steps();
        self.changed.notify_all();
        Ok(())
    }

    fn threads(&self) -> ArmtrapResult<Vec<ThreadInfo>>
    {
        let state = self.lock();
        if !state.alive {
            return Err(ArmtrapError::TargetDied(state.pid.0));
        }
        Ok(state
            .threads
            .iter()
            .map(|t| ThreadInfo {
                port: t.port,
                kernel_id: t.kernel_id,
                name: t.name.clone(),
            })
            .collect())
    }

    fn read_memory(&self, address: Address, len: usize) -> ArmtrapResult<Vec<u8>>
    {
        self.lock().read(address, len)
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> ArmtrapResult<()>
    {
        self.lock().write(address, data)
    }

    fn first_region_base(&self) -> ArmtrapResult<Address>
    {
        self.lock()
            .regions
            .keys()
            .next()
            .map(|base| Address::new(*base))
            .ok_or_else(|| ArmtrapError::invalid_address(0, "no mapped regions"))
    }

    fn registers(&self, port: ThreadPort) -> ArmtrapResult<Arm64Registers>
    {
        Ok(self.lock().thread(port)?.registers)
    }

    fn debug_state(&self, port: ThreadPort) -> ArmtrapResult<DebugState>
    {
        Ok(self.lock().thread(port)?.debug)
    }

    fn set_debug_state(&self, port: ThreadPort, debug: &DebugState) -> ArmtrapResult<()>
    {
        self.lock().thread_mut(port)?.debug = *debug;
        Ok(())
    }

    fn register_trap_handler(&self) -> ArmtrapResult<()>
    {
        self.lock().handler_registered = true;
        Ok(())
    }

    fn restore_trap_handler(&self) -> ArmtrapResult<()>
    {
        self.lock().handler_registered = false;
        Ok(())
    }

    fn receive_trap(&self) -> ArmtrapResult<Option<TrapMessage>>
    {
        let mut state = self.lock();
        loop {
            if state.released {
                return Ok(None);
            }
            if let Some(message) = state.traps.pop_front() {
                self.changed.notify_all();
                return Ok(Some(message));
            }
            state = self.changed.wait(state).unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn try_receive_trap(&self) -> ArmtrapResult<Option<TrapMessage>>
    {
        let mut state = self.lock();
        if state.released {
            return Ok(None);
        }
        let message = state.traps.pop_front();
        if message.is_some() {
            self.changed.notify_all();
        }
        Ok(message)
    }

    fn reply_trap(&self, token: ReplyToken, success: bool) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        let thread = state
            .threads
            .iter_mut()
            .find(|t| t.blocked_on == Some(token))
            .ok_or_else(|| ArmtrapError::ProtocolError(format!("reply to unknown trap {}", token.0)))?;
        thread.blocked_on = None;
        state.replies.push((token, success));
        state.run_steps();
        self.changed.notify_all();
        Ok(())
    }

    fn update_thread_signal(&self, port: ThreadPort, signal: Option<i32>) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        state.thread(port)?;
        state.signals.push((port, signal));
        Ok(())
    }

    fn is_alive(&self) -> bool
    {
        self.lock().alive
    }

    fn release(&self)
    {
        let mut state = self.lock();
        state.released = true;
        state.attached = false;
        let dropped = state.discard_queued();
        if dropped > 0 {
            warn!(dropped, "released with traps still queued");
        }
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const BASE: u64 = 0x1_0000_0000;

    fn sim() -> SimulatedController
    {
        SimulatedController::new(7)
            .with_region(BASE, vec![0xaa; 0x100])
            .with_thread(ThreadPort(1), BASE)
    }

    #[test]
    fn test_memory_bounds()
    {
        let sim = sim();
        assert!(sim.read_memory(Address::new(BASE + 0xfc), 4).is_ok());
        assert!(sim.read_memory(Address::new(BASE + 0xfd), 4).is_err());
        assert!(sim.read_memory(Address::new(0x10), 1).is_err());
    }

    #[test]
    fn test_single_step_raises_trap_when_task_runs()
    {
        let sim = sim();
        sim.suspend().unwrap();
        let mut debug = DebugState::default();
        debug.set_single_step(true);
        sim.set_debug_state(ThreadPort(1), &debug).unwrap();
        sim.resume().unwrap();

        let trap = sim.receive_trap().unwrap().unwrap();
        assert_eq!(trap.exception, ExceptionType::Breakpoint);
        assert_eq!(trap.codes.as_slice(), &[EXC_ARM_BREAKPOINT, 0]);
        assert_eq!(sim.thread_pc(ThreadPort(1)), Some(BASE + 4));
    }

    #[test]
    fn test_double_reply_is_rejected()
    {
        let sim = sim();
        let token = sim.inject_trap(ThreadPort(1), ExceptionType::BadAccess, &[1, 0]).unwrap();
        sim.reply_trap(token, true).unwrap();
        assert!(sim.reply_trap(token, true).is_err());
        assert_eq!(sim.replies().len(), 1);
    }

    #[test]
    fn test_release_unblocks_receive()
    {
        let sim = std::sync::Arc::new(sim());
        let receiver = {
            let sim = sim.clone();
            std::thread::spawn(move || sim.receive_trap())
        };
        sim.release();
        assert!(receiver.join().unwrap().unwrap().is_none());
    }

    #[test]
    fn test_try_receive_does_not_block()
    {
        let sim = sim();
        assert!(sim.try_receive_trap().unwrap().is_none());
        let token = sim.inject_trap(ThreadPort(1), ExceptionType::BadAccess, &[1, 0]).unwrap();
        assert_eq!(sim.try_receive_trap().unwrap().map(|trap| trap.token), Some(token));
        assert!(sim.try_receive_trap().unwrap().is_none());
    }

    #[test]
    fn test_reattach_starts_with_an_empty_port()
    {
        let sim = sim();
        sim.attach(ProcessId(7)).unwrap();
        sim.inject_trap(ThreadPort(1), ExceptionType::BadAccess, &[1, 0]).unwrap();
        sim.release();
        assert!(sim.try_receive_trap().unwrap().is_none());

        // Raised between sessions, with nobody listening.
        sim.inject_trap(ThreadPort(1), ExceptionType::BadAccess, &[1, 0]).unwrap();
        sim.attach(ProcessId(7)).unwrap();
        assert!(!sim.is_released());
        assert!(sim.try_receive_trap().unwrap().is_none());
        assert!(sim.replies().is_empty());
        assert!(sim.wait_idle(Duration::from_millis(10)));
    }
}
