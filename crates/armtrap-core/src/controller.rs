//! # Process Controller
//!
//! The capability interface between the trap engine and the operating system.
//!
//! Everything above this trait is OS-agnostic: breakpoint bookkeeping,
//! trap classification, stepping and the reply protocol only ever talk to a
//! `&dyn ProcessController`. One implementation exists per target OS
//! ([`crate::platform::macos::MachController`]) plus an in-process
//! [`crate::platform::simulated::SimulatedController`] that the test suite
//! drives.
//!
//! ## Threading
//!
//! All methods take `&self`. The listener thread blocks in
//! [`ProcessController::receive_trap`] while the command thread keeps
//! reading memory and programming debug registers, so implementations use
//! interior mutability and must be `Send + Sync`.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::debug_state::DebugState;
use crate::error::{ArmtrapError, ArmtrapResult};
use crate::exception::ExceptionType;
use crate::types::{Address, Arm64Registers, ProcessId, ThreadPort};

/// Opaque handle identifying an outstanding trap.
///
/// Every token must be passed to [`ProcessController::reply_trap`] exactly
/// once. The [`crate::resume::ResumeSynchronizer`] enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyToken(pub u64);

/// A trap delivered by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapMessage
{
    /// Reply handle
    pub token: ReplyToken,
    /// Faulting thread
    pub thread: ThreadPort,
    /// Exception class
    pub exception: ExceptionType,
    /// `code` and `subcode`; some exceptions carry fewer
    pub codes: SmallVec<[i64; 2]>,
}

/// What [`ProcessController::attach`] learns about the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo
{
    /// Process name
    pub name: String,
    /// Implemented breakpoint register pairs
    pub hw_breakpoints: usize,
    /// Implemented watchpoint register pairs
    pub hw_watchpoints: usize,
}

/// One thread as enumerated by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo
{
    /// OS handle
    pub port: ThreadPort,
    /// Kernel thread id
    pub kernel_id: u64,
    /// Thread name, empty if unnamed
    pub name: String,
}

/// OS capabilities needed to debug one process.
///
/// A controller serves one target at a time. After
/// [`ProcessController::release`] it may be attached again.
pub trait ProcessController: Send + Sync
{
    /// Acquire the target's process handle.
    ///
    /// Does not suspend or install the trap handler; callers do that
    /// through [`suspend_all`] and [`ProcessController::register_trap_handler`].
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: no such process
    /// - `PermissionDenied`: the OS refused a debugger handle
    fn attach(&self, pid: ProcessId) -> ArmtrapResult<TaskInfo>;

    /// Drop the OS-level debugging relationship.
    ///
    /// `graceful` is false when the target is already gone, in which case
    /// only local bookkeeping is undone.
    fn detach(&self, graceful: bool) -> ArmtrapResult<()>;

    /// Increment the task suspend count.
    fn suspend(&self) -> ArmtrapResult<()>;

    /// Decrement the task suspend count.
    fn resume(&self) -> ArmtrapResult<()>;

    /// Increment one thread's suspend count.
    fn suspend_thread(&self, port: ThreadPort) -> ArmtrapResult<()>;

    /// Decrement one thread's suspend count.
    fn resume_thread(&self, port: ThreadPort) -> ArmtrapResult<()>;

    /// Current threads of the target.
    fn threads(&self) -> ArmtrapResult<Vec<ThreadInfo>>;

    /// Read `len` bytes of target memory.
    ///
    /// ## Errors
    ///
    /// `InvalidAddress` if any byte of the range is unmapped.
    fn read_memory(&self, address: Address, len: usize) -> ArmtrapResult<Vec<u8>>;

    /// Write target memory, temporarily lifting write protection if needed.
    fn write_memory(&self, address: Address, data: &[u8]) -> ArmtrapResult<()>;

    /// Base address of the lowest mapped region (the main image on Darwin).
    fn first_region_base(&self) -> ArmtrapResult<Address>;

    /// General registers of one thread.
    fn registers(&self, port: ThreadPort) -> ArmtrapResult<Arm64Registers>;

    /// Debug registers of one thread.
    fn debug_state(&self, port: ThreadPort) -> ArmtrapResult<DebugState>;

    /// Replace the debug registers of one thread.
    fn set_debug_state(&self, port: ThreadPort, state: &DebugState) -> ArmtrapResult<()>;

    /// Route the target's exceptions to this controller, remembering the
    /// previous routing.
    fn register_trap_handler(&self) -> ArmtrapResult<()>;

    /// Put back the routing saved by [`ProcessController::register_trap_handler`].
    fn restore_trap_handler(&self) -> ArmtrapResult<()>;

    /// Block until the next trap arrives.
    ///
    /// Returns `Ok(None)` once [`ProcessController::release`] has been
    /// called, which is how the listener thread learns to exit.
    fn receive_trap(&self) -> ArmtrapResult<Option<TrapMessage>>;

    /// Take the next queued trap without waiting.
    ///
    /// Returns `Ok(None)` when nothing is queued or after release. Used on
    /// detach to answer traps the listener never picked up.
    fn try_receive_trap(&self) -> ArmtrapResult<Option<TrapMessage>>;

    /// Answer a trap, letting the faulting thread continue.
    fn reply_trap(&self, token: ReplyToken, success: bool) -> ArmtrapResult<()>;

    /// Resolve a pending soft signal on `port`: `Some(signal)` delivers it,
    /// `None` discards it.
    fn update_thread_signal(&self, port: ThreadPort, signal: Option<i32>) -> ArmtrapResult<()>;

    /// Whether the target process still exists.
    fn is_alive(&self) -> bool;

    /// Return all port rights and wake a blocked [`ProcessController::receive_trap`].
    fn release(&self);
}

/// Suspend the task and then every thread.
///
/// Returns the ports that were suspended so that [`resume_all`] undoes
/// exactly what was done even if threads come and go in between. On a
/// partial failure everything already suspended is resumed again and
/// `SuspendFailed` is returned; the session is then force-detached by the
/// caller.
pub fn suspend_all(ctl: &dyn ProcessController) -> ArmtrapResult<Vec<ThreadPort>>
{
    ctl.suspend()?;

    let threads = match ctl.threads() {
        Ok(threads) => threads,
        Err(err) => {
            if let Err(resume_err) = ctl.resume() {
                warn!("task_resume after failed enumeration: {resume_err}");
            }
            return Err(ArmtrapError::SuspendFailed(format!("could not enumerate threads: {err}")));
        }
    };

    let mut suspended = Vec::with_capacity(threads.len());
    for thread in &threads {
        if let Err(err) = ctl.suspend_thread(thread.port) {
            warn!(port = %thread.port, "thread_suspend failed: {err}");
            for port in suspended.iter().rev() {
                if let Err(resume_err) = ctl.resume_thread(*port) {
                    warn!(%port, "rolling back thread_suspend: {resume_err}");
                }
            }
            if let Err(resume_err) = ctl.resume() {
                warn!("rolling back task_suspend: {resume_err}");
            }
            return Err(ArmtrapError::SuspendFailed(format!("thread {}: {err}", thread.port)));
        }
        suspended.push(thread.port);
    }

    debug!(threads = suspended.len(), "suspended target");
    Ok(suspended)
}

/// Resume every port in `suspended` and then the task.
///
/// Keeps going after a failure so that as much of the target as possible
/// runs again, then reports the first error as `ResumeFailed`.
pub fn resume_all(ctl: &dyn ProcessController, suspended: &[ThreadPort]) -> ArmtrapResult<()>
{
    let mut first_error = None;
    for port in suspended {
        if let Err(err) = ctl.resume_thread(*port) {
            warn!(port = %port, "thread_resume failed: {err}");
            first_error.get_or_insert_with(|| format!("thread {port}: {err}"));
        }
    }
    if let Err(err) = ctl.resume() {
        first_error.get_or_insert_with(|| format!("task: {err}"));
    }

    match first_error {
        Some(message) => Err(ArmtrapError::ResumeFailed(message)),
        None => {
            debug!(threads = suspended.len(), "resumed target");
            Ok(())
        }
    }
}
