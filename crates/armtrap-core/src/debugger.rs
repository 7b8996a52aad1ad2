//! # Debugger
//!
//! The command-facing side of the trap engine.
//!
//! A [`Debugger`] owns one [`ProcessController`] and at most one attached
//! [`Debuggee`]. While attached, two worker threads run next to the caller:
//!
//! - `armtrap-listener` blocks in [`ProcessController::receive_trap`], runs
//!   each trap through the [`ExceptionDispatcher`] and either resumes the
//!   target on its own or records a stop and waits for the command thread
//!   to continue
//! - `armtrap-death-watch` polls [`ProcessController::is_alive`] and tears
//!   the session down if the target exits
//!
//! The session sits behind a single mutex. It is never held while receiving
//! a trap, while the listener waits for a reply, or while a command waits
//! for the next stop.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use armtrap_core::config::SessionConfig;
//! use armtrap_core::platform::simulated::SimulatedController;
//! use armtrap_core::threads::ThreadScope;
//! use armtrap_core::types::{Address, ProcessId, ThreadPort};
//! use armtrap_core::Debugger;
//!
//! let sim = Arc::new(
//!     SimulatedController::new(100)
//!         .with_region(0x1_0000_0000, vec![0; 0x4000])
//!         .with_thread(ThreadPort(0x103), 0x1_0000_0000),
//! );
//! let debugger = Debugger::new(sim.clone(), SessionConfig::default());
//! debugger.attach(ProcessId(100))?;
//! let id = debugger.set_breakpoint(Address::new(0x1_0000_1000), false, ThreadScope::All)?;
//! assert_eq!(id.to_string(), "1");
//! debugger.detach()?;
//! # Ok::<(), armtrap_core::error::ArmtrapError>(())
//! ```

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::breakpoints::{Breakpoint, BreakpointId};
use crate::config::SessionConfig;
use crate::controller::{resume_all, suspend_all, ProcessController, TaskInfo, TrapMessage};
use crate::debug_state::WatchAccess;
use crate::error::{ArmtrapError, ArmtrapResult, ObjectKind};
use crate::events::{DebuggerEvent, DebuggerEventReceiver, StopEvent, Subscribers, TrapEvent};
use crate::exception::ExceptionDispatcher;
use crate::resume::{CloseReason, PendingTrap, ResumeSynchronizer};
use crate::session::Debuggee;
use crate::signals::{SharedSignalPolicies, SignalPolicy, SignalPolicyTable};
use crate::stepping::SingleStepCoordinator;
use crate::threads::{ThreadScope, ThreadState};
use crate::types::{Address, Arm64Registers, ProcessId, ThreadId};
use crate::watchpoints::{Watchpoint, WatchpointId};

const LISTENER_THREAD: &str = "armtrap-listener";
const DEATH_WATCH_THREAD: &str = "armtrap-death-watch";
/// Receive errors tolerated while answering queued traps on detach.
const MAX_DRAIN_FAILURES: usize = 8;

/// What the listener did with a trap.
enum Handled
{
    /// Target is running again.
    Resumed,
    /// Target stopped; wait for the command thread to reply.
    Stopped,
    /// Session already gone; teardown answered the trap.
    Dropped,
}

#[derive(Default)]
struct Workers
{
    listener: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    shutdown: Option<mpsc::Sender<()>>,
}

struct Inner
{
    ctl: Arc<dyn ProcessController>,
    config: SessionConfig,
    session: Mutex<Option<Debuggee>>,
    sync: Mutex<Arc<ResumeSynchronizer>>,
    signals: SharedSignalPolicies,
    subscribers: Mutex<Subscribers>,
    workers: Mutex<Workers>,
}

/// Thread-safe handle to one debugging session.
///
/// Every method takes `&self`, so one thread can block in
/// [`Debugger::continue_execution`] while another calls
/// [`Debugger::interrupt`].
pub struct Debugger
{
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Debugger
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Debugger")
            .field("config", &self.inner.config)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

impl Debugger
{
    /// Debugger driving `ctl`.
    pub fn new(ctl: Arc<dyn ProcessController>, config: SessionConfig) -> Self
    {
        Self {
            inner: Arc::new(Inner {
                ctl,
                config,
                session: Mutex::new(None),
                sync: Mutex::new(Arc::new(ResumeSynchronizer::new())),
                signals: SharedSignalPolicies::default(),
                subscribers: Mutex::new(Subscribers::default()),
                workers: Mutex::new(Workers::default()),
            }),
        }
    }

    /// Attach to `pid` and leave it stopped.
    ///
    /// Takes the process handle, routes its exceptions here, suspends every
    /// thread, computes the ASLR slide and starts the listener and death
    /// watcher threads.
    ///
    /// ## Errors
    ///
    /// - `AlreadyAttached`: a session is active
    /// - `ProcessNotFound`, `PermissionDenied`: from the controller
    /// - `SuspendFailed`: the target could not be stopped
    pub fn attach(&self, pid: ProcessId) -> ArmtrapResult<()>
    {
        let inner = &self.inner;
        let ctl = inner.ctl.as_ref();
        let mut session = inner.lock_session();
        if let Some(current) = session.as_ref() {
            return Err(ArmtrapError::AlreadyAttached(current.pid.0));
        }

        let info = ctl.attach(pid)?;
        let debuggee = match start_session(ctl, &inner.config, pid, info) {
            Ok(debuggee) => debuggee,
            Err(err) => {
                warn!(%pid, "attach failed: {err}");
                if let Err(cleanup) = ctl.restore_trap_handler() {
                    warn!(%pid, "restoring exception ports after failed attach: {cleanup}");
                }
                if let Err(cleanup) = ctl.detach(true) {
                    warn!(%pid, "detaching after failed attach: {cleanup}");
                }
                ctl.release();
                return Err(err);
            }
        };

        let sync = Arc::new(ResumeSynchronizer::new());
        *inner.lock_sync() = sync.clone();
        info!(
            %pid,
            name = %debuggee.name,
            slide = format_args!("{:#x}", debuggee.aslr_slide),
            threads = debuggee.threads.len(),
            hw_breakpoints = debuggee.hw_breakpoints,
            hw_watchpoints = debuggee.hw_watchpoints,
            "attached"
        );
        *session = Some(debuggee);

        if let Err(err) = inner.spawn_workers(sync, pid) {
            drop(session);
            if let Err(cleanup) = inner.teardown(CloseReason::Detached) {
                warn!(%pid, "detaching after failed worker start: {cleanup}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Detach, restoring every patched instruction and debug register and
    /// letting the target run.
    ///
    /// ## Errors
    ///
    /// `NotAttached` if there is no session.
    pub fn detach(&self) -> ArmtrapResult<()>
    {
        if !self.is_attached() {
            return Err(ArmtrapError::NotAttached);
        }
        self.inner.teardown(CloseReason::Detached)
    }

    /// Whether a session is active.
    pub fn is_attached(&self) -> bool
    {
        self.inner.lock_session().is_some()
    }

    /// Pid of the attached process.
    pub fn pid(&self) -> Option<ProcessId>
    {
        self.inner.lock_session().as_ref().map(|d| d.pid)
    }

    /// Offset of the main image from its link-time base.
    pub fn aslr_slide(&self) -> ArmtrapResult<u64>
    {
        self.inner.with_session(|d| Ok(d.aslr_slide))
    }

    /// Set a breakpoint at a post-slide address.
    ///
    /// Hardware registers are used while any are free; after that the
    /// instruction is patched with `BRK #0`.
    pub fn set_breakpoint(&self, address: Address, temporary: bool, scope: ThreadScope) -> ArmtrapResult<BreakpointId>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner
            .with_session(|d| d.breakpoints.set(ctl, &mut d.threads, address, temporary, scope))
    }

    /// Delete one breakpoint.
    pub fn delete_breakpoint(&self, id: BreakpointId) -> ArmtrapResult<()>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| d.breakpoints.delete(ctl, &mut d.threads, id))
    }

    /// Delete every breakpoint.
    pub fn delete_all_breakpoints(&self) -> ArmtrapResult<()>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| d.breakpoints.delete_all(ctl, &mut d.threads))
    }

    /// Re-enable a disabled breakpoint.
    pub fn enable_breakpoint(&self, id: BreakpointId) -> ArmtrapResult<()>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| d.breakpoints.enable(ctl, &mut d.threads, id))
    }

    /// Disable a breakpoint without deleting it.
    pub fn disable_breakpoint(&self, id: BreakpointId) -> ArmtrapResult<()>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| {
            d.breakpoints.disable(ctl, &mut d.threads, id)?;
            d.threads.forget_stepped_over(id);
            Ok(())
        })
    }

    /// Snapshot of every breakpoint.
    pub fn breakpoints(&self) -> ArmtrapResult<Vec<Breakpoint>>
    {
        self.inner.with_session(|d| Ok(d.breakpoints.iter().cloned().collect()))
    }

    /// Watch `size` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// `ResourceExhausted` once every watchpoint register is taken; there is
    /// no software fallback.
    pub fn set_watchpoint(
        &self,
        address: Address,
        size: u8,
        access: WatchAccess,
        scope: ThreadScope,
    ) -> ArmtrapResult<WatchpointId>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner
            .with_session(|d| d.watchpoints.set(ctl, &mut d.threads, address, size, access, scope))
    }

    /// Delete one watchpoint.
    pub fn delete_watchpoint(&self, id: WatchpointId) -> ArmtrapResult<()>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| d.watchpoints.delete(ctl, &mut d.threads, id))
    }

    /// Delete every watchpoint.
    pub fn delete_all_watchpoints(&self) -> ArmtrapResult<()>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| d.watchpoints.delete_all(ctl, &mut d.threads))
    }

    /// Snapshot of every watchpoint.
    pub fn watchpoints(&self) -> ArmtrapResult<Vec<Watchpoint>>
    {
        self.inner.with_session(|d| Ok(d.watchpoints.iter().cloned().collect()))
    }

    /// Resume the stopped target without waiting.
    ///
    /// Replies to the oldest pending trap and resumes every thread. Returns
    /// a stop sequence number for [`Debugger::wait_for_stop`].
    ///
    /// ## Errors
    ///
    /// - `NotAttached`, `NotStopped`
    /// - `ResumeFailed`: the session has been force-detached
    pub fn resume(&self) -> ArmtrapResult<u64>
    {
        let sync = self.inner.current_sync();
        let seq = sync.stop_seq();
        self.inner.resume_target(&sync)?;
        Ok(seq)
    }

    /// Wait for a stop newer than `seq`. `Ok(None)` on timeout.
    ///
    /// ## Errors
    ///
    /// `NotAttached` or `TargetDied` if the session ends first.
    pub fn wait_for_stop(&self, seq: u64, timeout: Option<Duration>) -> ArmtrapResult<Option<StopEvent>>
    {
        self.inner.current_sync().wait_for_stop_after(seq, timeout)
    }

    /// Resume the target and block until it stops again.
    pub fn continue_execution(&self) -> ArmtrapResult<StopEvent>
    {
        let seq = self.resume()?;
        self.wait_for_stop(seq, None).map(Option::unwrap_or_default)
    }

    /// Execute one instruction on the focused thread.
    ///
    /// Other threads run too while the step is in flight.
    pub fn single_step(&self) -> ArmtrapResult<StopEvent>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| {
            d.require_stopped()?;
            let thread = d
                .threads
                .focused()
                .ok_or_else(|| ArmtrapError::not_found(ObjectKind::Thread, "focused"))?;
            SingleStepCoordinator::arm(ctl, &mut d.threads, thread)?;
            d.single_stepping = Some(thread);
            debug!(%thread, "single step requested");
            Ok(())
        })?;
        self.continue_execution()
    }

    /// Stop a running target. Does nothing if it is already stopped.
    pub fn interrupt(&self) -> ArmtrapResult<()>
    {
        let inner = &self.inner;
        let stop = {
            let mut session = inner.lock_session();
            let d = session.as_mut().ok_or(ArmtrapError::NotAttached)?;
            if d.interrupted {
                return Ok(());
            }
            match suspend_all(inner.ctl.as_ref()) {
                Ok(ports) => d.suspended = ports,
                Err(err) => {
                    drop(session);
                    inner.forced_teardown(&err);
                    return Err(err);
                }
            }
            d.interrupted = true;
            let stop = StopEvent {
                thread: d.threads.focused(),
                report: Some(TrapEvent::Interrupted),
            };
            inner.current_sync().record_stop(stop.clone());
            stop
        };
        info!("target interrupted");
        inner.publish(&DebuggerEvent::Stopped(stop));
        Ok(())
    }

    /// Snapshot of the thread list, refreshed from the OS.
    pub fn list_threads(&self) -> ArmtrapResult<Vec<ThreadState>>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| {
            d.sync_threads(ctl)?;
            Ok(d.threads.iter().cloned().collect())
        })
    }

    /// Focus another thread; single-step and register reads default to it.
    pub fn select_thread(&self, id: ThreadId) -> ArmtrapResult<()>
    {
        self.inner.with_session(|d| d.threads.focus(id))
    }

    /// The focused thread.
    pub fn focused_thread(&self) -> ArmtrapResult<Option<ThreadId>>
    {
        self.inner.with_session(|d| Ok(d.threads.focused()))
    }

    /// General registers of a thread, or of the focused one.
    ///
    /// ## Errors
    ///
    /// `NotStopped` while the target runs; the values would be stale.
    pub fn read_registers(&self, thread: Option<ThreadId>) -> ArmtrapResult<Arm64Registers>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|d| {
            d.require_stopped()?;
            let id = match thread.or_else(|| d.threads.focused()) {
                Some(id) => id,
                None => return Err(ArmtrapError::not_found(ObjectKind::Thread, "focused")),
            };
            d.threads.refresh_registers(ctl, id)
        })
    }

    /// Read target memory.
    pub fn read_memory(&self, address: Address, len: usize) -> ArmtrapResult<Vec<u8>>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|_| ctl.read_memory(address, len))
    }

    /// Write target memory.
    pub fn write_memory(&self, address: Address, data: &[u8]) -> ArmtrapResult<()>
    {
        let ctl = self.inner.ctl.as_ref();
        self.inner.with_session(|_| ctl.write_memory(address, data))
    }

    /// Receive every future [`DebuggerEvent`].
    pub fn subscribe(&self) -> DebuggerEventReceiver
    {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add()
    }

    /// Change how `signal` is handled. Takes effect on the next trap.
    pub fn set_signal_policy(&self, signal: i32, policy: SignalPolicy) -> ArmtrapResult<()>
    {
        self.inner
            .signals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(signal, policy)
    }

    /// The shared policy table.
    pub fn signal_policies(&self) -> SharedSignalPolicies
    {
        Arc::clone(&self.inner.signals)
    }

    /// Copy of the policy table.
    pub fn signal_policy_table(&self) -> SignalPolicyTable
    {
        self.inner.signals.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Traps received but not yet replied to.
    pub fn pending_traps(&self) -> usize
    {
        self.inner.current_sync().pending_count()
    }
}

impl Drop for Debugger
{
    fn drop(&mut self)
    {
        if self.is_attached() {
            if let Err(err) = self.inner.teardown(CloseReason::Detached) {
                warn!("detach on drop failed: {err}");
            }
        }
    }
}

/// Everything [`Debugger::attach`] does after the handle is acquired.
/// Reply success to every trap still queued on the controller.
///
/// The listener stops receiving while the target is stopped, so other
/// threads' traps can be waiting there when the session ends. Destroying
/// the port with them inside would leave those threads to the next
/// handler in line.
fn answer_queued(ctl: &dyn ProcessController) -> usize
{
    let mut answered = 0;
    let mut failures = 0;
    loop {
        match ctl.try_receive_trap() {
            Ok(Some(trap)) => {
                trace!(token = trap.token.0, thread = %trap.thread, "answering queued trap");
                match ctl.reply_trap(trap.token, true) {
                    Ok(()) => answered += 1,
                    Err(err) => warn!(token = trap.token.0, "reply to queued trap failed: {err}"),
                }
            }
            Ok(None) => return answered,
            Err(err) => {
                warn!("draining exception port: {err}");
                // Malformed messages are answered by the controller, so keep
                // going unless the port itself keeps failing.
                failures += 1;
                if failures >= MAX_DRAIN_FAILURES || !ctl.is_alive() {
                    return answered;
                }
            }
        }
    }
}

fn start_session(
    ctl: &dyn ProcessController,
    config: &SessionConfig,
    pid: ProcessId,
    info: TaskInfo,
) -> ArmtrapResult<Debuggee>
{
    ctl.register_trap_handler()?;
    let suspended = suspend_all(ctl)?;
    let prepared = ctl.first_region_base().and_then(|base| {
        let mut debuggee = Debuggee::new(pid, info, base, config.load_base);
        debuggee.sync_threads(ctl)?;
        Ok(debuggee)
    });
    match prepared {
        Ok(mut debuggee) => {
            debuggee.interrupted = true;
            debuggee.suspended = suspended;
            Ok(debuggee)
        }
        Err(err) => {
            if let Err(cleanup) = resume_all(ctl, &suspended) {
                warn!(%pid, "resuming target after failed attach: {cleanup}");
            }
            Err(err)
        }
    }
}

impl Inner
{
    fn lock_session(&self) -> MutexGuard<'_, Option<Debuggee>>
    {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sync(&self) -> MutexGuard<'_, Arc<ResumeSynchronizer>>
    {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers>
    {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_sync(&self) -> Arc<ResumeSynchronizer>
    {
        Arc::clone(&self.lock_sync())
    }

    /// Run `f` on the session, or fail with `NotAttached`.
    fn with_session<T>(&self, f: impl FnOnce(&mut Debuggee) -> ArmtrapResult<T>) -> ArmtrapResult<T>
    {
        let mut session = self.lock_session();
        let debuggee = session.as_mut().ok_or(ArmtrapError::NotAttached)?;
        f(debuggee)
    }

    fn publish(&self, event: &DebuggerEvent)
    {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .publish(event);
    }

    fn spawn_workers(self: &Arc<Self>, sync: Arc<ResumeSynchronizer>, pid: ProcessId) -> ArmtrapResult<()>
    {
        let mut workers = self.lock_workers();

        let listener = {
            let inner = Arc::clone(self);
            thread::Builder::new()
                .name(LISTENER_THREAD.to_string())
                .spawn(move || inner.listen(&sync))?
        };
        workers.listener = Some(listener);

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let watcher = {
            let inner = Arc::clone(self);
            thread::Builder::new()
                .name(DEATH_WATCH_THREAD.to_string())
                .spawn(move || inner.watch(&shutdown_rx, pid))?
        };
        workers.watcher = Some(watcher);
        workers.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Listener thread body. Exits once the controller is released.
    fn listen(&self, sync: &ResumeSynchronizer)
    {
        debug!("listener started");
        let ctl = self.ctl.as_ref();
        loop {
            let trap = match ctl.receive_trap() {
                Ok(Some(trap)) => trap,
                Ok(None) => break,
                Err(err) => {
                    error!("receiving trap failed: {err}");
                    if ctl.is_alive() {
                        continue;
                    }
                    break;
                }
            };

            let pending = PendingTrap {
                token: trap.token,
                thread: trap.thread,
            };
            if !sync.enqueue(pending) {
                // Session is closing and nobody else will see this trap.
                if let Err(err) = ctl.reply_trap(trap.token, true) {
                    warn!(token = trap.token.0, "reply after close failed: {err}");
                }
                continue;
            }

            match self.handle_trap(sync, &trap) {
                Ok(Handled::Stopped) => {
                    if let Err(err) = sync.wait_replied() {
                        debug!("stop ended by teardown: {err}");
                    }
                }
                Ok(Handled::Resumed | Handled::Dropped) => {}
                Err(err @ (ArmtrapError::SuspendFailed(_) | ArmtrapError::ResumeFailed(_))) => {
                    error!("lost control of target: {err}");
                    self.forced_teardown(&err);
                }
                Err(err) => error!(token = trap.token.0, "trap handling failed: {err}"),
            }
        }
        debug!("listener exiting");
    }

    /// Suspend, dispatch and either resume or record a stop.
    fn handle_trap(&self, sync: &ResumeSynchronizer, trap: &TrapMessage) -> ArmtrapResult<Handled>
    {
        let ctl = self.ctl.as_ref();
        let mut session = self.lock_session();
        let Some(debuggee) = session.as_mut() else {
            return Ok(Handled::Dropped);
        };
        if sync.is_closed() {
            return Ok(Handled::Dropped);
        }

        let was_stopped = debuggee.interrupted;
        if !was_stopped {
            debuggee.suspended = suspend_all(ctl)?;
        }

        let outcome = {
            let signals = self.signals.read().unwrap_or_else(PoisonError::into_inner);
            let refreshed = if self.config.refresh_threads_on_trap {
                debuggee.sync_threads(ctl).map(drop)
            } else {
                Ok(())
            };
            refreshed.and_then(|()| ExceptionDispatcher::new(ctl, &signals).dispatch(debuggee, trap))
        };

        let disposition = match outcome {
            Ok(disposition) => disposition,
            Err(err) => {
                error!(token = trap.token.0, thread = %trap.thread, "rejecting trap: {err}");
                sync.resolve(ctl, trap.token, false)?;
                if !was_stopped {
                    resume_all(ctl, &std::mem::take(&mut debuggee.suspended))?;
                }
                return Ok(Handled::Resumed);
            }
        };

        if disposition.auto_resume {
            sync.resolve(ctl, trap.token, true)?;
            if !was_stopped {
                resume_all(ctl, &std::mem::take(&mut debuggee.suspended))?;
            }
            drop(session);
            if let Some(report) = disposition.report {
                info!("{report}");
                self.publish(&DebuggerEvent::Notification(report));
            }
            return Ok(Handled::Resumed);
        }

        debuggee.interrupted = true;
        let stop = StopEvent {
            thread: Some(disposition.thread),
            report: disposition.report,
        };
        sync.record_stop(stop.clone());
        drop(session);
        debug!(%stop, "target stopped");
        self.publish(&DebuggerEvent::Stopped(stop));
        Ok(Handled::Stopped)
    }

    /// Reply to the oldest trap and let the whole target run.
    fn resume_target(&self, sync: &ResumeSynchronizer) -> ArmtrapResult<()>
    {
        let ctl = self.ctl.as_ref();
        let mut session = self.lock_session();
        let debuggee = session.as_mut().ok_or(ArmtrapError::NotAttached)?;
        debuggee.require_stopped()?;

        let suspended = std::mem::take(&mut debuggee.suspended);
        debuggee.interrupted = false;
        if let Err(err) = sync.resume_oldest(ctl) {
            warn!("reply to pending trap failed: {err}");
        }
        let resumed = resume_all(ctl, &suspended);
        drop(session);

        if let Err(err) = resumed {
            self.forced_teardown(&err);
            return Err(err);
        }
        self.publish(&DebuggerEvent::Resumed);
        Ok(())
    }

    /// Death watcher thread body.
    fn watch(&self, shutdown: &mpsc::Receiver<()>, pid: ProcessId)
    {
        debug!(interval = ?self.config.death_poll_interval, "death watcher started");
        loop {
            match shutdown.recv_timeout(self.config.death_poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.ctl.is_alive() {
                warn!(%pid, "target exited");
                if let Err(err) = self.teardown(CloseReason::TargetDied(pid.0)) {
                    debug!("teardown after exit: {err}");
                }
                break;
            }
        }
        debug!("death watcher exiting");
    }

    /// Tear down after a suspend or resume failure.
    fn forced_teardown(&self, cause: &ArmtrapError)
    {
        let pid = self.lock_session().as_ref().map(|d| d.pid.0);
        let reason = match pid {
            Some(pid) if !self.ctl.is_alive() => CloseReason::TargetDied(pid),
            _ => CloseReason::Detached,
        };
        warn!(?reason, "forcing detach: {cause}");
        if let Err(err) = self.teardown(reason) {
            warn!("forced detach incomplete: {err}");
        }
    }

    /// End the session. Safe to call more than once and from any thread.
    ///
    /// A graceful teardown restores breakpoints, watchpoints and
    /// single-step before letting the target go; after the target died
    /// only local state is released.
    fn teardown(&self, reason: CloseReason) -> ArmtrapResult<()>
    {
        let ctl = self.ctl.as_ref();
        let mut session = self.lock_session();
        let Some(mut debuggee) = session.take() else {
            return Ok(());
        };
        debuggee.want_detach = true;
        let graceful = reason == CloseReason::Detached;

        if graceful {
            if let Err(err) = debuggee.breakpoints.delete_all(ctl, &mut debuggee.threads) {
                warn!("restoring breakpoints: {err}");
            }
            if let Err(err) = debuggee.watchpoints.delete_all(ctl, &mut debuggee.threads) {
                warn!("clearing watchpoints: {err}");
            }
            if let Err(err) = SingleStepCoordinator::disarm_all(ctl, &mut debuggee.threads) {
                warn!("clearing single-step: {err}");
            }
        }

        let mut drained = self.current_sync().drain_and_close(ctl, reason);
        drained += answer_queued(ctl);
        if graceful && !debuggee.suspended.is_empty() {
            if let Err(err) = resume_all(ctl, &debuggee.suspended) {
                warn!("resuming target on detach: {err}");
            }
        }

        let detached = ctl.detach(graceful);
        if let Err(err) = ctl.restore_trap_handler() {
            warn!("restoring exception ports: {err}");
        }
        // Traps raised while detaching are still on our port.
        drained += answer_queued(ctl);
        ctl.release();
        drop(session);

        self.stop_workers();
        info!(pid = %debuggee.pid, drained, target_died = !graceful, "detached");
        self.publish(&DebuggerEvent::Detached { target_died: !graceful });
        detached
    }

    /// Stop the watcher and join both workers, except the calling thread.
    fn stop_workers(&self)
    {
        let workers = std::mem::take(&mut *self.lock_workers());
        drop(workers.shutdown);
        let current = thread::current().id();
        for handle in [workers.listener, workers.watcher].into_iter().flatten() {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::platform::simulated::SimulatedController;
    use crate::types::ThreadPort;

    const BASE: u64 = 0x1_0000_0000;

    fn simulated() -> Arc<SimulatedController>
    {
        Arc::new(
            SimulatedController::new(42)
                .with_region(BASE, vec![0x1f; 0x4000])
                .with_thread(ThreadPort(0x10), BASE),
        )
    }

    fn debugger(sim: &Arc<SimulatedController>) -> Debugger
    {
        let config = SessionConfig::default().with_death_poll_interval(Duration::from_millis(10));
        Debugger::new(sim.clone(), config)
    }

    #[test]
    fn test_attach_leaves_target_stopped()
    {
        let sim = simulated();
        let dbg = debugger(&sim);
        dbg.attach(ProcessId(42)).unwrap();

        assert!(dbg.is_attached());
        assert!(sim.trap_handler_registered());
        assert_eq!(sim.task_suspend_count(), 1);
        assert_eq!(sim.thread_suspend_count(ThreadPort(0x10)), Some(1));
        assert!(matches!(dbg.attach(ProcessId(42)), Err(ArmtrapError::AlreadyAttached(42))));

        dbg.detach().unwrap();
        assert_eq!(sim.task_suspend_count(), 0);
        assert!(!sim.trap_handler_registered());
        assert_eq!(sim.detached(), Some(true));
        assert!(matches!(dbg.detach(), Err(ArmtrapError::NotAttached)));
    }

    #[test]
    fn test_attach_errors()
    {
        let sim = simulated();
        let dbg = debugger(&sim);
        assert!(matches!(dbg.attach(ProcessId(7)), Err(ArmtrapError::ProcessNotFound(7))));

        let denied = Arc::new(SimulatedController::new(9).deny_attach());
        let dbg = Debugger::new(denied, SessionConfig::default());
        assert!(matches!(dbg.attach(ProcessId(9)), Err(ArmtrapError::PermissionDenied(_))));
        assert!(!dbg.is_attached());
    }

    #[test]
    fn test_failed_attach_leaves_target_as_found()
    {
        // No mapped regions, so the slide cannot be computed after suspending.
        let sim = Arc::new(SimulatedController::new(11).with_thread(ThreadPort(0x10), BASE));
        let dbg = Debugger::new(sim.clone(), SessionConfig::default());
        assert!(matches!(dbg.attach(ProcessId(11)), Err(ArmtrapError::InvalidAddress { .. })));

        assert!(!dbg.is_attached());
        assert_eq!(sim.task_suspend_count(), 0);
        assert_eq!(sim.thread_suspend_count(ThreadPort(0x10)), Some(0));
        assert!(!sim.trap_handler_registered());
        assert_eq!(sim.detached(), Some(true));
        assert!(sim.is_released());
    }

    #[test]
    fn test_commands_need_a_session()
    {
        let sim = simulated();
        let dbg = debugger(&sim);
        assert!(matches!(
            dbg.set_breakpoint(Address::new(BASE), false, ThreadScope::All),
            Err(ArmtrapError::NotAttached)
        ));
        assert!(matches!(dbg.continue_execution(), Err(ArmtrapError::NotAttached)));
        assert!(matches!(dbg.read_memory(Address::new(BASE), 4), Err(ArmtrapError::NotAttached)));
    }

    #[test]
    fn test_resume_requires_stop_and_interrupt_stops()
    {
        let sim = simulated();
        let dbg = debugger(&sim);
        dbg.attach(ProcessId(42)).unwrap();

        dbg.resume().unwrap();
        assert_eq!(sim.task_suspend_count(), 0);
        assert!(matches!(dbg.resume(), Err(ArmtrapError::NotStopped)));
        assert!(matches!(dbg.read_registers(None), Err(ArmtrapError::NotStopped)));

        let events = dbg.subscribe();
        dbg.interrupt().unwrap();
        assert_eq!(sim.task_suspend_count(), 1);
        match events.recv_timeout(Duration::from_secs(1)).unwrap() {
            DebuggerEvent::Stopped(stop) => assert_eq!(stop.report, Some(TrapEvent::Interrupted)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(dbg.read_registers(None).unwrap().pc, BASE);
        dbg.detach().unwrap();
    }
}
