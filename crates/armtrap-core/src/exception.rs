//! # Exception Dispatch
//!
//! Classifies a trap delivered by the kernel and decides what happens next.
//!
//! ## Classification
//!
//! A trap is matched against these rules, first match wins:
//!
//! 1. `EXC_SOFTWARE` / `EXC_SOFT_SIGNAL`: a Unix signal, handled per the
//!    signal policy table
//! 2. `EXC_BREAKPOINT` / `EXC_ARM_DA_DEBUG`: a watchpoint fault; the subcode
//!    is the data address
//! 3. `EXC_BREAKPOINT` / `EXC_ARM_BREAKPOINT` with a zero subcode: a
//!    single-step completed
//! 4. `EXC_BREAKPOINT` / `EXC_ARM_BREAKPOINT` with a non-zero subcode: a
//!    hardware or software breakpoint at that address
//! 5. anything else is reported as a plain exception and stops the target
//!
//! ## Step-over
//!
//! A thread that traps on a breakpoint cannot resume at the same PC without
//! trapping again. The dispatcher disables every breakpoint at the address,
//! arms single-step on the thread and remembers what it disabled on the
//! thread itself. When the step completes those breakpoints are enabled
//! again. Watchpoints use the same dance with the watchpoint's control
//! register.
//!
//! The dispatcher only decides; replying to the kernel and resuming the
//! task is the listener thread's job. See [`crate::debugger`].

use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use crate::breakpoints::BreakpointId;
use crate::controller::{ProcessController, TrapMessage};
use crate::error::{ArmtrapError, ArmtrapResult};
use crate::events::TrapEvent;
use crate::session::{Debuggee, WatchpointSite};
use crate::signals::SignalPolicyTable;
use crate::stepping::SingleStepCoordinator;
use crate::types::{Address, ThreadId, ThreadPort};

/// `EXC_ARM_BREAKPOINT`: a `BRK` instruction, a hardware breakpoint or a
/// completed single step.
pub const EXC_ARM_BREAKPOINT: i64 = 1;

/// `EXC_ARM_DA_DEBUG`: a data access matched a watchpoint.
pub const EXC_ARM_DA_DEBUG: i64 = 0x102;

/// `EXC_SOFT_SIGNAL`: a Unix signal delivered as a Mach exception.
pub const EXC_SOFT_SIGNAL: i64 = 0x10003;

/// Mach exception classes (`EXC_*` from `<mach/exception_types.h>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionType
{
    /// `EXC_BAD_ACCESS`
    BadAccess,
    /// `EXC_BAD_INSTRUCTION`
    BadInstruction,
    /// `EXC_ARITHMETIC`
    Arithmetic,
    /// `EXC_EMULATION`
    Emulation,
    /// `EXC_SOFTWARE`
    Software,
    /// `EXC_BREAKPOINT`
    Breakpoint,
    /// `EXC_SYSCALL`
    Syscall,
    /// `EXC_MACH_SYSCALL`
    MachSyscall,
    /// `EXC_RPC_ALERT`
    RpcAlert,
    /// `EXC_CRASH`
    Crash,
    /// `EXC_RESOURCE`
    Resource,
    /// `EXC_GUARD`
    Guard,
    /// `EXC_CORPSE_NOTIFY`
    CorpseNotify,
    /// A class this crate does not know
    Unknown(i32),
}

impl ExceptionType
{
    /// Map a raw `exception_type_t`.
    pub const fn from_raw(raw: i32) -> Self
    {
        match raw {
            1 => Self::BadAccess,
            2 => Self::BadInstruction,
            3 => Self::Arithmetic,
            4 => Self::Emulation,
            5 => Self::Software,
            6 => Self::Breakpoint,
            7 => Self::Syscall,
            8 => Self::MachSyscall,
            9 => Self::RpcAlert,
            10 => Self::Crash,
            11 => Self::Resource,
            12 => Self::Guard,
            13 => Self::CorpseNotify,
            other => Self::Unknown(other),
        }
    }

    /// The raw `exception_type_t`.
    pub const fn raw(self) -> i32
    {
        match self {
            Self::BadAccess => 1,
            Self::BadInstruction => 2,
            Self::Arithmetic => 3,
            Self::Emulation => 4,
            Self::Software => 5,
            Self::Breakpoint => 6,
            Self::Syscall => 7,
            Self::MachSyscall => 8,
            Self::RpcAlert => 9,
            Self::Crash => 10,
            Self::Resource => 11,
            Self::Guard => 12,
            Self::CorpseNotify => 13,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ExceptionType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::BadAccess => "EXC_BAD_ACCESS",
            Self::BadInstruction => "EXC_BAD_INSTRUCTION",
            Self::Arithmetic => "EXC_ARITHMETIC",
            Self::Emulation => "EXC_EMULATION",
            Self::Software => "EXC_SOFTWARE",
            Self::Breakpoint => "EXC_BREAKPOINT",
            Self::Syscall => "EXC_SYSCALL",
            Self::MachSyscall => "EXC_MACH_SYSCALL",
            Self::RpcAlert => "EXC_RPC_ALERT",
            Self::Crash => "EXC_CRASH",
            Self::Resource => "EXC_RESOURCE",
            Self::Guard => "EXC_GUARD",
            Self::CorpseNotify => "EXC_CORPSE_NOTIFY",
            Self::Unknown(raw) => return write!(f, "exception {raw}"),
        };
        f.write_str(name)
    }
}

/// What a trap turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind
{
    /// Unix signal `signal`
    SoftSignal
    {
        /// Signal number
        signal: i32,
    },
    /// Watchpoint fault on a data access at `address`
    WatchpointFault
    {
        /// Faulting data address
        address: Address,
    },
    /// Single step completed
    StepCompleted,
    /// Breakpoint at `address`
    BreakpointHit
    {
        /// Breakpoint address
        address: Address,
    },
    /// Anything else
    Other,
}

/// Classify a trap.
///
/// ## Errors
///
/// `ProtocolError` if a signal or breakpoint trap lacks its code or subcode.
pub fn classify(trap: &TrapMessage) -> ArmtrapResult<TrapKind>
{
    let codes = trap.codes.as_slice();
    let code_pair = || match codes {
        [code, subcode, ..] => Ok((*code, *subcode)),
        _ => Err(ArmtrapError::ProtocolError(format!(
            "{} with {} code(s)",
            trap.exception,
            codes.len()
        ))),
    };

    match trap.exception {
        ExceptionType::Software if codes.first() == Some(&EXC_SOFT_SIGNAL) => {
            let (_, subcode) = code_pair()?;
            let signal = i32::try_from(subcode)
                .map_err(|_| ArmtrapError::ProtocolError(format!("signal number {subcode} out of range")))?;
            Ok(TrapKind::SoftSignal { signal })
        }
        ExceptionType::Breakpoint => {
            let (code, subcode) = code_pair()?;
            // Subcodes are addresses; the sign bit is just the top address bit.
            #[allow(clippy::cast_sign_loss)]
            let address = Address::new(subcode as u64);
            Ok(match code {
                EXC_ARM_DA_DEBUG => TrapKind::WatchpointFault { address },
                EXC_ARM_BREAKPOINT if subcode == 0 => TrapKind::StepCompleted,
                EXC_ARM_BREAKPOINT => TrapKind::BreakpointHit { address },
                _ => TrapKind::Other,
            })
        }
        _ => Ok(TrapKind::Other),
    }
}

/// Outcome of dispatching one trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition
{
    /// Thread the trap came from
    pub thread: ThreadId,
    /// Reply and resume without waiting for the user
    pub auto_resume: bool,
    /// What to tell the user, as a stop report or, when auto-resuming, a
    /// notification
    pub report: Option<TrapEvent>,
}

impl Disposition
{
    fn resume(thread: ThreadId, report: Option<TrapEvent>) -> Self
    {
        Self {
            thread,
            auto_resume: true,
            report,
        }
    }

    fn stop(thread: ThreadId, report: Option<TrapEvent>) -> Self
    {
        Self {
            thread,
            auto_resume: false,
            report,
        }
    }
}

/// Applies the classification rules to a [`Debuggee`].
///
/// Borrowed per trap by the listener thread while it holds the session lock.
pub struct ExceptionDispatcher<'a>
{
    ctl: &'a dyn ProcessController,
    signals: &'a SignalPolicyTable,
}

impl<'a> ExceptionDispatcher<'a>
{
    /// Dispatcher over `ctl` using `signals` for signal traps.
    pub fn new(ctl: &'a dyn ProcessController, signals: &'a SignalPolicyTable) -> Self
    {
        Self { ctl, signals }
    }

    /// Handle one trap. The target must already be suspended.
    ///
    /// Focuses the trapping thread and refreshes its registers, then acts on
    /// the classification.
    ///
    /// ## Errors
    ///
    /// - `ProtocolError`: malformed codes, or a thread the OS does not list
    /// - any controller error while reprogramming the target
    pub fn dispatch(&self, debuggee: &mut Debuggee, trap: &TrapMessage) -> ArmtrapResult<Disposition>
    {
        let kind = classify(trap)?;
        let thread = debuggee.resolve_thread(self.ctl, trap.thread)?;
        debuggee.threads.focus(thread)?;
        let registers = debuggee.threads.refresh_registers(self.ctl, thread)?;
        trace!(%thread, ?kind, pc = %registers.pc(), "dispatching trap");

        match kind {
            TrapKind::SoftSignal { signal } => self.on_signal(debuggee, thread, trap.thread, signal),
            TrapKind::WatchpointFault { address } => {
                self.on_watchpoint_fault(debuggee, thread, address, registers.pc(), trap)
            }
            TrapKind::StepCompleted => self.on_step_completed(debuggee, thread),
            TrapKind::BreakpointHit { address } => self.on_breakpoint(debuggee, thread, address, trap),
            TrapKind::Other => {
                info!(%thread, exception = %trap.exception, codes = ?trap.codes, "unhandled exception");
                Ok(Disposition::stop(thread, Some(exception_report(thread, trap))))
            }
        }
    }

    fn on_signal(&self, debuggee: &Debuggee, thread: ThreadId, port: ThreadPort, signal: i32) -> ArmtrapResult<Disposition>
    {
        let policy = self.signals.get(signal);
        self.ctl.update_thread_signal(port, policy.pass.then_some(signal))?;
        debug!(%thread, signal, ?policy, "signal");

        let report = (policy.notify && !debuggee.want_detach).then_some(TrapEvent::Signal {
            thread,
            signal,
            passed: policy.pass,
        });
        if policy.pass || !policy.stop {
            Ok(Disposition::resume(thread, report))
        } else {
            Ok(Disposition::stop(thread, report))
        }
    }

    fn on_watchpoint_fault(
        &self,
        debuggee: &mut Debuggee,
        thread: ThreadId,
        address: Address,
        pc: Address,
        trap: &TrapMessage,
    ) -> ArmtrapResult<Disposition>
    {
        let Some(id) = debuggee.watchpoints.find_covering(address) else {
            warn!(%thread, %address, "data abort with no matching watchpoint");
            return Ok(Disposition::stop(thread, Some(exception_report(thread, trap))));
        };

        // Let the faulting access retire under single-step with the
        // watchpoint out of the way; the step trap finishes the hit.
        debuggee.watchpoints.disarm_on(self.ctl, &mut debuggee.threads, id, thread)?;
        SingleStepCoordinator::arm(self.ctl, &mut debuggee.threads, thread)?;
        debuggee.threads.get_mut(thread)?.just_hit_watchpoint = true;
        debuggee.last_hit_watchpoint = Some(WatchpointSite { id, address, pc });
        debug!(%thread, %id, %address, %pc, "watchpoint fault, stepping access");
        Ok(Disposition::resume(thread, None))
    }

    fn on_step_completed(&self, debuggee: &mut Debuggee, thread: ThreadId) -> ArmtrapResult<Disposition>
    {
        let user_step = debuggee.single_stepping == Some(thread);
        if user_step {
            debuggee.single_stepping = None;
        }

        let state = debuggee.threads.get_mut(thread)?;
        let hit_watchpoint = state.just_hit_watchpoint;
        let hit_breakpoint = state.just_hit_breakpoint;
        let stepped_over = std::mem::take(&mut state.stepped_over);
        state.clear_transient();

        let mut report = None;
        if hit_watchpoint {
            report = self.finish_watchpoint_hit(debuggee, thread)?;
        }
        if hit_breakpoint {
            for id in stepped_over {
                // Gone if the user deleted it while stopped; still held if
                // another thread is stepping over it too.
                if debuggee.breakpoints.get(id).is_ok() && !debuggee.threads.stepping_over(id) {
                    debuggee.breakpoints.enable(self.ctl, &mut debuggee.threads, id)?;
                }
            }
        }
        SingleStepCoordinator::disarm(self.ctl, &mut debuggee.threads, thread)?;

        if (hit_watchpoint || hit_breakpoint) && !user_step {
            trace!(%thread, "internal step finished");
            return Ok(Disposition::resume(thread, report));
        }

        let pc = debuggee.threads.get(thread)?.registers.pc();
        if report.is_none() && user_step {
            let at = debuggee.breakpoints.enabled_at(pc);
            if !at.is_empty() {
                report = self.take_breakpoint_hit(debuggee, thread, pc, &at)?;
            }
        }
        Ok(Disposition::stop(
            thread,
            Some(report.unwrap_or(TrapEvent::StepCompleted { thread, pc })),
        ))
    }

    fn finish_watchpoint_hit(&self, debuggee: &mut Debuggee, thread: ThreadId) -> ArmtrapResult<Option<TrapEvent>>
    {
        let Some(site) = debuggee.last_hit_watchpoint.take() else {
            return Ok(None);
        };
        if debuggee.watchpoints.get(site.id).is_err() {
            return Ok(None);
        }
        let change = debuggee.watchpoints.complete_hit(self.ctl, site.id)?;
        debuggee.watchpoints.rearm_on(self.ctl, &mut debuggee.threads, site.id, thread)?;
        info!(%thread, id = %site.id, %change, "watchpoint hit");
        Ok(Some(TrapEvent::WatchpointHit {
            thread,
            id: site.id,
            address: site.address,
            pc: site.pc,
            change,
        }))
    }

    fn on_breakpoint(
        &self,
        debuggee: &mut Debuggee,
        thread: ThreadId,
        address: Address,
        trap: &TrapMessage,
    ) -> ArmtrapResult<Disposition>
    {
        let mut at = debuggee.breakpoints.enabled_at(address);
        if at.is_empty() {
            // Another thread may have disabled it for its own step-over
            // after this thread had already trapped.
            at = debuggee
                .breakpoints
                .iter()
                .filter(|bp| bp.address == address && debuggee.threads.stepping_over(bp.id))
                .map(|bp| bp.id)
                .collect();
        }
        if at.is_empty() {
            warn!(%thread, %address, "breakpoint trap with no breakpoint set");
            return Ok(Disposition::stop(thread, Some(exception_report(thread, trap))));
        }

        match self.take_breakpoint_hit(debuggee, thread, address, &at)? {
            Some(report) => Ok(Disposition::stop(thread, Some(report))),
            None => {
                trace!(%thread, %address, "breakpoint out of scope, stepping over");
                Ok(Disposition::resume(thread, None))
            }
        }
    }

    /// Count the hit on every in-scope breakpoint in `at`, then set up the
    /// step-over. Returns the report for the lowest in-scope id, or `None`
    /// if no breakpoint at the address applies to `thread`.
    fn take_breakpoint_hit(
        &self,
        debuggee: &mut Debuggee,
        thread: ThreadId,
        address: Address,
        at: &[BreakpointId],
    ) -> ArmtrapResult<Option<TrapEvent>>
    {
        let mut hit: SmallVec<[BreakpointId; 2]> = SmallVec::new();
        let mut report = None;
        let mut software = false;
        for id in at {
            let bp = debuggee.breakpoints.get(*id)?;
            software |= bp.is_software();
            if !bp.scope.includes(thread) {
                continue;
            }
            let hit_count = debuggee.breakpoints.record_hit(*id)?;
            hit.push(*id);
            if report.is_none() {
                report = Some(TrapEvent::BreakpointHit {
                    thread,
                    id: *id,
                    address,
                    hit_count,
                });
                debuggee.last_hit_breakpoint = Some(*id);
            }
        }

        let mut stepped_over: SmallVec<[BreakpointId; 2]> = SmallVec::new();
        for id in at {
            let temporary = debuggee.breakpoints.get(*id)?.temporary;
            if temporary && hit.contains(id) {
                debuggee.breakpoints.delete(self.ctl, &mut debuggee.threads, *id)?;
            } else {
                debuggee.breakpoints.disable(self.ctl, &mut debuggee.threads, *id)?;
                stepped_over.push(*id);
            }
        }

        SingleStepCoordinator::arm(self.ctl, &mut debuggee.threads, thread)?;
        let state = debuggee.threads.get_mut(thread)?;
        state.just_hit_breakpoint = true;
        state.just_hit_software_breakpoint = software;
        state.stepped_over.extend(stepped_over);

        if let Some(report) = &report {
            info!("{report}");
        }
        Ok(report)
    }
}

fn exception_report(thread: ThreadId, trap: &TrapMessage) -> TrapEvent
{
    TrapEvent::Exception {
        thread,
        exception: trap.exception,
        codes: trap.codes.clone(),
    }
}
