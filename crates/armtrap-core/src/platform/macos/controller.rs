//! # Mach Process Controller
//!
//! [`MachController`] implements [`ProcessController`] on top of the task
//! port returned by `task_for_pid()`, a private exception port registered
//! with `task_set_exception_ports()`, and `ptrace(PT_ATTACHEXC)` so that
//! signals arrive as `EXC_SOFTWARE` exceptions on the same port.
//!
//! ## Exception messages
//!
//! The port is registered with `EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES`,
//! so every trap is a `mach_exception_raise` request (id 2405) carrying
//! the thread port and two 64-bit codes. The kernel holds the faulting
//! thread until it gets the matching reply (id 2505) on the send-once right
//! in `msgh_remote_port`. Those reply headers are kept per token until
//! [`ProcessController::reply_trap`] consumes them.
//!
//! ## Shutdown
//!
//! [`ProcessController::release`] destroys the receive right. A listener
//! blocked in `mach_msg` then fails with `MACH_RCV_PORT_DIED` (or
//! `MACH_RCV_INVALID_NAME` if it was not yet blocked) and
//! [`ProcessController::receive_trap`] returns `Ok(None)`.

use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CString};
use std::io;
use std::mem;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::{c_char, c_int, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t, vm_map_t};
use mach2::exception_types::exception_type_t;
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::{
    mach_msg, mach_msg_body_t, mach_msg_header_t, mach_msg_port_descriptor_t, mach_msg_size_t, MACH_MSGH_BITS,
    MACH_MSG_SUCCESS, MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MOVE_SEND_ONCE, MACH_RCV_INVALID_NAME, MACH_RCV_LARGE,
    MACH_RCV_MSG, MACH_RCV_PORT_DIED, MACH_RCV_TIMED_OUT, MACH_RCV_TIMEOUT, MACH_SEND_MSG,
};
use mach2::ndr::{NDR_record, NDR_record_t};
use mach2::port::MACH_PORT_NULL;
use mach2::task::{task_resume, task_suspend, task_threads};
use mach2::traps::mach_task_self;
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use crate::controller::{ProcessController, ReplyToken, TaskInfo, ThreadInfo, TrapMessage};
use crate::debug_state::{DebugState, DEBUG_STATE_WORDS, MAX_DEBUG_REGISTERS};
use crate::error::{ArmtrapError, ArmtrapResult};
use crate::exception::ExceptionType;
use crate::platform::macos::constants::*;
use crate::platform::macos::error::{kern_check, MachError};
use crate::platform::macos::{ffi, memory};
use crate::types::registers::THREAD_STATE_WORDS;
use crate::types::{Address, Arm64Registers, ProcessId, ThreadPort};

/// `mach_exception_raise` request as laid out by MIG.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
struct ExceptionRequest
{
    head: mach_msg_header_t,
    body: mach_msg_body_t,
    thread: mach_msg_port_descriptor_t,
    task: mach_msg_port_descriptor_t,
    ndr: NDR_record_t,
    exception: exception_type_t,
    code_count: mach_msg_type_number_t,
    code: [i64; 2],
}

/// `mach_exception_raise` reply.
#[repr(C)]
struct ExceptionReply
{
    head: mach_msg_header_t,
    ndr: NDR_record_t,
    ret_code: libc::kern_return_t,
}

#[repr(C, align(8))]
struct ReceiveBuffer([u8; RECEIVE_BUFFER_SIZE]);

/// Where to send the reply for one outstanding trap.
#[derive(Debug, Clone, Copy)]
struct PendingReply
{
    reply_port: mach_port_t,
    request_id: i32,
}

/// Exception routing in place before we registered ours.
#[derive(Debug, Clone, Copy)]
struct SavedExceptionPorts
{
    count: usize,
    masks: [u32; EXC_TYPES_COUNT],
    ports: [mach_port_t; EXC_TYPES_COUNT],
    behaviors: [c_int; EXC_TYPES_COUNT],
    flavors: [c_int; EXC_TYPES_COUNT],
}

#[derive(Debug, Default)]
struct MachState
{
    pid: Option<ProcessId>,
    task: mach_port_t,
    exception_port: mach_port_t,
    traced: bool,
    saved: Option<SavedExceptionPorts>,
    pending: HashMap<u64, PendingReply>,
    next_token: u64,
    /// Thread port names we hold exactly one user reference on.
    thread_ports: HashSet<mach_port_t>,
}

impl MachState
{
    fn task(&self) -> ArmtrapResult<mach_port_t>
    {
        if self.pid.is_some() && self.task != MACH_PORT_NULL {
            Ok(self.task)
        } else {
            Err(ArmtrapError::NotAttached)
        }
    }

    fn pid(&self) -> ArmtrapResult<ProcessId>
    {
        self.pid.ok_or(ArmtrapError::NotAttached)
    }

    /// `task_threads` and every exception message add a reference to the
    /// same name; keep the first and drop the rest.
    fn hold_thread_port(&mut self, port: mach_port_t)
    {
        if port == MACH_PORT_NULL || self.thread_ports.insert(port) {
            return;
        }
        unsafe {
            let _ = ffi::mach_port_deallocate(mach_task_self(), port);
        }
    }

    /// Drop our reference on every held thread port not in `live`.
    fn forget_thread_ports(&mut self, live: &[ThreadPort])
    {
        self.thread_ports.retain(|held| {
            let keep = live.iter().any(|port| port.0 == *held);
            if !keep {
                trace!(port = *held, "releasing exited thread port");
                unsafe {
                    let _ = ffi::mach_port_deallocate(mach_task_self(), *held);
                }
            }
            keep
        });
    }
}

/// [`ProcessController`] for a local macOS / iOS process.
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use armtrap_core::config::SessionConfig;
/// use armtrap_core::{Debugger, MachController, ProcessId};
///
/// let debugger = Debugger::new(Arc::new(MachController::new()), SessionConfig::default());
/// debugger.attach(ProcessId(12345))?;
/// println!("slide: {:#x}", debugger.aslr_slide()?);
/// debugger.detach()?;
/// # Ok::<(), armtrap_core::ArmtrapError>(())
/// ```
#[derive(Debug, Default)]
pub struct MachController
{
    state: Mutex<MachState>,
}

impl MachController
{
    /// Controller with no task attached.
    pub fn new() -> Self
    {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MachState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self) -> ArmtrapResult<mach_port_t>
    {
        self.lock().task()
    }

    /// Turn a failed `task_for_pid` into the error a user can act on.
    fn task_for_pid_error(pid: ProcessId, kr: libc::kern_return_t) -> ArmtrapError
    {
        let exists = unsafe { libc::kill(pid.0 as libc::pid_t, 0) } == 0
            || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        match MachError::from(kr) {
            MachError::ProtectionFailure => ArmtrapError::PermissionDenied(format!(
                "task_for_pid({pid}) refused; run as root or sign with the debugger entitlement"
            )),
            MachError::ProcessNotFound if exists => ArmtrapError::PermissionDenied(format!(
                "task_for_pid({pid}) failed with KERN_FAILURE but the process exists; run as root"
            )),
            MachError::ProcessNotFound | MachError::InvalidArgument => ArmtrapError::ProcessNotFound(pid.0),
            err => err.into(),
        }
    }

    fn thread_info<T: Default>(port: ThreadPort, flavor: c_int) -> Option<T>
    {
        let mut info = T::default();
        let mut count = ffi::info_count::<T>();
        let kr = unsafe { ffi::thread_info(port.0, flavor, &mut info as *mut T as *mut natural_t, &mut count) };
        (kr == KERN_SUCCESS).then_some(info)
    }

    fn describe_thread(port: ThreadPort) -> ThreadInfo
    {
        let kernel_id = Self::thread_info::<ffi::ThreadIdentifierInfo>(port, THREAD_IDENTIFIER_INFO)
            .map(|info| info.thread_id)
            .unwrap_or(u64::from(port.0));
        let name = Self::thread_info::<ffi::ThreadExtendedInfo>(port, THREAD_EXTENDED_INFO)
            .map(|info| {
                let bytes: Vec<u8> = info
                    .pth_name
                    .iter()
                    .take_while(|c| **c != 0)
                    .map(|c| *c as u8)
                    .collect();
                String::from_utf8_lossy(&bytes).into_owned()
            })
            .unwrap_or_default();
        ThreadInfo { port, kernel_id, name }
    }

    fn process_name(pid: ProcessId) -> String
    {
        match libproc::libproc::proc_pid::name(pid.0 as i32) {
            Ok(name) => name,
            Err(err) => {
                debug!(%pid, "proc_name failed: {err}");
                String::new()
            }
        }
    }

    fn sysctl_u32(name: &str) -> Option<u32>
    {
        let cname = CString::new(name).ok()?;
        let mut value: u32 = 0;
        let mut size = mem::size_of::<u32>();
        let rc = unsafe {
            libc::sysctlbyname(
                cname.as_ptr(),
                &mut value as *mut u32 as *mut c_void,
                &mut size,
                ptr::null_mut(),
                0,
            )
        };
        (rc == 0).then_some(value)
    }

    fn hardware_count(name: &str, fallback: usize) -> usize
    {
        match Self::sysctl_u32(name) {
            Some(count) => (count as usize).min(MAX_DEBUG_REGISTERS),
            None => {
                warn!("sysctl {name} unavailable, assuming {fallback}");
                fallback
            }
        }
    }

    fn ptrace(request: c_int, pid: ProcessId, addr: *mut c_char, data: c_int) -> ArmtrapResult<()>
    {
        let rc = unsafe { libc::ptrace(request, pid.0 as libc::pid_t, addr, data) };
        if rc == -1 {
            return Err(ArmtrapError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn send_reply(pending: PendingReply, success: bool) -> ArmtrapResult<()>
    {
        let mut reply = ExceptionReply {
            head: mach_msg_header_t {
                msgh_bits: MACH_MSGH_BITS(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0),
                msgh_size: mem::size_of::<ExceptionReply>() as mach_msg_size_t,
                msgh_remote_port: pending.reply_port,
                msgh_local_port: MACH_PORT_NULL,
                msgh_voucher_port: MACH_PORT_NULL,
                msgh_id: pending.request_id + REPLY_ID_OFFSET,
            },
            ndr: unsafe { NDR_record },
            ret_code: if success { KERN_SUCCESS } else { libc::KERN_FAILURE },
        };

        let kr = unsafe {
            mach_msg(
                &mut reply.head,
                MACH_SEND_MSG,
                reply.head.msgh_size,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr != MACH_MSG_SUCCESS {
            return Err(ArmtrapError::ResumeFailed(format!("exception reply failed: {kr:#x}")));
        }
        Ok(())
    }

    /// Receive one request from the exception port, or `None` once the
    /// port is gone. With `poll` set an empty port also yields `None`.
    fn receive(&self, poll: bool) -> ArmtrapResult<Option<TrapMessage>>
    {
        let port = self.lock().exception_port;
        if port == MACH_PORT_NULL {
            return Ok(None);
        }

        let (options, timeout) = if poll {
            (MACH_RCV_MSG | MACH_RCV_LARGE | MACH_RCV_TIMEOUT, 0)
        } else {
            (MACH_RCV_MSG | MACH_RCV_LARGE, MACH_MSG_TIMEOUT_NONE)
        };
        let mut buffer = ReceiveBuffer([0; RECEIVE_BUFFER_SIZE]);
        let kr = unsafe {
            mach_msg(
                buffer.0.as_mut_ptr() as *mut mach_msg_header_t,
                options,
                0,
                RECEIVE_BUFFER_SIZE as mach_msg_size_t,
                port,
                timeout,
                MACH_PORT_NULL,
            )
        };
        if kr == MACH_RCV_PORT_DIED || kr == MACH_RCV_INVALID_NAME {
            debug!("exception port closed");
            return Ok(None);
        }
        if poll && kr == MACH_RCV_TIMED_OUT {
            return Ok(None);
        }
        if kr != MACH_MSG_SUCCESS {
            return Err(ArmtrapError::ProtocolError(format!("mach_msg receive failed: {kr:#x}")));
        }

        let request = unsafe { ptr::read_unaligned(buffer.0.as_ptr() as *const ExceptionRequest) };
        self.accept(&request).map(Some)
    }

    /// Take ownership of one received request.
    fn accept(&self, request: &ExceptionRequest) -> ArmtrapResult<TrapMessage>
    {
        let head = request.head;
        let pending = PendingReply {
            reply_port: head.msgh_remote_port,
            request_id: head.msgh_id,
        };

        if head.msgh_id != MACH_EXCEPTION_RAISE_ID || (head.msgh_size as usize) < mem::size_of::<ExceptionRequest>() - 16
        {
            let _ = Self::send_reply(pending, false);
            return Err(ArmtrapError::ProtocolError(format!(
                "unexpected message id {} size {}",
                head.msgh_id, head.msgh_size
            )));
        }

        let task_port = request.task.name;
        unsafe {
            let _ = ffi::mach_port_deallocate(mach_task_self(), task_port);
        }

        let code = request.code;
        let code_count = (request.code_count as usize).min(code.len());
        let codes: SmallVec<[i64; 2]> = code[..code_count].iter().copied().collect();

        let mut state = self.lock();
        state.hold_thread_port(request.thread.name);
        state.next_token += 1;
        let token = ReplyToken(state.next_token);
        state.pending.insert(token.0, pending);
        drop(state);

        let message = TrapMessage {
            token,
            thread: ThreadPort(request.thread.name),
            exception: ExceptionType::from_raw(request.exception),
            codes,
        };
        trace!(token = token.0, exception = %message.exception, codes = ?message.codes, "mach exception");
        Ok(message)
    }
}

impl ProcessController for MachController
{
    fn attach(&self, pid: ProcessId) -> ArmtrapResult<TaskInfo>
    {
        let mut state = self.lock();
        if let Some(current) = state.pid {
            return Err(ArmtrapError::AlreadyAttached(current.0));
        }

        let mut task: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe { ffi::task_for_pid(mach_task_self(), pid.0 as c_int, &mut task) };
        if kr != KERN_SUCCESS {
            return Err(Self::task_for_pid_error(pid, kr));
        }

        if let Err(err) = Self::ptrace(PT_ATTACHEXC, pid, ptr::null_mut(), 0) {
            unsafe {
                let _ = ffi::mach_port_deallocate(mach_task_self(), task);
            }
            return Err(match err {
                ArmtrapError::Io(io) if io.raw_os_error() == Some(libc::EPERM) => {
                    ArmtrapError::PermissionDenied(format!("ptrace(PT_ATTACHEXC, {pid}): {io}"))
                }
                ArmtrapError::Io(io) if io.raw_os_error() == Some(libc::ESRCH) => ArmtrapError::ProcessNotFound(pid.0),
                other => other,
            });
        }

        state.pid = Some(pid);
        state.task = task;
        state.traced = true;
        drop(state);

        let info = TaskInfo {
            name: Self::process_name(pid),
            hw_breakpoints: Self::hardware_count(SYSCTL_BREAKPOINTS, FALLBACK_BREAKPOINTS),
            hw_watchpoints: Self::hardware_count(SYSCTL_WATCHPOINTS, FALLBACK_WATCHPOINTS),
        };
        info!(%pid, task, name = %info.name, "acquired task port");
        Ok(info)
    }

    fn detach(&self, graceful: bool) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        let pid = state.pid()?;
        if !state.traced {
            return Ok(());
        }
        state.traced = false;
        drop(state);

        if !graceful {
            return Ok(());
        }

        unsafe {
            libc::kill(pid.0 as libc::pid_t, libc::SIGSTOP);
        }
        let detached = Self::ptrace(PT_DETACH, pid, 1 as *mut c_char, 0);
        unsafe {
            libc::kill(pid.0 as libc::pid_t, libc::SIGCONT);
        }
        detached
    }

    fn suspend(&self) -> ArmtrapResult<()>
    {
        let task = self.task()?;
        let kr = unsafe { task_suspend(task) };
        kern_check(kr).map_err(|err| ArmtrapError::SuspendFailed(format!("task_suspend: {err}")))
    }

    fn resume(&self) -> ArmtrapResult<()>
    {
        let task = self.task()?;
        let kr = unsafe { task_resume(task) };
        kern_check(kr).map_err(|err| ArmtrapError::ResumeFailed(format!("task_resume: {err}")))
    }

    fn suspend_thread(&self, port: ThreadPort) -> ArmtrapResult<()>
    {
        let kr = unsafe { ffi::thread_suspend(port.0) };
        kern_check(kr).map_err(|err| ArmtrapError::SuspendFailed(format!("thread_suspend({port}): {err}")))
    }

    fn resume_thread(&self, port: ThreadPort) -> ArmtrapResult<()>
    {
        let kr = unsafe { ffi::thread_resume(port.0) };
        kern_check(kr).map_err(|err| ArmtrapError::ResumeFailed(format!("thread_resume({port}): {err}")))
    }

    fn threads(&self) -> ArmtrapResult<Vec<ThreadInfo>>
    {
        let task = self.task()?;
        let mut list: *mut thread_act_t = ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        let kr = unsafe { task_threads(task, &mut list, &mut count) };
        kern_check(kr)?;

        let ports: Vec<ThreadPort> = if list.is_null() {
            Vec::new()
        } else {
            let slice = unsafe { std::slice::from_raw_parts(list, count as usize) };
            slice.iter().map(|port| ThreadPort(*port)).collect()
        };
        if !list.is_null() && count > 0 {
            let size = (count as usize).saturating_mul(mem::size_of::<thread_act_t>());
            unsafe {
                let _ = ffi::vm_deallocate(mach_task_self() as vm_map_t, list as usize, size);
            }
        }

        let mut state = self.lock();
        for port in &ports {
            state.hold_thread_port(port.0);
        }
        state.forget_thread_ports(&ports);
        drop(state);

        Ok(ports.into_iter().map(Self::describe_thread).collect())
    }

    fn read_memory(&self, address: Address, len: usize) -> ArmtrapResult<Vec<u8>>
    {
        memory::read(self.task()?, address, len)
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> ArmtrapResult<()>
    {
        memory::write(self.task()?, address, data)
    }

    fn first_region_base(&self) -> ArmtrapResult<Address>
    {
        let task = self.task()?;
        let mut cursor = 0u64;
        // __PAGEZERO is reported with no access rights; the image starts after it.
        while let Some(region) = memory::region_at_or_above(task, cursor)? {
            if region.protection != libc::VM_PROT_NONE {
                return Ok(Address::new(region.start));
            }
            cursor = region.start.saturating_add(region.size.max(1));
        }
        Err(ArmtrapError::invalid_address(0, "task has no accessible regions"))
    }

    fn registers(&self, port: ThreadPort) -> ArmtrapResult<Arm64Registers>
    {
        let mut words = [0u32; THREAD_STATE_WORDS];
        let mut count = ARM_THREAD_STATE64_COUNT;
        let kr = unsafe { ffi::thread_get_state(port.0, ARM_THREAD_STATE64, words.as_mut_ptr(), &mut count) };
        kern_check(kr)?;
        Arm64Registers::from_words(&words[..count as usize])
            .ok_or_else(|| ArmtrapError::ProtocolError(format!("short thread state from {port}: {count} words")))
    }

    fn debug_state(&self, port: ThreadPort) -> ArmtrapResult<DebugState>
    {
        let mut words = [0u32; DEBUG_STATE_WORDS];
        let mut count = ARM_DEBUG_STATE64_COUNT;
        let kr = unsafe { ffi::thread_get_state(port.0, ARM_DEBUG_STATE64, words.as_mut_ptr(), &mut count) };
        kern_check(kr)?;
        Ok(DebugState::from_words(&words))
    }

    fn set_debug_state(&self, port: ThreadPort, state: &DebugState) -> ArmtrapResult<()>
    {
        let words = state.to_words();
        let kr =
            unsafe { ffi::thread_set_state(port.0, ARM_DEBUG_STATE64, words.as_ptr(), ARM_DEBUG_STATE64_COUNT) };
        kern_check(kr)?;
        Ok(())
    }

    fn register_trap_handler(&self) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        let task = state.task()?;
        let this = unsafe { mach_task_self() };

        let mut saved = SavedExceptionPorts {
            count: 0,
            masks: [0; EXC_TYPES_COUNT],
            ports: [MACH_PORT_NULL; EXC_TYPES_COUNT],
            behaviors: [0; EXC_TYPES_COUNT],
            flavors: [0; EXC_TYPES_COUNT],
        };
        let mut count = EXC_TYPES_COUNT as mach_msg_type_number_t;
        let kr = unsafe {
            ffi::task_get_exception_ports(
                task,
                EXC_MASK_DEBUGGER,
                saved.masks.as_mut_ptr(),
                &mut count,
                saved.ports.as_mut_ptr(),
                saved.behaviors.as_mut_ptr(),
                saved.flavors.as_mut_ptr(),
            )
        };
        kern_check(kr)?;
        saved.count = (count as usize).min(EXC_TYPES_COUNT);

        let mut port: mach_port_t = MACH_PORT_NULL;
        kern_check(unsafe { ffi::mach_port_allocate(this, MACH_PORT_RIGHT_RECEIVE, &mut port) })?;
        let inserted = kern_check(unsafe { ffi::mach_port_insert_right(this, port, port, MACH_MSG_TYPE_MAKE_SEND) })
            .and_then(|()| {
                kern_check(unsafe {
                    ffi::task_set_exception_ports(
                        task,
                        EXC_MASK_DEBUGGER,
                        port,
                        EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES,
                        THREAD_STATE_NONE,
                    )
                })
            });
        if let Err(err) = inserted {
            unsafe {
                let _ = ffi::mach_port_mod_refs(this, port, MACH_PORT_RIGHT_RECEIVE, -1);
            }
            return Err(err.into());
        }

        state.exception_port = port;
        state.saved = Some(saved);
        debug!(port, saved = saved.count, "exception port registered");
        Ok(())
    }

    fn restore_trap_handler(&self) -> ArmtrapResult<()>
    {
        let mut state = self.lock();
        let task = state.task()?;
        let Some(saved) = state.saved.take() else {
            return Ok(());
        };

        let mut first_error = None;
        for i in 0..saved.count {
            let kr = unsafe {
                ffi::task_set_exception_ports(task, saved.masks[i], saved.ports[i], saved.behaviors[i], saved.flavors[i])
            };
            if let Err(err) = kern_check(kr) {
                warn!(mask = format_args!("{:#x}", saved.masks[i]), "restoring exception port: {err}");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn receive_trap(&self) -> ArmtrapResult<Option<TrapMessage>>
    {
        self.receive(false)
    }

    fn try_receive_trap(&self) -> ArmtrapResult<Option<TrapMessage>>
    {
        self.receive(true)
    }

    fn reply_trap(&self, token: ReplyToken, success: bool) -> ArmtrapResult<()>
    {
        let pending = self
            .lock()
            .pending
            .remove(&token.0)
            .ok_or_else(|| ArmtrapError::ProtocolError(format!("reply to unknown trap {}", token.0)))?;
        Self::send_reply(pending, success)
    }

    fn update_thread_signal(&self, port: ThreadPort, signal: Option<i32>) -> ArmtrapResult<()>
    {
        let pid = self.lock().pid()?;
        Self::ptrace(PT_THUPDATE, pid, port.0 as usize as *mut c_char, signal.unwrap_or(0))
    }

    fn is_alive(&self) -> bool
    {
        let state = self.lock();
        let Some(pid) = state.pid else {
            return false;
        };

        let rc = unsafe { libc::kill(pid.0 as libc::pid_t, 0) };
        if rc == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
            return false;
        }

        let mut kind: u32 = 0;
        let kr = unsafe { ffi::mach_port_type(mach_task_self(), state.task, &mut kind) };
        kr == KERN_SUCCESS && kind & MACH_PORT_TYPE_DEAD_NAME == 0
    }

    fn release(&self)
    {
        let mut state = self.lock();
        let this = unsafe { mach_task_self() };

        if state.exception_port != MACH_PORT_NULL {
            let kr = unsafe { ffi::mach_port_mod_refs(this, state.exception_port, MACH_PORT_RIGHT_RECEIVE, -1) };
            if kr != KERN_SUCCESS {
                warn!(port = state.exception_port, "destroying exception port failed: {kr}");
            }
        }
        if state.task != MACH_PORT_NULL {
            unsafe {
                let _ = ffi::mach_port_deallocate(this, state.task);
            }
        }
        if !state.pending.is_empty() {
            warn!(count = state.pending.len(), "releasing with unanswered traps");
        }
        state.forget_thread_ports(&[]);

        *state = MachState {
            next_token: state.next_token,
            ..MachState::default()
        };
        debug!("released task and exception ports");
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_request_layout_matches_mig()
    {
        // header 24, body 4, two port descriptors 12 each, NDR 8, exception 4, count 4, codes 16
        assert_eq!(mem::size_of::<ExceptionRequest>(), 84);
        assert_eq!(mem::size_of::<ExceptionReply>(), 36);
    }

    #[test]
    fn test_thread_port_references_are_held_once()
    {
        let mut state = MachState::default();
        // Each call hands us one more reference on the same name.
        let first = unsafe { mach2::mach_init::mach_thread_self() };
        let second = unsafe { mach2::mach_init::mach_thread_self() };
        assert_eq!(first, second);

        state.hold_thread_port(first);
        state.hold_thread_port(second);
        assert_eq!(state.thread_ports.len(), 1);

        state.forget_thread_ports(&[ThreadPort(first)]);
        assert!(state.thread_ports.contains(&first));
        state.forget_thread_ports(&[]);
        assert!(state.thread_ports.is_empty());
    }

    #[test]
    fn test_unattached_controller_refuses_work()
    {
        let ctl = MachController::new();
        assert!(!ctl.is_alive());
        assert!(matches!(ctl.threads(), Err(ArmtrapError::NotAttached)));
        assert!(matches!(ctl.receive_trap(), Ok(None)));
        assert!(matches!(ctl.try_receive_trap(), Ok(None)));
        assert!(matches!(
            ctl.reply_trap(ReplyToken(1), true),
            Err(ArmtrapError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_missing_process_is_not_found()
    {
        let ctl = MachController::new();
        let err = ctl.attach(ProcessId(i32::MAX as u32)).unwrap_err();
        assert!(matches!(
            err,
            ArmtrapError::ProcessNotFound(_) | ArmtrapError::PermissionDenied(_)
        ));
    }
}
