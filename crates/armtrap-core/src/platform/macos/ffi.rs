//! # Mach FFI Declarations
//!
//! `extern "C"` declarations for the Mach calls the backend needs that
//! `mach2` either lacks or types differently. Everything else comes from
//! `mach2` directly.
//!
//! All of these are `unsafe`: they take raw port names and out-pointers, and
//! `task_for_pid` in particular needs root or the debugger entitlement.
//! [`super::controller::MachController`] is the only caller and wraps them
//! in safe methods.
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - XNU sources: `osfmk/mach/task.defs`, `osfmk/mach/thread_act.defs`, `osfmk/mach/mach_port.defs`

#![allow(unused_doc_comments)]

use libc::{c_int, c_char, kern_return_t, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t, vm_map_t};

/// `vm_region_basic_info_data_64_t`, the `VM_REGION_BASIC_INFO_64` flavor.
#[repr(C, packed(4))]
#[derive(Debug, Default, Clone, Copy)]
pub struct VmRegionBasicInfo64
{
    /// Current protection (`VM_PROT_*`)
    pub protection: c_int,
    /// Ceiling for `protection`
    pub max_protection: c_int,
    /// Inheritance on fork
    pub inheritance: u32,
    /// Shared mapping
    pub shared: u32,
    /// Reserved
    pub reserved: u32,
    /// Offset into the backing object
    pub offset: u64,
    /// Paging behaviour hint
    pub behavior: c_int,
    /// User wire count
    pub user_wired_count: u16,
}

/// `VM_REGION_BASIC_INFO_64`
pub const VM_REGION_BASIC_INFO_64: c_int = 9;

/// Words in [`VmRegionBasicInfo64`]
pub const VM_REGION_BASIC_INFO_COUNT_64: mach_msg_type_number_t =
    (std::mem::size_of::<VmRegionBasicInfo64>() / std::mem::size_of::<natural_t>()) as mach_msg_type_number_t;

/// `thread_identifier_info_data_t`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadIdentifierInfo
{
    /// System-wide unique thread id
    pub thread_id: u64,
    /// pthread handle
    pub thread_handle: u64,
    /// libdispatch queue address
    pub dispatch_qaddr: u64,
}

/// `thread_extended_info_data_t`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ThreadExtendedInfo
{
    pub pth_user_time: u64,
    pub pth_system_time: u64,
    pub pth_cpu_usage: i32,
    pub pth_policy: i32,
    pub pth_run_state: i32,
    pub pth_flags: i32,
    pub pth_sleep_time: i32,
    pub pth_curpri: i32,
    pub pth_priority: i32,
    pub pth_maxpriority: i32,
    /// NUL-terminated pthread name
    pub pth_name: [c_char; 64],
}

impl Default for ThreadExtendedInfo
{
    fn default() -> Self
    {
        Self {
            pth_user_time: 0,
            pth_system_time: 0,
            pth_cpu_usage: 0,
            pth_policy: 0,
            pth_run_state: 0,
            pth_flags: 0,
            pth_sleep_time: 0,
            pth_curpri: 0,
            pth_priority: 0,
            pth_maxpriority: 0,
            pth_name: [0; 64],
        }
    }
}

/// Words in `T`, for `thread_info` counts.
pub const fn info_count<T>() -> mach_msg_type_number_t
{
    (std::mem::size_of::<T>() / std::mem::size_of::<natural_t>()) as mach_msg_type_number_t
}

// Tasks and ports
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Task port of `pid`. Needs root or the debugger entitlement; returns
    /// `KERN_FAILURE` both for a missing process and, on some releases, for
    /// a refused one.
    pub fn task_for_pid(target_task: mach_port_t, pid: c_int, task: *mut mach_port_t) -> kern_return_t;

    /// Drop one user reference on a send right.
    pub fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;

    /// Allocate a new right (here: a receive right for the exception port).
    pub fn mach_port_allocate(task: mach_port_t, right: u32, name: *mut mach_port_t) -> kern_return_t;

    /// Add a right to `name`, used to make a send right from our receive right.
    pub fn mach_port_insert_right(task: mach_port_t, name: mach_port_t, poly: mach_port_t, poly_poly: u32)
        -> kern_return_t;

    /// Adjust the user reference count of a right; -1 on a receive right
    /// destroys the port and wakes any blocked receiver.
    pub fn mach_port_mod_refs(task: mach_port_t, name: mach_port_t, right: u32, delta: c_int) -> kern_return_t;

    /// Rights held under `name`; a dead task port reports `MACH_PORT_TYPE_DEAD_NAME`.
    pub fn mach_port_type(task: mach_port_t, name: mach_port_t, ptype: *mut u32) -> kern_return_t;

    /// Route the masked exception classes to `new_port`.
    pub fn task_set_exception_ports(
        task: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: c_int,
        new_flavor: c_int,
    ) -> kern_return_t;

    /// Current routing for the masked exception classes.
    pub fn task_get_exception_ports(
        task: mach_port_t,
        exception_mask: u32,
        masks: *mut u32,
        masks_count: *mut mach_msg_type_number_t,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut c_int,
        old_flavors: *mut c_int,
    ) -> kern_return_t;
}

// Threads
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Read one state flavor of a thread.
    pub fn thread_get_state(
        target_act: thread_act_t,
        flavor: c_int,
        old_state: *mut natural_t,
        old_state_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Write one state flavor of a thread.
    pub fn thread_set_state(
        target_act: thread_act_t,
        flavor: c_int,
        new_state: *const natural_t,
        new_state_count: mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Increment a thread's suspend count.
    pub fn thread_suspend(target_act: thread_act_t) -> kern_return_t;

    /// Decrement a thread's suspend count.
    pub fn thread_resume(target_act: thread_act_t) -> kern_return_t;

    /// Identifier and name information about a thread.
    pub fn thread_info(
        target_act: thread_act_t,
        flavor: c_int,
        thread_info_out: *mut natural_t,
        thread_info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
}

// Virtual memory
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Copy target memory into a caller-owned buffer.
    pub fn mach_vm_read_overwrite(
        target_task: vm_map_t,
        address: u64,
        size: u64,
        data: u64,
        out_size: *mut u64,
    ) -> kern_return_t;

    /// Copy caller memory into the target.
    pub fn mach_vm_write(target_task: vm_map_t, address: u64, data: usize, data_count: mach_msg_type_number_t)
        -> kern_return_t;

    /// Change the current protection of a page range.
    pub fn mach_vm_protect(
        target_task: vm_map_t,
        address: u64,
        size: u64,
        set_maximum: c_int,
        new_protection: c_int,
    ) -> kern_return_t;

    /// Region containing or following `*address`.
    pub fn mach_vm_region(
        target_task: vm_map_t,
        address: *mut u64,
        size: *mut u64,
        flavor: c_int,
        info: *mut c_int,
        info_count: *mut mach_msg_type_number_t,
        object_name: *mut mach_port_t,
    ) -> kern_return_t;

    /// Free memory handed out by the kernel (thread arrays).
    pub fn vm_deallocate(target_task: vm_map_t, address: usize, size: usize) -> kern_return_t;
}
