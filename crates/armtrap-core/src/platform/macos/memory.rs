//! # Target Memory
//!
//! Reads and writes through `mach_vm_read_overwrite` / `mach_vm_write`.
//!
//! Writing a `BRK` into a text page needs the page to be writable for the
//! duration of the write. [`ProtectionGuard`] lifts the protection and puts
//! the original back when dropped, so an early return cannot leave a code
//! page writable.

use libc::{c_int, mach_msg_type_number_t, mach_port_t, vm_map_t};
use tracing::warn;

use crate::error::{ArmtrapError, ArmtrapResult};
use crate::platform::macos::error::{kern_check, kern_check_address};
use crate::platform::macos::ffi;
use crate::types::Address;

/// Ask for a private copy of a copy-on-write mapping.
const VM_PROT_COPY: c_int = 0x10;

/// One mapped region as reported by `mach_vm_region`.
#[derive(Debug, Clone, Copy)]
pub struct Region
{
    pub start: u64,
    pub size: u64,
    pub protection: c_int,
    pub max_protection: c_int,
}

impl Region
{
    fn end(&self) -> u64
    {
        self.start.saturating_add(self.size)
    }
}

/// Region containing `address`, or the first one above it.
///
/// `None` past the end of the address space.
pub fn region_at_or_above(task: mach_port_t, address: u64) -> ArmtrapResult<Option<Region>>
{
    let mut start = address;
    let mut size = 0u64;
    let mut info = ffi::VmRegionBasicInfo64::default();
    let mut count = ffi::VM_REGION_BASIC_INFO_COUNT_64;
    let mut object: mach_port_t = 0;

    let kr = unsafe {
        ffi::mach_vm_region(
            task as vm_map_t,
            &mut start,
            &mut size,
            ffi::VM_REGION_BASIC_INFO_64,
            &mut info as *mut ffi::VmRegionBasicInfo64 as *mut c_int,
            &mut count,
            &mut object,
        )
    };
    if kr == libc::KERN_INVALID_ADDRESS {
        return Ok(None);
    }
    kern_check(kr)?;

    Ok(Some(Region {
        start,
        size,
        protection: info.protection,
        max_protection: info.max_protection,
    }))
}

/// Region that fully contains `[address, address + len)`.
fn containing_region(task: mach_port_t, address: Address, len: usize) -> ArmtrapResult<Region>
{
    let end = address
        .value()
        .checked_add(len as u64)
        .ok_or_else(|| ArmtrapError::invalid_address(address.value(), "range overflows"))?;
    match region_at_or_above(task, address.value())? {
        Some(region) if region.start <= address.value() && end <= region.end() => Ok(region),
        _ => Err(ArmtrapError::invalid_address(address.value(), "not mapped")),
    }
}

pub fn read(task: mach_port_t, address: Address, len: usize) -> ArmtrapResult<Vec<u8>>
{
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = vec![0u8; len];
    let mut out_size = 0u64;
    let kr = unsafe {
        ffi::mach_vm_read_overwrite(
            task as vm_map_t,
            address.value(),
            len as u64,
            buffer.as_mut_ptr() as u64,
            &mut out_size,
        )
    };
    kern_check_address(kr, address.value(), "mach_vm_read_overwrite")?;
    if out_size as usize != len {
        return Err(ArmtrapError::invalid_address(
            address.value(),
            format!("short read: {out_size} of {len} bytes"),
        ));
    }
    Ok(buffer)
}

/// Write `data`, making the pages writable first if they are not.
pub fn write(task: mach_port_t, address: Address, data: &[u8]) -> ArmtrapResult<()>
{
    if data.is_empty() {
        return Ok(());
    }

    let region = containing_region(task, address, data.len())?;
    let _guard = if region.protection & libc::VM_PROT_WRITE == 0 {
        Some(ProtectionGuard::make_writable(task, address, data.len(), region)?)
    } else {
        None
    };

    let kr = unsafe {
        ffi::mach_vm_write(
            task as vm_map_t,
            address.value(),
            data.as_ptr() as usize,
            data.len() as mach_msg_type_number_t,
        )
    };
    kern_check_address(kr, address.value(), "mach_vm_write")
}

/// Restores a page range's protection when dropped.
#[derive(Debug)]
pub struct ProtectionGuard
{
    task: mach_port_t,
    start: u64,
    len: u64,
    original: c_int,
}

impl ProtectionGuard
{
    /// Make `[address, address + len)` read/write.
    ///
    /// Text pages are mapped copy-on-write, so `VM_PROT_COPY` is requested
    /// when the region's ceiling does not include write.
    pub fn make_writable(task: mach_port_t, address: Address, len: usize, region: Region) -> ArmtrapResult<Self>
    {
        let (start, aligned_len) = page_range(address, len);
        let mut protection = libc::VM_PROT_READ | libc::VM_PROT_WRITE;
        if region.max_protection & libc::VM_PROT_WRITE == 0 {
            protection |= VM_PROT_COPY;
        }

        let kr = unsafe { ffi::mach_vm_protect(task as vm_map_t, start, aligned_len, 0, protection) };
        kern_check_address(kr, address.value(), "mach_vm_protect")?;

        Ok(Self {
            task,
            start,
            len: aligned_len,
            original: region.protection,
        })
    }
}

impl Drop for ProtectionGuard
{
    fn drop(&mut self)
    {
        let kr = unsafe { ffi::mach_vm_protect(self.task as vm_map_t, self.start, self.len, 0, self.original) };
        if kr != libc::KERN_SUCCESS {
            warn!(start = format_args!("{:#x}", self.start), "restoring page protection failed: {kr}");
        }
    }
}

fn page_size() -> u64
{
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        0x4000
    }
}

/// Page-aligned start and length covering `[address, address + len)`.
fn page_range(address: Address, len: usize) -> (u64, u64)
{
    let page = page_size();
    let start = address.align_down(page).value();
    let end = address.value().saturating_add(len as u64);
    let aligned_end = end.saturating_add(page - 1) & !(page - 1);
    (start, aligned_end - start)
}
