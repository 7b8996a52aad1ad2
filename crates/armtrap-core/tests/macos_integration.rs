//! Integration tests for the Mach backend
//!
//! These tests require:
//! - Running on macOS (`#[cfg(target_os = "macos")]`)
//! - Root or the debugger entitlement for the `#[ignore]`d ones, which
//!   spawn and attach to `/bin/sleep`
//!
//! Run the ignored tests with `sudo cargo test -- --ignored`.

#![cfg(target_os = "macos")]

use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use armtrap_core::config::SessionConfig;
use armtrap_core::debug_state::WatchAccess;
use armtrap_core::events::TrapEvent;
use armtrap_core::threads::ThreadScope;
use armtrap_core::{Address, ArmtrapError, Debugger, MachController, ProcessId};

fn debugger() -> Debugger
{
    Debugger::new(Arc::new(MachController::new()), SessionConfig::default())
}

struct Sleeper(Child);

impl Sleeper
{
    fn spawn() -> Self
    {
        Self(Command::new("/bin/sleep").arg("30").spawn().unwrap())
    }

    fn pid(&self) -> ProcessId
    {
        ProcessId(self.0.id())
    }
}

impl Drop for Sleeper
{
    fn drop(&mut self)
    {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn test_attach_invalid_pid()
{
    let debugger = debugger();
    match debugger.attach(ProcessId(u32::MAX >> 1)) {
        Err(ArmtrapError::ProcessNotFound(_) | ArmtrapError::PermissionDenied(_)) => {}
        other => panic!("unexpected result {other:?}"),
    }
    assert!(!debugger.is_attached());
}

#[test]
fn test_not_attached_operations()
{
    let debugger = debugger();
    assert!(matches!(debugger.read_registers(None), Err(ArmtrapError::NotAttached)));
    assert!(matches!(debugger.list_threads(), Err(ArmtrapError::NotAttached)));
    assert!(matches!(debugger.detach(), Err(ArmtrapError::NotAttached)));
}

#[test]
#[ignore = "needs root or the debugger entitlement"]
fn test_attach_inspect_detach()
{
    let sleeper = Sleeper::spawn();
    let debugger = debugger();
    debugger.attach(sleeper.pid()).unwrap();

    let threads = debugger.list_threads().unwrap();
    assert!(!threads.is_empty());
    let regs = debugger.read_registers(Some(threads[0].id)).unwrap();
    assert_ne!(regs.pc, 0);
    assert_ne!(regs.sp, 0);

    let pc = Address::new(regs.pc);
    let before = debugger.read_memory(pc, 4).unwrap();
    debugger.set_breakpoint(pc, false, ThreadScope::All).unwrap();

    let sp = Address::new(regs.sp & !0x7);
    debugger.set_watchpoint(sp, 8, WatchAccess::Write, ThreadScope::All).unwrap();

    debugger.detach().unwrap();
    assert!(!debugger.is_attached());

    // Detach restored the text page.
    debugger.attach(sleeper.pid()).unwrap();
    assert_eq!(debugger.read_memory(pc, 4).unwrap(), before);
    debugger.detach().unwrap();
}

#[test]
#[ignore = "needs root or the debugger entitlement"]
fn test_interrupt_running_target()
{
    let sleeper = Sleeper::spawn();
    let debugger = debugger();
    debugger.attach(sleeper.pid()).unwrap();

    let seq = debugger.resume().unwrap();
    assert!(debugger.wait_for_stop(seq, Some(Duration::from_millis(200))).unwrap().is_none());
    debugger.interrupt().unwrap();
    let stop = debugger.wait_for_stop(seq, Some(Duration::from_secs(1))).unwrap().unwrap();
    assert_eq!(stop.report, Some(TrapEvent::Interrupted));
    debugger.detach().unwrap();
}
