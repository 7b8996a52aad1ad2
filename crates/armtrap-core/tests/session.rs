//! End-to-end debugging sessions against the simulated target
//!
//! Every test drives a real [`Debugger`] (listener and death watcher
//! threads included) through the [`SimulatedController`], then checks both
//! what the user saw and what was left behind in the target.

use std::collections::HashSet;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use armtrap_core::breakpoints::{BreakpointId, TRAP_OPCODE};
use armtrap_core::config::SessionConfig;
use armtrap_core::controller::ProcessController;
use armtrap_core::debug_state::WatchAccess;
use armtrap_core::events::{DebuggerEvent, TrapEvent};
use armtrap_core::exception::{ExceptionType, EXC_ARM_BREAKPOINT};
use armtrap_core::platform::simulated::SimulatedController;
use armtrap_core::signals::SignalPolicy;
use armtrap_core::threads::ThreadScope;
use armtrap_core::types::ThreadPort;
use armtrap_core::{Address, ArmtrapError, Debugger, ProcessId, ThreadId};

const PID: u32 = 100;
const BASE: u64 = 0x1_0000_0000;
const SLIDE: u64 = 0x8000;
const TEXT: u64 = BASE + SLIDE;
const DATA: u64 = TEXT + 0x3000;
const MAIN: ThreadPort = ThreadPort(0x103);
const WORKER: ThreadPort = ThreadPort(0x207);
const TIMEOUT: Duration = Duration::from_secs(5);

fn target() -> SimulatedController
{
    SimulatedController::new(PID)
        .with_region(TEXT, vec![0x1f; 0x4000])
        .with_thread(MAIN, TEXT)
        .with_thread(WORKER, TEXT + 0x400)
}

fn attached(sim: &Arc<SimulatedController>) -> Debugger
{
    let config = SessionConfig::default().with_death_poll_interval(Duration::from_millis(10));
    let debugger = Debugger::new(sim.clone(), config);
    debugger.attach(ProcessId(PID)).unwrap();
    debugger
}

/// Next event that is not `Resumed`.
fn next_event(events: &Receiver<DebuggerEvent>) -> DebuggerEvent
{
    loop {
        match events.recv_timeout(TIMEOUT).unwrap() {
            DebuggerEvent::Resumed => continue,
            event => return event,
        }
    }
}

#[test]
fn test_attach_reports_slide_and_threads()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);

    assert_eq!(debugger.pid(), Some(ProcessId(PID)));
    assert_eq!(debugger.aslr_slide().unwrap(), SLIDE);

    let threads = debugger.list_threads().unwrap();
    let ports: Vec<_> = threads.iter().map(|t| t.port).collect();
    assert_eq!(ports, vec![MAIN, WORKER]);
    assert_eq!(threads[0].id, ThreadId(1));
    assert_eq!(threads[0].name, "main");

    // Attach leaves the target stopped, so registers are readable.
    assert_eq!(debugger.read_registers(Some(ThreadId(2))).unwrap().pc, TEXT + 0x400);
    debugger.detach().unwrap();
}

#[test]
fn test_breakpoint_hit_then_transparent_step_over()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    let address = Address::new(TEXT + 0x1000);
    let id = debugger.set_breakpoint(address, false, ThreadScope::All).unwrap();
    assert_eq!(id, BreakpointId::User(1));
    let debug = sim.thread_debug_state(MAIN).unwrap();
    assert_eq!((debug.bvr[0], debug.bcr[0] & 1), (address.value(), 1));

    let seq = debugger.resume().unwrap();
    assert!(sim.run_to(MAIN, address.value()));
    let stop = debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert_eq!(
        stop.report,
        Some(TrapEvent::BreakpointHit {
            thread: ThreadId(1),
            id,
            address,
            hit_count: 1
        })
    );
    assert!(stop.to_string().contains("breakpoint 1 hit 1 time(s)"));
    assert_eq!(debugger.focused_thread().unwrap(), Some(ThreadId(1)));
    assert_eq!(debugger.read_registers(None).unwrap().pc, address.value());
    assert_eq!(debugger.pending_traps(), 1);

    // Continuing steps off the breakpoint without reporting anything and
    // re-arms it behind the thread.
    let seq = debugger.resume().unwrap();
    assert!(sim.wait_idle(TIMEOUT));
    assert_eq!(sim.thread_pc(MAIN), Some(address.value() + 4));
    assert_eq!(sim.thread_debug_state(MAIN).unwrap().bcr[0] & 1, 1);
    assert_eq!(debugger.pending_traps(), 0);

    assert!(sim.run_to(MAIN, address.value()));
    let stop = debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert!(matches!(stop.report, Some(TrapEvent::BreakpointHit { hit_count: 2, .. })));
    debugger.detach().unwrap();
}

#[test]
fn test_software_breakpoints_are_restored_on_detach()
{
    let sim = Arc::new(target().with_hardware(0, 4));
    let debugger = attached(&sim);
    let address = Address::new(TEXT + 0x2000);

    let first = debugger.set_breakpoint(address, false, ThreadScope::All).unwrap();
    let second = debugger.set_breakpoint(address, false, ThreadScope::All).unwrap();
    assert_eq!(sim.peek(address.value(), 4), Some(TRAP_OPCODE.to_vec()));

    debugger.delete_breakpoint(first).unwrap();
    assert_eq!(sim.peek(address.value(), 4), Some(TRAP_OPCODE.to_vec()));

    let seq = debugger.resume().unwrap();
    assert!(sim.run_to(WORKER, address.value()));
    let stop = debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert!(matches!(
        stop.report,
        Some(TrapEvent::BreakpointHit { id, thread: ThreadId(2), .. }) if id == second
    ));

    // The step-over re-patches the instruction once the worker has moved on.
    debugger.resume().unwrap();
    assert!(sim.wait_idle(TIMEOUT));
    assert_eq!(sim.thread_pc(WORKER), Some(address.value() + 4));
    assert_eq!(sim.peek(address.value(), 4), Some(TRAP_OPCODE.to_vec()));

    debugger.detach().unwrap();
    assert_eq!(sim.peek(address.value(), 4), Some(vec![0x1f; 4]));
}

#[test]
fn test_temporary_breakpoint_disappears_after_hit()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    let address = Address::new(TEXT + 0x800);
    let id = debugger.set_breakpoint(address, true, ThreadScope::All).unwrap();
    assert!(matches!(id, BreakpointId::Internal(_)));

    let seq = debugger.resume().unwrap();
    assert!(sim.run_to(MAIN, address.value()));
    debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert!(debugger.breakpoints().unwrap().is_empty());
    assert_eq!(sim.thread_debug_state(MAIN).unwrap().bcr[0] & 1, 0);
    debugger.detach().unwrap();
}

#[test]
fn test_watchpoint_reports_old_and_new_value()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    let events = debugger.subscribe();
    let address = Address::new(DATA);
    debugger.write_memory(address, &5i32.to_le_bytes()).unwrap();
    let id = debugger
        .set_watchpoint(address, 4, WatchAccess::Write, ThreadScope::All)
        .unwrap();

    debugger.resume().unwrap();
    assert!(sim.store(MAIN, DATA, &9i32.to_le_bytes()).unwrap());

    match next_event(&events) {
        DebuggerEvent::Notification(TrapEvent::WatchpointHit {
            thread,
            id: hit,
            address: reported,
            change,
            ..
        }) => {
            assert_eq!(thread, ThreadId(1));
            assert_eq!(hit, id);
            assert_eq!(reported, address);
            assert_eq!((change.size, change.old, change.new), (4, 5, 9));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // The hit is reported without stopping the target.
    assert!(sim.wait_idle(TIMEOUT));
    assert_eq!(sim.peek(DATA, 4), Some(9i32.to_le_bytes().to_vec()));
    assert_eq!(sim.thread_debug_state(MAIN).unwrap().wcr[0] & 1, 1);
    assert_eq!(debugger.watchpoints().unwrap()[0].hit_count, 1);

    // Stores that miss the watched range run straight through.
    assert!(!sim.store(MAIN, DATA + 8, &[1]).unwrap());
    debugger.detach().unwrap();
    assert_eq!(sim.thread_debug_state(MAIN).unwrap().wcr[0] & 1, 0);
}

#[test]
fn test_watchpoint_exhaustion()
{
    let sim = Arc::new(target().with_hardware(6, 1));
    let debugger = attached(&sim);
    debugger
        .set_watchpoint(Address::new(DATA), 8, WatchAccess::ReadWrite, ThreadScope::All)
        .unwrap();
    assert!(matches!(
        debugger.set_watchpoint(Address::new(DATA + 8), 4, WatchAccess::Write, ThreadScope::All),
        Err(ArmtrapError::ResourceExhausted(_))
    ));
    debugger.detach().unwrap();
}

#[test]
fn test_single_step_reports_new_pc()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    debugger.select_thread(ThreadId(2)).unwrap();

    let stop = debugger.single_step().unwrap();
    assert_eq!(
        stop.report,
        Some(TrapEvent::StepCompleted {
            thread: ThreadId(2),
            pc: Address::new(TEXT + 0x404)
        })
    );
    assert!(!sim.thread_debug_state(WORKER).unwrap().single_step());
    assert_eq!(debugger.read_registers(None).unwrap().pc, TEXT + 0x404);
    debugger.detach().unwrap();
}

#[test]
fn test_signal_policies_decide_stop_and_delivery()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    let events = debugger.subscribe();
    debugger
        .set_signal_policy(
            30,
            SignalPolicy {
                notify: true,
                pass: true,
                stop: false,
            },
        )
        .unwrap();

    let seq = debugger.resume().unwrap();
    sim.raise_signal(WORKER, 30).unwrap();
    assert_eq!(
        next_event(&events),
        DebuggerEvent::Notification(TrapEvent::Signal {
            thread: ThreadId(2),
            signal: 30,
            passed: true
        })
    );

    // SIGCHLD passes silently.
    sim.raise_signal(WORKER, 20).unwrap();
    assert!(sim.wait_idle(TIMEOUT));

    // SIGSEGV stops and is swallowed.
    sim.raise_signal(MAIN, 11).unwrap();
    let stop = debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert_eq!(
        stop.report,
        Some(TrapEvent::Signal {
            thread: ThreadId(1),
            signal: 11,
            passed: false
        })
    );
    assert_eq!(
        sim.signal_updates(),
        vec![(WORKER, Some(30)), (WORKER, Some(20)), (MAIN, None)]
    );
    debugger.detach().unwrap();
}

#[test]
fn test_concurrent_traps_get_exactly_one_reply_each()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    let address = Address::new(TEXT + 0x1800);
    debugger.set_breakpoint(address, false, ThreadScope::All).unwrap();
    #[allow(clippy::cast_possible_wrap)]
    let codes = [EXC_ARM_BREAKPOINT, address.value() as i64];

    let seq = debugger.resume().unwrap();
    sim.set_pc(MAIN, address.value()).unwrap();
    sim.set_pc(WORKER, address.value()).unwrap();
    sim.inject_trap(MAIN, ExceptionType::Breakpoint, &codes).unwrap();
    sim.inject_trap(WORKER, ExceptionType::Breakpoint, &codes).unwrap();

    let first = debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert!(matches!(first.report, Some(TrapEvent::BreakpointHit { hit_count: 1, .. })));

    let seq = debugger.resume().unwrap();
    let second = debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert!(matches!(second.report, Some(TrapEvent::BreakpointHit { hit_count: 2, .. })));
    assert_ne!(first.thread, second.thread);

    debugger.resume().unwrap();
    assert!(sim.wait_idle(TIMEOUT));
    debugger.detach().unwrap();

    // Two breakpoint traps and two step-over traps.
    let replies = sim.replies();
    assert_eq!(replies.len(), 4);
    let tokens: HashSet<_> = replies.iter().map(|(token, _)| *token).collect();
    assert_eq!(tokens.len(), replies.len());
    assert!(replies.iter().all(|(_, success)| *success));
}

#[test]
fn test_detach_answers_traps_still_queued_behind_a_stop()
{
    let ports = [MAIN, WORKER, ThreadPort(0x30b), ThreadPort(0x40f)];
    let sim = Arc::new(target().with_thread(ports[2], TEXT).with_thread(ports[3], TEXT));
    let debugger = attached(&sim);
    let address = Address::new(TEXT + 0x2000);
    debugger.set_breakpoint(address, false, ThreadScope::All).unwrap();
    #[allow(clippy::cast_possible_wrap)]
    let codes = [EXC_ARM_BREAKPOINT, address.value() as i64];

    let seq = debugger.resume().unwrap();
    let mut raised = HashSet::new();
    for port in ports {
        sim.set_pc(port, address.value()).unwrap();
        raised.insert(sim.inject_trap(port, ExceptionType::Breakpoint, &codes).unwrap());
    }
    let stop = debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert!(matches!(stop.report, Some(TrapEvent::BreakpointHit { hit_count: 1, .. })));
    // The listener holds the first trap; the rest never left the port.
    assert_eq!(debugger.pending_traps(), 1);

    debugger.detach().unwrap();

    let replies = sim.replies();
    let answered: HashSet<_> = replies.iter().map(|(token, _)| *token).collect();
    assert_eq!(replies.len(), ports.len());
    assert_eq!(answered, raised);
    assert!(replies.iter().all(|(_, success)| *success));
    assert!(sim.wait_idle(TIMEOUT));
    for port in ports {
        assert_eq!(sim.thread_debug_state(port).unwrap().bcr[0] & 1, 0);
        assert_eq!(sim.thread_suspend_count(port), Some(0));
    }
}

#[test]
fn test_detach_while_stopped_answers_pending_trap()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    let events = debugger.subscribe();
    let address = Address::new(TEXT + 0x1000);
    debugger.set_breakpoint(address, false, ThreadScope::All).unwrap();
    debugger
        .set_watchpoint(Address::new(DATA), 4, WatchAccess::Write, ThreadScope::Thread(ThreadId(2)))
        .unwrap();

    let seq = debugger.resume().unwrap();
    assert!(sim.run_to(MAIN, address.value()));
    debugger.wait_for_stop(seq, Some(TIMEOUT)).unwrap().unwrap();
    assert_eq!(debugger.pending_traps(), 1);

    debugger.detach().unwrap();
    assert!(!debugger.is_attached());
    assert_eq!(debugger.pending_traps(), 0);
    assert_eq!(sim.replies().len(), 1);
    assert_eq!(sim.task_suspend_count(), 0);
    for port in [MAIN, WORKER] {
        let debug = sim.thread_debug_state(port).unwrap();
        assert_eq!(debug.bcr[0] & 1, 0);
        assert_eq!(debug.wcr[0] & 1, 0);
        assert!(!debug.single_step());
        assert_eq!(sim.thread_suspend_count(port), Some(0));
    }
    assert_eq!(sim.detached(), Some(true));
    assert!(sim.is_released());

    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(TIMEOUT) {
        let done = matches!(event, DebuggerEvent::Detached { .. });
        seen.push(event);
        if done {
            break;
        }
    }
    assert_eq!(seen.last(), Some(&DebuggerEvent::Detached { target_died: false }));
}

#[test]
fn test_target_death_ends_session()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    let events = debugger.subscribe();
    let seq = debugger.resume().unwrap();

    sim.kill();
    assert_eq!(next_event(&events), DebuggerEvent::Detached { target_died: true });
    assert!(!debugger.is_attached());
    assert!(sim.is_released());
    assert_eq!(sim.detached(), Some(false));
    assert!(debugger.wait_for_stop(seq, Some(TIMEOUT)).is_err());
    assert!(matches!(debugger.detach(), Err(ArmtrapError::NotAttached)));
}

#[test]
fn test_interrupt_wakes_blocked_continue()
{
    let sim = Arc::new(target());
    let debugger = Arc::new(attached(&sim));

    let waiter = {
        let debugger = Arc::clone(&debugger);
        thread::spawn(move || debugger.continue_execution())
    };
    assert!(sim.wait_idle(TIMEOUT));
    debugger.interrupt().unwrap();

    let stop = waiter.join().unwrap().unwrap();
    assert_eq!(stop.report, Some(TrapEvent::Interrupted));
    assert_eq!(sim.task_suspend_count(), 1);

    // Already stopped: nothing to do.
    debugger.interrupt().unwrap();
    assert_eq!(sim.task_suspend_count(), 1);
    debugger.detach().unwrap();
}

#[test]
fn test_reattach_after_detach()
{
    let sim = Arc::new(target());
    let debugger = attached(&sim);
    debugger.detach().unwrap();

    debugger.attach(ProcessId(PID)).unwrap();
    assert!(sim.trap_handler_registered());
    assert_eq!(sim.read_memory(Address::new(TEXT), 4).unwrap(), vec![0x1f; 4]);
    debugger.detach().unwrap();
}
