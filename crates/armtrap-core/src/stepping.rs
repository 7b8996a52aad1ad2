//! # Single-Step Coordinator
//!
//! Arms and disarms `MDSCR_EL1.SS` on a thread. With SS set, the thread
//! retires exactly one instruction after its next resume and then raises
//! `EXC_BREAKPOINT` / `EXC_ARM_BREAKPOINT` with a zero subcode.
//!
//! Both operations are idempotent: the debug state is only written when the
//! bit actually changes.

use tracing::trace;

use crate::controller::ProcessController;
use crate::error::ArmtrapResult;
use crate::threads::ThreadRegistry;
use crate::types::ThreadId;

/// Stateless helper over the thread registry.
pub struct SingleStepCoordinator;

impl SingleStepCoordinator
{
    /// Set SS on `thread`.
    pub fn arm(ctl: &dyn ProcessController, threads: &mut ThreadRegistry, thread: ThreadId) -> ArmtrapResult<()>
    {
        Self::set(ctl, threads, thread, true)
    }

    /// Clear SS on `thread`.
    pub fn disarm(ctl: &dyn ProcessController, threads: &mut ThreadRegistry, thread: ThreadId) -> ArmtrapResult<()>
    {
        Self::set(ctl, threads, thread, false)
    }

    /// Clear SS on every thread, continuing past failures.
    ///
    /// Returns the first error encountered.
    pub fn disarm_all(ctl: &dyn ProcessController, threads: &mut ThreadRegistry) -> ArmtrapResult<()>
    {
        let ids: Vec<ThreadId> = threads.iter().map(|t| t.id).collect();
        let mut result = Ok(());
        for id in ids {
            if let Err(err) = Self::disarm(ctl, threads, id) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn set(ctl: &dyn ProcessController, threads: &mut ThreadRegistry, thread: ThreadId, enabled: bool) -> ArmtrapResult<()>
    {
        let port = threads.get(thread)?.port;
        let current = ctl.debug_state(port)?;
        if current.single_step() == enabled {
            threads.get_mut(thread)?.debug = current;
            return Ok(());
        }
        trace!(%thread, enabled, "single-step");
        threads.modify_debug_state(ctl, thread, |state| state.set_single_step(enabled))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::platform::simulated::SimulatedController;
    use crate::types::ThreadPort;

    #[test]
    fn test_arm_and_disarm_are_idempotent()
    {
        let sim = SimulatedController::new(1)
            .with_thread(ThreadPort(0x10), 0)
            .with_thread(ThreadPort(0x20), 0);
        let mut threads = ThreadRegistry::new();
        threads.refresh(&sim).unwrap();

        SingleStepCoordinator::arm(&sim, &mut threads, ThreadId(2)).unwrap();
        SingleStepCoordinator::arm(&sim, &mut threads, ThreadId(2)).unwrap();
        assert_eq!(sim.thread_debug_state(ThreadPort(0x20)).unwrap().mdscr_el1, 1);
        assert!(!sim.thread_debug_state(ThreadPort(0x10)).unwrap().single_step());

        SingleStepCoordinator::disarm_all(&sim, &mut threads).unwrap();
        SingleStepCoordinator::disarm(&sim, &mut threads, ThreadId(2)).unwrap();
        assert!(!sim.thread_debug_state(ThreadPort(0x20)).unwrap().single_step());
    }
}
