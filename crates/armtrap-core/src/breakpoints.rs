//! # Breakpoint Management
//!
//! Execution breakpoints backed by hardware debug registers, with code
//! patching as the fallback once every register pair is taken.
//!
//! ## Breakpoint Types
//!
//! - **Hardware**: one DBGBVR/DBGBCR pair, programmed on every thread in the
//!   breakpoint's scope. Memory is never touched.
//! - **Software**: the instruction at the address is replaced by `BRK #0`.
//!   The replaced bytes are kept so they can be put back.
//!
//! ## Shared original bytes
//!
//! Several software breakpoints may sit on one address. Only the first one
//! reads the true instruction from memory; later ones copy its saved bytes,
//! because by then memory already holds the trap opcode. The instruction is
//! restored only when the last enabled software breakpoint at the address
//! is disabled.
//!
//! ## Identifiers
//!
//! User breakpoints are numbered from 1 and numbers are never reused.
//! Temporary breakpoints draw from a separate internal sequence so they
//! never consume a user-visible number.

use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::controller::ProcessController;
use crate::debug_state::MAX_DEBUG_REGISTERS;
use crate::error::{ArmtrapError, ArmtrapResult, ObjectKind};
use crate::threads::{ThreadRegistry, ThreadScope};
use crate::types::{Address, ThreadId};

/// `BRK #0`
pub const TRAP_OPCODE: [u8; 4] = [0x00, 0x00, 0x20, 0xd4];

/// A64 instruction width.
pub const INSTRUCTION_SIZE: usize = 4;

/// Breakpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BreakpointId
{
    /// Numbered for the user
    User(u32),
    /// Temporary breakpoint, invisible numbering
    Internal(u32),
}

impl BreakpointId
{
    /// Whether the id belongs to a user-visible breakpoint.
    pub const fn is_user(self) -> bool
    {
        matches!(self, Self::User(_))
    }
}

impl fmt::Display for BreakpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::User(n) => write!(f, "{n}"),
            Self::Internal(n) => write!(f, "internal.{n}"),
        }
    }
}

/// How a breakpoint traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind
{
    /// Debug register pair `register`
    Hardware
    {
        /// Index into DBGBVR/DBGBCR
        register: usize,
    },
    /// Patched `BRK`
    Software
    {
        /// The instruction the trap opcode replaced
        original: [u8; INSTRUCTION_SIZE],
    },
}

/// One execution breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint
{
    /// Identifier
    pub id: BreakpointId,
    /// Post-ASLR address
    pub address: Address,
    /// Trap mechanism
    pub kind: BreakpointKind,
    /// Times a thread in scope trapped here
    pub hit_count: u64,
    /// Whether the trap is currently removed
    pub disabled: bool,
    /// Deleted after the first hit
    pub temporary: bool,
    /// Threads that should stop here
    pub scope: ThreadScope,
}

impl Breakpoint
{
    /// Hardware register index, if any.
    pub const fn register(&self) -> Option<usize>
    {
        match self.kind {
            BreakpointKind::Hardware { register } => Some(register),
            BreakpointKind::Software { .. } => None,
        }
    }

    /// Whether the breakpoint patches code.
    pub const fn is_software(&self) -> bool
    {
        matches!(self.kind, BreakpointKind::Software { .. })
    }
}

impl fmt::Display for Breakpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let kind = match self.kind {
            BreakpointKind::Hardware { register } => format!("hardware #{register}"),
            BreakpointKind::Software { .. } => "software".to_string(),
        };
        write!(f, "breakpoint {} at {} ({kind}), hit {} time(s)", self.id, self.address, self.hit_count)?;
        if self.disabled {
            f.write_str(", disabled")?;
        }
        if self.temporary {
            f.write_str(", temporary")?;
        }
        if let ThreadScope::Thread(thread) = self.scope {
            write!(f, ", thread {thread} only")?;
        }
        Ok(())
    }
}

/// Owns every breakpoint of a session.
#[derive(Debug)]
pub struct BreakpointManager
{
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    next_user_id: u32,
    next_internal_id: u32,
    hw_count: usize,
}

impl BreakpointManager
{
    /// Manager for a core with `hw_count` breakpoint register pairs.
    pub fn new(hw_count: usize) -> Self
    {
        Self {
            breakpoints: BTreeMap::new(),
            next_user_id: 1,
            next_internal_id: 1,
            hw_count: hw_count.min(MAX_DEBUG_REGISTERS),
        }
    }

    /// Set a breakpoint at `address`.
    ///
    /// Takes the lowest free hardware register; once all are taken, patches
    /// the instruction instead.
    ///
    /// ## Errors
    ///
    /// - `InvalidAddress`: the four bytes at `address` cannot be read
    /// - `NotFound`: `scope` names an unknown thread
    /// - any error from programming debug registers or writing memory
    pub fn set(
        &mut self,
        ctl: &dyn ProcessController,
        threads: &mut ThreadRegistry,
        address: Address,
        temporary: bool,
        scope: ThreadScope,
    ) -> ArmtrapResult<BreakpointId>
    {
        let current = ctl
            .read_memory(address, INSTRUCTION_SIZE)
            .map_err(|err| ArmtrapError::invalid_address(address.value(), err.to_string()))?;
        let targets = threads.scoped(scope)?;

        let kind = if let Some(register) = self.free_register() {
            program_hardware(ctl, threads, &targets, register, Some(address))?;
            BreakpointKind::Hardware { register }
        } else {
            let original = match self.saved_bytes_at(address) {
                Some(saved) => saved,
                None => current
                    .as_slice()
                    .try_into()
                    .map_err(|_| ArmtrapError::invalid_address(address.value(), "short read"))?,
            };
            ctl.write_memory(address, &TRAP_OPCODE)?;
            BreakpointKind::Software { original }
        };

        let id = if temporary {
            self.next_internal_id += 1;
            BreakpointId::Internal(self.next_internal_id - 1)
        } else {
            self.next_user_id += 1;
            BreakpointId::User(self.next_user_id - 1)
        };

        info!(%id, %address, ?kind, "breakpoint set");
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                address,
                kind,
                hit_count: 0,
                disabled: false,
                temporary,
                scope,
            },
        );
        Ok(id)
    }

    /// Re-install the trap of a disabled breakpoint. No-op if enabled.
    pub fn enable(&mut self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, id: BreakpointId) -> ArmtrapResult<()>
    {
        let bp = self.get(id)?.clone();
        if !bp.disabled {
            return Ok(());
        }
        match bp.kind {
            BreakpointKind::Hardware { register } => {
                program_hardware(ctl, threads, &scope_targets(threads, bp.scope), register, Some(bp.address))?;
            }
            BreakpointKind::Software { .. } => ctl.write_memory(bp.address, &TRAP_OPCODE)?,
        }
        self.entry_mut(id)?.disabled = false;
        debug!(%id, "breakpoint enabled");
        Ok(())
    }

    /// Remove the trap of a breakpoint but keep it. No-op if disabled.
    pub fn disable(&mut self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, id: BreakpointId) -> ArmtrapResult<()>
    {
        let bp = self.get(id)?.clone();
        if bp.disabled {
            return Ok(());
        }
        match bp.kind {
            BreakpointKind::Hardware { register } => {
                program_hardware(ctl, threads, &scope_targets(threads, bp.scope), register, None)?;
            }
            BreakpointKind::Software { original } => {
                let shared = self
                    .breakpoints
                    .values()
                    .any(|other| other.id != id && other.address == bp.address && other.is_software() && !other.disabled);
                if !shared {
                    ctl.write_memory(bp.address, &original)?;
                }
            }
        }
        self.entry_mut(id)?.disabled = true;
        debug!(%id, "breakpoint disabled");
        Ok(())
    }

    /// Disable and forget a breakpoint.
    pub fn delete(&mut self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, id: BreakpointId) -> ArmtrapResult<()>
    {
        self.disable(ctl, threads, id)?;
        self.breakpoints.remove(&id);
        info!(%id, "breakpoint deleted");
        Ok(())
    }

    /// Delete every breakpoint.
    ///
    /// Keeps going after a failure so no trap is left behind that could be
    /// removed; every breakpoint is forgotten and the first error returned.
    pub fn delete_all(&mut self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry) -> ArmtrapResult<()>
    {
        let ids: Vec<BreakpointId> = self.breakpoints.keys().copied().collect();
        let mut result = Ok(());
        for id in ids {
            if let Err(err) = self.disable(ctl, threads, id) {
                warn!(%id, "could not restore breakpoint: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
            self.breakpoints.remove(&id);
        }
        result
    }

    /// Look up a breakpoint.
    pub fn get(&self, id: BreakpointId) -> ArmtrapResult<&Breakpoint>
    {
        self.breakpoints
            .get(&id)
            .ok_or_else(|| ArmtrapError::not_found(ObjectKind::Breakpoint, id))
    }

    fn entry_mut(&mut self, id: BreakpointId) -> ArmtrapResult<&mut Breakpoint>
    {
        self.breakpoints
            .get_mut(&id)
            .ok_or_else(|| ArmtrapError::not_found(ObjectKind::Breakpoint, id))
    }

    /// All breakpoints in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint>
    {
        self.breakpoints.values()
    }

    /// Number of breakpoints, including disabled and temporary ones.
    pub fn len(&self) -> usize
    {
        self.breakpoints.len()
    }

    /// Whether there are no breakpoints.
    pub fn is_empty(&self) -> bool
    {
        self.breakpoints.is_empty()
    }

    /// Hardware registers currently owned, enabled or not.
    pub fn hardware_in_use(&self) -> usize
    {
        self.breakpoints.values().filter(|bp| bp.register().is_some()).count()
    }

    /// Enabled breakpoints at `address`, in id order.
    pub fn enabled_at(&self, address: Address) -> SmallVec<[BreakpointId; 2]>
    {
        self.breakpoints
            .values()
            .filter(|bp| bp.address == address && !bp.disabled)
            .map(|bp| bp.id)
            .collect()
    }

    /// Count a hit and return the new total.
    pub fn record_hit(&mut self, id: BreakpointId) -> ArmtrapResult<u64>
    {
        let bp = self.entry_mut(id)?;
        bp.hit_count += 1;
        Ok(bp.hit_count)
    }

    /// Program every enabled all-threads hardware breakpoint onto `thread`.
    ///
    /// Called for threads that appear after the breakpoints were set.
    pub fn program_thread(&self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, thread: ThreadId) -> ArmtrapResult<()>
    {
        for bp in self.breakpoints.values() {
            if let (Some(register), false, ThreadScope::All) = (bp.register(), bp.disabled, bp.scope) {
                program_hardware(ctl, threads, &[thread], register, Some(bp.address))?;
            }
        }
        Ok(())
    }

    /// Lowest hardware register no breakpoint owns.
    fn free_register(&self) -> Option<usize>
    {
        let occupied = self
            .breakpoints
            .values()
            .filter_map(Breakpoint::register)
            .fold(0u32, |bitmap, register| bitmap | (1 << register));
        (0..self.hw_count).find(|register| occupied & (1 << register) == 0)
    }

    /// Saved instruction of an existing software breakpoint at `address`.
    fn saved_bytes_at(&self, address: Address) -> Option<[u8; INSTRUCTION_SIZE]>
    {
        self.breakpoints.values().find_map(|bp| match bp.kind {
            BreakpointKind::Software { original } if bp.address == address => Some(original),
            _ => None,
        })
    }
}

/// Threads a scope currently resolves to, skipping a thread that exited.
fn scope_targets(threads: &ThreadRegistry, scope: ThreadScope) -> Vec<ThreadId>
{
    threads.scoped(scope).unwrap_or_default()
}

/// Write (`Some`) or clear (`None`) breakpoint pair `register` on `targets`.
///
/// A failure part way undoes the threads already written.
fn program_hardware(
    ctl: &dyn ProcessController,
    threads: &mut ThreadRegistry,
    targets: &[ThreadId],
    register: usize,
    address: Option<Address>,
) -> ArmtrapResult<()>
{
    for (done, thread) in targets.iter().enumerate() {
        let result = threads.modify_debug_state(ctl, *thread, |state| match address {
            Some(address) => state.set_breakpoint(register, address),
            None => state.clear_breakpoint(register),
        });
        if let Err(err) = result {
            if address.is_some() {
                for undo in &targets[..done] {
                    if let Err(undo_err) = threads.modify_debug_state(ctl, *undo, |state| state.clear_breakpoint(register)) {
                        warn!(thread = %undo, register, "rolling back breakpoint register: {undo_err}");
                    }
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::debug_state::BREAKPOINT_CONTROL;
    use crate::platform::simulated::SimulatedController;
    use crate::types::ThreadPort;

    const BASE: u64 = 0x1_0000_0000;

    fn setup(hw: usize) -> (SimulatedController, ThreadRegistry)
    {
        let code: Vec<u8> = (0..0x100u32).map(|i| (i & 0xff) as u8).collect();
        let sim = SimulatedController::new(1)
            .with_hardware(hw, 2)
            .with_region(BASE, code)
            .with_thread(ThreadPort(0x10), BASE)
            .with_thread(ThreadPort(0x20), BASE);
        let mut threads = ThreadRegistry::new();
        threads.refresh(&sim).unwrap();
        (sim, threads)
    }

    #[test]
    fn test_hardware_registers_then_software_fallback()
    {
        let (sim, mut threads) = setup(2);
        let mut bps = BreakpointManager::new(2);

        let a = bps.set(&sim, &mut threads, Address::new(BASE), false, ThreadScope::All).unwrap();
        let b = bps.set(&sim, &mut threads, Address::new(BASE + 8), false, ThreadScope::All).unwrap();
        let c = bps.set(&sim, &mut threads, Address::new(BASE + 16), false, ThreadScope::All).unwrap();

        assert_eq!(bps.get(a).unwrap().register(), Some(0));
        assert_eq!(bps.get(b).unwrap().register(), Some(1));
        assert!(bps.get(c).unwrap().is_software());
        assert_eq!(bps.hardware_in_use(), 2);
        assert_eq!(sim.peek(BASE + 16, 4).unwrap(), TRAP_OPCODE.to_vec());

        let debug = sim.thread_debug_state(ThreadPort(0x20)).unwrap();
        assert_eq!(debug.bcr[1], BREAKPOINT_CONTROL);
        assert_eq!(debug.bvr[1], BASE + 8);

        bps.delete(&sim, &mut threads, c).unwrap();
        assert_eq!(sim.peek(BASE + 16, 4).unwrap(), vec![16, 17, 18, 19]);
    }

    #[test]
    fn test_lowest_free_register_is_reused()
    {
        let (sim, mut threads) = setup(3);
        let mut bps = BreakpointManager::new(3);

        let first = bps.set(&sim, &mut threads, Address::new(BASE), false, ThreadScope::All).unwrap();
        let second = bps.set(&sim, &mut threads, Address::new(BASE + 4), false, ThreadScope::All).unwrap();
        bps.delete(&sim, &mut threads, first).unwrap();
        let third = bps.set(&sim, &mut threads, Address::new(BASE + 8), false, ThreadScope::All).unwrap();

        assert_eq!(bps.get(second).unwrap().register(), Some(1));
        assert_eq!(bps.get(third).unwrap().register(), Some(0));
        assert_eq!(third, BreakpointId::User(3));
    }

    #[test]
    fn test_register_allocation_under_churn()
    {
        const HW: usize = 4;
        let (sim, mut threads) = setup(HW);
        let mut bps = BreakpointManager::new(HW);
        let mut live: Vec<BreakpointId> = Vec::new();
        // xorshift64 with a fixed seed keeps failures reproducible.
        let mut seed = 0x9e37_79b9_7f4a_7c15u64;
        let mut next = |bound: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            usize::try_from(seed % bound as u64).unwrap()
        };

        for _ in 0..500 {
            match next(4) {
                0 | 1 => {
                    let occupied: Vec<usize> = live.iter().filter_map(|id| bps.get(*id).unwrap().register()).collect();
                    let lowest_free = (0..HW).find(|register| !occupied.contains(register));
                    let address = Address::new(BASE + 4 * next(0x40) as u64);
                    let id = bps.set(&sim, &mut threads, address, false, ThreadScope::All).unwrap();
                    assert_eq!(bps.get(id).unwrap().register(), lowest_free);
                    live.push(id);
                }
                2 if !live.is_empty() => {
                    let id = live.swap_remove(next(live.len()));
                    bps.delete(&sim, &mut threads, id).unwrap();
                }
                _ if !live.is_empty() => {
                    let id = live[next(live.len())];
                    if bps.get(id).unwrap().disabled {
                        bps.enable(&sim, &mut threads, id).unwrap();
                    } else {
                        bps.disable(&sim, &mut threads, id).unwrap();
                    }
                }
                _ => {}
            }

            assert!(bps.hardware_in_use() <= HW);
            let armed = live
                .iter()
                .filter(|id| {
                    let bp = bps.get(**id).unwrap();
                    bp.register().is_some() && !bp.disabled
                })
                .count();
            for port in [ThreadPort(0x10), ThreadPort(0x20)] {
                let debug = sim.thread_debug_state(port).unwrap();
                assert_eq!(debug.bcr.iter().filter(|bcr| **bcr & 1 == 1).count(), armed);
                assert!(debug.bcr[HW..].iter().all(|bcr| *bcr == 0));
            }
        }

        bps.delete_all(&sim, &mut threads).unwrap();
        let code: Vec<u8> = (0..0x100u32).map(|i| (i & 0xff) as u8).collect();
        assert_eq!(sim.peek(BASE, 0x100).unwrap(), code);
    }

    #[test]
    fn test_disabled_hardware_breakpoint_keeps_its_register()
    {
        let (sim, mut threads) = setup(1);
        let mut bps = BreakpointManager::new(1);

        let hw = bps.set(&sim, &mut threads, Address::new(BASE), false, ThreadScope::All).unwrap();
        bps.disable(&sim, &mut threads, hw).unwrap();
        assert_eq!(sim.thread_debug_state(ThreadPort(0x10)).unwrap().bcr[0], 0);

        let next = bps.set(&sim, &mut threads, Address::new(BASE + 4), false, ThreadScope::All).unwrap();
        assert!(bps.get(next).unwrap().is_software());
    }

    #[test]
    fn test_disable_is_idempotent_and_enable_restores_mechanism()
    {
        let (sim, mut threads) = setup(1);
        let mut bps = BreakpointManager::new(1);

        let hw = bps.set(&sim, &mut threads, Address::new(BASE + 4), false, ThreadScope::All).unwrap();
        let sw = bps.set(&sim, &mut threads, Address::new(BASE + 12), false, ThreadScope::All).unwrap();
        let armed_hw = sim.thread_debug_state(ThreadPort(0x10)).unwrap();

        for _ in 0..2 {
            bps.disable(&sim, &mut threads, hw).unwrap();
            bps.disable(&sim, &mut threads, sw).unwrap();
        }
        assert_eq!(sim.peek(BASE + 12, 4).unwrap(), vec![12, 13, 14, 15]);

        bps.enable(&sim, &mut threads, hw).unwrap();
        bps.enable(&sim, &mut threads, sw).unwrap();
        assert_eq!(sim.thread_debug_state(ThreadPort(0x10)).unwrap(), armed_hw);
        assert_eq!(sim.peek(BASE + 12, 4).unwrap(), TRAP_OPCODE.to_vec());
    }

    #[test]
    fn test_duplicate_software_breakpoints_share_original_bytes()
    {
        let (sim, mut threads) = setup(0);
        let mut bps = BreakpointManager::new(0);

        let first = bps.set(&sim, &mut threads, Address::new(BASE + 0x20), false, ThreadScope::All).unwrap();
        let second = bps.set(&sim, &mut threads, Address::new(BASE + 0x20), false, ThreadScope::All).unwrap();
        assert_eq!(bps.get(first).unwrap().kind, bps.get(second).unwrap().kind);

        bps.delete(&sim, &mut threads, first).unwrap();
        assert_eq!(sim.peek(BASE + 0x20, 4).unwrap(), TRAP_OPCODE.to_vec());

        bps.delete(&sim, &mut threads, second).unwrap();
        assert_eq!(sim.peek(BASE + 0x20, 4).unwrap(), vec![0x20, 0x21, 0x22, 0x23]);
    }

    #[test]
    fn test_temporary_breakpoints_do_not_consume_user_ids()
    {
        let (sim, mut threads) = setup(4);
        let mut bps = BreakpointManager::new(4);

        let temp = bps.set(&sim, &mut threads, Address::new(BASE), true, ThreadScope::All).unwrap();
        let user = bps.set(&sim, &mut threads, Address::new(BASE + 4), false, ThreadScope::All).unwrap();
        assert_eq!(temp, BreakpointId::Internal(1));
        assert_eq!(user, BreakpointId::User(1));
    }

    #[test]
    fn test_unreadable_address_and_unknown_id()
    {
        let (sim, mut threads) = setup(4);
        let mut bps = BreakpointManager::new(4);

        let err = bps.set(&sim, &mut threads, Address::new(0x10), false, ThreadScope::All).unwrap_err();
        assert!(matches!(err, ArmtrapError::InvalidAddress { address: 0x10, .. }));
        assert!(matches!(
            bps.enable(&sim, &mut threads, BreakpointId::User(42)),
            Err(ArmtrapError::NotFound { .. })
        ));
        assert!(bps.is_empty());
    }

    #[test]
    fn test_thread_scoped_hardware_breakpoint()
    {
        let (sim, mut threads) = setup(4);
        let mut bps = BreakpointManager::new(4);

        bps.set(&sim, &mut threads, Address::new(BASE), false, ThreadScope::Thread(ThreadId(2))).unwrap();
        assert_eq!(sim.thread_debug_state(ThreadPort(0x10)).unwrap().bcr[0], 0);
        assert_eq!(sim.thread_debug_state(ThreadPort(0x20)).unwrap().bcr[0], BREAKPOINT_CONTROL);
    }

    #[test]
    fn test_new_threads_receive_all_scope_breakpoints()
    {
        let (sim, mut threads) = setup(4);
        let mut bps = BreakpointManager::new(4);
        bps.set(&sim, &mut threads, Address::new(BASE + 4), false, ThreadScope::All).unwrap();

        sim.add_thread(ThreadPort(0x30), BASE);
        for id in threads.refresh(&sim).unwrap() {
            bps.program_thread(&sim, &mut threads, id).unwrap();
        }
        assert_eq!(sim.thread_debug_state(ThreadPort(0x30)).unwrap().bvr[0], BASE + 4);
    }
}
