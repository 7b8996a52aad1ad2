//! # Watchpoint Management
//!
//! Data watchpoints on DBGWVR/DBGWCR pairs. Each watchpoint owns one
//! register pair exclusively and there is no software fallback: once the
//! pairs run out, [`WatchpointManager::set`] fails with `ResourceExhausted`.
//!
//! ## Hit sequence
//!
//! A watchpoint traps *before* the access retires, so the value cannot be
//! inspected at trap time. The dispatcher disarms the watchpoint on the
//! faulting thread, single-steps the access and then calls
//! [`WatchpointManager::complete_hit`], which re-reads memory, diffs it
//! against the stored snapshot and re-arms.

use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::controller::ProcessController;
use crate::debug_state::{watchpoint_registers, WatchAccess, MAX_DEBUG_REGISTERS};
use crate::error::{ArmtrapError, ArmtrapResult, ObjectKind};
use crate::threads::{ThreadRegistry, ThreadScope};
use crate::types::{Address, ThreadId};

/// Watchpoint identifier, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchpointId(pub u32);

impl fmt::Display for WatchpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Snapshot bytes, at most 8.
pub type ValueBytes = SmallVec<[u8; 8]>;

/// Before/after values of a watched location, sign-extended from its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueChange
{
    /// Width in bytes
    pub size: u8,
    /// Value before the access
    pub old: i64,
    /// Value after the access
    pub new: i64,
}

impl ValueChange
{
    fn between(old: &[u8], new: &[u8]) -> Self
    {
        #[allow(clippy::cast_possible_truncation)]
        let size = new.len() as u8;
        Self {
            size,
            old: signed_le(old),
            new: signed_le(new),
        }
    }
}

impl fmt::Display for ValueChange
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "old value = {}, new value = {}", self.old, self.new)
    }
}

/// Little-endian signed integer of 1, 2, 4 or 8 bytes.
fn signed_le(bytes: &[u8]) -> i64
{
    match *bytes {
        [a] => i64::from(i8::from_le_bytes([a])),
        [a, b] => i64::from(i16::from_le_bytes([a, b])),
        [a, b, c, d] => i64::from(i32::from_le_bytes([a, b, c, d])),
        [a, b, c, d, e, f, g, h] => i64::from_le_bytes([a, b, c, d, e, f, g, h]),
        _ => 0,
    }
}

/// One data watchpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint
{
    /// Identifier
    pub id: WatchpointId,
    /// First watched byte
    pub address: Address,
    /// Watched bytes: 1, 2, 4 or 8
    pub size: u8,
    /// Accesses that trap
    pub access: WatchAccess,
    /// Index into DBGWVR/DBGWCR
    pub register: usize,
    /// Last observed contents
    pub value: ValueBytes,
    /// Completed hits
    pub hit_count: u64,
    /// Threads that trap
    pub scope: ThreadScope,
    value_register: u64,
    control_register: u64,
}

impl Watchpoint
{
    /// Whether `address` lies in the watched range.
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.address && address.value() < self.address.value() + u64::from(self.size)
    }
}

impl fmt::Display for Watchpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "watchpoint {} at {} ({} bytes, {}), hit {} time(s)",
            self.id, self.address, self.size, self.access, self.hit_count
        )
    }
}

/// Owns every watchpoint of a session.
#[derive(Debug)]
pub struct WatchpointManager
{
    watchpoints: BTreeMap<WatchpointId, Watchpoint>,
    next_id: u32,
    hw_count: usize,
}

impl WatchpointManager
{
    /// Manager for a core with `hw_count` watchpoint register pairs.
    pub fn new(hw_count: usize) -> Self
    {
        Self {
            watchpoints: BTreeMap::new(),
            next_id: 1,
            hw_count: hw_count.min(MAX_DEBUG_REGISTERS),
        }
    }

    /// Watch `size` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: bad size, or the range crosses an 8-byte block
    /// - `InvalidAddress`: the initial value cannot be read
    /// - `ResourceExhausted`: every watchpoint register is taken
    /// - `NotFound`: `scope` names an unknown thread
    pub fn set(
        &mut self,
        ctl: &dyn ProcessController,
        threads: &mut ThreadRegistry,
        address: Address,
        size: u8,
        access: WatchAccess,
        scope: ThreadScope,
    ) -> ArmtrapResult<WatchpointId>
    {
        let (value_register, control_register) = watchpoint_registers(address, size, access)?;
        let value = ctl
            .read_memory(address, usize::from(size))
            .map_err(|err| ArmtrapError::invalid_address(address.value(), err.to_string()))?;
        let targets = threads.scoped(scope)?;
        let register = self.free_register().ok_or_else(|| {
            ArmtrapError::ResourceExhausted(format!("all {} hardware watchpoint registers are in use", self.hw_count))
        })?;

        for (done, thread) in targets.iter().enumerate() {
            let result = threads.modify_debug_state(ctl, *thread, |state| {
                state.set_watchpoint(register, value_register, control_register);
            });
            if let Err(err) = result {
                for undo in &targets[..done] {
                    if let Err(undo_err) = threads.modify_debug_state(ctl, *undo, |state| state.clear_watchpoint(register)) {
                        warn!(thread = %undo, register, "rolling back watchpoint register: {undo_err}");
                    }
                }
                return Err(err);
            }
        }

        let id = WatchpointId(self.next_id);
        self.next_id += 1;
        info!(%id, %address, size, %access, register, "watchpoint set");
        self.watchpoints.insert(
            id,
            Watchpoint {
                id,
                address,
                size,
                access,
                register,
                value: ValueBytes::from_vec(value),
                hit_count: 0,
                scope,
                value_register,
                control_register,
            },
        );
        Ok(id)
    }

    /// Clear a watchpoint's registers and forget it.
    pub fn delete(&mut self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, id: WatchpointId) -> ArmtrapResult<()>
    {
        let wp = self.get(id)?;
        let register = wp.register;
        for thread in threads.scoped(wp.scope).unwrap_or_default() {
            threads.modify_debug_state(ctl, thread, |state| state.clear_watchpoint(register))?;
        }
        self.watchpoints.remove(&id);
        info!(%id, "watchpoint deleted");
        Ok(())
    }

    /// Delete every watchpoint, continuing past failures.
    pub fn delete_all(&mut self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry) -> ArmtrapResult<()>
    {
        let ids: Vec<WatchpointId> = self.watchpoints.keys().copied().collect();
        let mut result = Ok(());
        for id in ids {
            if let Err(err) = self.delete(ctl, threads, id) {
                warn!(%id, "could not clear watchpoint: {err}");
                self.watchpoints.remove(&id);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Look up a watchpoint.
    pub fn get(&self, id: WatchpointId) -> ArmtrapResult<&Watchpoint>
    {
        self.watchpoints
            .get(&id)
            .ok_or_else(|| ArmtrapError::not_found(ObjectKind::Watchpoint, id))
    }

    /// All watchpoints in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Watchpoint>
    {
        self.watchpoints.values()
    }

    /// Number of watchpoints.
    pub fn len(&self) -> usize
    {
        self.watchpoints.len()
    }

    /// Whether there are no watchpoints.
    pub fn is_empty(&self) -> bool
    {
        self.watchpoints.is_empty()
    }

    /// Watchpoint that a fault at `address` belongs to.
    ///
    /// Prefers an exact range match; otherwise accepts any watchpoint in the
    /// same 8-byte block, since the reported address is that of the access
    /// and may start before the watched bytes.
    pub fn find_covering(&self, address: Address) -> Option<WatchpointId>
    {
        self.watchpoints
            .values()
            .find(|wp| wp.contains(address))
            .or_else(|| self.watchpoints.values().find(|wp| wp.value_register == address.align_down(8).value()))
            .map(|wp| wp.id)
    }

    /// Clear the control register on `thread` so the pending access can retire.
    pub fn disarm_on(&self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, id: WatchpointId, thread: ThreadId) -> ArmtrapResult<()>
    {
        let register = self.get(id)?.register;
        threads.modify_debug_state(ctl, thread, |state| state.clear_watchpoint(register))
    }

    /// Re-program a watchpoint on `thread` after [`WatchpointManager::disarm_on`].
    pub fn rearm_on(&self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, id: WatchpointId, thread: ThreadId) -> ArmtrapResult<()>
    {
        let wp = self.get(id)?;
        let (register, value, control) = (wp.register, wp.value_register, wp.control_register);
        threads.modify_debug_state(ctl, thread, |state| state.set_watchpoint(register, value, control))
    }

    /// Finish a hit: read the live value, diff it against the snapshot and
    /// store it as the new snapshot.
    pub fn complete_hit(&mut self, ctl: &dyn ProcessController, id: WatchpointId) -> ArmtrapResult<ValueChange>
    {
        let wp = self
            .watchpoints
            .get_mut(&id)
            .ok_or_else(|| ArmtrapError::not_found(ObjectKind::Watchpoint, id))?;
        let live = ctl.read_memory(wp.address, usize::from(wp.size))?;
        let change = ValueChange::between(&wp.value, &live);
        wp.value = ValueBytes::from_vec(live);
        wp.hit_count += 1;
        debug!(%id, %change, "watchpoint hit completed");
        Ok(change)
    }

    /// Program every all-threads watchpoint onto a newly seen `thread`.
    pub fn program_thread(&self, ctl: &dyn ProcessController, threads: &mut ThreadRegistry, thread: ThreadId) -> ArmtrapResult<()>
    {
        for wp in self.watchpoints.values().filter(|wp| wp.scope == ThreadScope::All) {
            let (register, value, control) = (wp.register, wp.value_register, wp.control_register);
            threads.modify_debug_state(ctl, thread, |state| state.set_watchpoint(register, value, control))?;
        }
        Ok(())
    }

    fn free_register(&self) -> Option<usize>
    {
        let occupied = self
            .watchpoints
            .values()
            .fold(0u32, |bitmap, wp| bitmap | (1 << wp.register));
        (0..self.hw_count).find(|register| occupied & (1 << register) == 0)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::platform::simulated::SimulatedController;
    use crate::types::ThreadPort;

    const DATA: u64 = 0x2_0000_0000;

    fn setup(hw: usize) -> (SimulatedController, ThreadRegistry)
    {
        let sim = SimulatedController::new(1)
            .with_hardware(4, hw)
            .with_region(DATA, vec![0; 0x40])
            .with_thread(ThreadPort(0x10), 0);
        let mut threads = ThreadRegistry::new();
        threads.refresh(&sim).unwrap();
        (sim, threads)
    }

    #[test]
    fn test_signed_values_respect_size()
    {
        assert_eq!(ValueChange::between(&[0x05], &[0xff]), ValueChange { size: 1, old: 5, new: -1 });
        assert_eq!(ValueChange::between(&[0, 0x80], &[1, 0]).old, -32768);
        assert_eq!(signed_le(&9i64.to_le_bytes()), 9);
    }

    #[test]
    fn test_exhaustion_is_terminal()
    {
        let (sim, mut threads) = setup(1);
        let mut wps = WatchpointManager::new(1);

        wps.set(&sim, &mut threads, Address::new(DATA), 4, WatchAccess::Write, ThreadScope::All).unwrap();
        let err = wps
            .set(&sim, &mut threads, Address::new(DATA + 8), 4, WatchAccess::Write, ThreadScope::All)
            .unwrap_err();
        assert!(matches!(err, ArmtrapError::ResourceExhausted(_)));
        assert_eq!(wps.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_ranges_and_addresses()
    {
        let (sim, mut threads) = setup(2);
        let mut wps = WatchpointManager::new(2);

        assert!(matches!(
            wps.set(&sim, &mut threads, Address::new(DATA + 6), 4, WatchAccess::Read, ThreadScope::All),
            Err(ArmtrapError::InvalidArgument(_))
        ));
        assert!(matches!(
            wps.set(&sim, &mut threads, Address::new(0x8), 8, WatchAccess::Read, ThreadScope::All),
            Err(ArmtrapError::InvalidAddress { .. })
        ));
        assert!(wps.is_empty());
    }

    #[test]
    fn test_complete_hit_updates_snapshot()
    {
        let (sim, mut threads) = setup(2);
        let mut wps = WatchpointManager::new(2);
        sim.write_memory(Address::new(DATA + 4), &5i32.to_le_bytes()).unwrap();

        let id = wps
            .set(&sim, &mut threads, Address::new(DATA + 4), 4, WatchAccess::Write, ThreadScope::All)
            .unwrap();
        sim.write_memory(Address::new(DATA + 4), &9i32.to_le_bytes()).unwrap();

        let change = wps.complete_hit(&sim, id).unwrap();
        assert_eq!((change.old, change.new), (5, 9));
        assert_eq!(wps.get(id).unwrap().value.as_slice(), &9i32.to_le_bytes());
        assert_eq!(wps.get(id).unwrap().hit_count, 1);
    }

    #[test]
    fn test_find_covering_and_delete_clears_registers()
    {
        let (sim, mut threads) = setup(2);
        let mut wps = WatchpointManager::new(2);
        let id = wps
            .set(&sim, &mut threads, Address::new(DATA + 2), 2, WatchAccess::ReadWrite, ThreadScope::All)
            .unwrap();

        assert_eq!(wps.find_covering(Address::new(DATA + 3)), Some(id));
        assert_eq!(wps.find_covering(Address::new(DATA)), Some(id));
        assert_eq!(wps.find_covering(Address::new(DATA + 8)), None);

        wps.delete(&sim, &mut threads, id).unwrap();
        let debug = sim.thread_debug_state(ThreadPort(0x10)).unwrap();
        assert_eq!((debug.wvr[0], debug.wcr[0]), (0, 0));
    }
}
