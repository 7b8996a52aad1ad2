//! # Signal Policies
//!
//! What to do when the target receives a signal. Each signal carries three
//! independent switches:
//!
//! - **pass**: leave the signal pending so the target handles it; the trap
//!   never stops the target
//! - **stop**: keep the target stopped after the trap
//! - **notify**: report the signal to the user
//!
//! The table is owned by the command layer and read by the exception
//! dispatcher, so it is shared behind an `RwLock`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::error::{ArmtrapError, ArmtrapResult};

/// Darwin signal names, indexed by number - 1.
const SIGNAL_NAMES: [&str; 31] = [
    "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGEMT", "SIGFPE", "SIGKILL", "SIGBUS", "SIGSEGV",
    "SIGSYS", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGURG", "SIGSTOP", "SIGTSTP", "SIGCONT", "SIGCHLD", "SIGTTIN",
    "SIGTTOU", "SIGIO", "SIGXCPU", "SIGXFSZ", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGINFO", "SIGUSR1", "SIGUSR2",
];

/// Signals a program routinely receives that a user rarely wants to see.
const QUIET_SIGNALS: [&str; 8] = [
    "SIGALRM", "SIGURG", "SIGCHLD", "SIGIO", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGINFO",
];

static DEFAULT_POLICIES: Lazy<SignalPolicyTable> = Lazy::new(|| {
    let mut policies = BTreeMap::new();
    for (index, name) in SIGNAL_NAMES.iter().enumerate() {
        let policy = if QUIET_SIGNALS.contains(name) {
            SignalPolicy::QUIET
        } else {
            SignalPolicy::default()
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let signal = index as i32 + 1;
        policies.insert(signal, policy);
    }
    SignalPolicyTable { policies }
});

/// Name of `signal` (`SIGSEGV`), if it is a known Darwin signal.
pub fn signal_name(signal: i32) -> Option<&'static str>
{
    let index = usize::try_from(signal).ok()?.checked_sub(1)?;
    SIGNAL_NAMES.get(index).copied()
}

/// Parse `SIGSEGV`, `segv` or `11`.
pub fn parse_signal(text: &str) -> ArmtrapResult<i32>
{
    if let Ok(number) = text.parse::<i32>() {
        return signal_name(number)
            .map(|_| number)
            .ok_or_else(|| ArmtrapError::InvalidArgument(format!("unknown signal {number}")));
    }
    let upper = text.to_uppercase();
    let wanted = if upper.starts_with("SIG") { upper } else { format!("SIG{upper}") };
    SIGNAL_NAMES
        .iter()
        .position(|name| *name == wanted)
        .map(|index| i32::try_from(index + 1).unwrap_or_default())
        .ok_or_else(|| ArmtrapError::InvalidArgument(format!("unknown signal {text}")))
}

/// How one signal is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPolicy
{
    /// Report the signal
    pub notify: bool,
    /// Deliver the signal to the target
    pub pass: bool,
    /// Keep the target stopped
    pub stop: bool,
}

impl SignalPolicy
{
    /// Pass silently without stopping.
    pub const QUIET: Self = Self {
        notify: false,
        pass: true,
        stop: false,
    };
}

impl Default for SignalPolicy
{
    fn default() -> Self
    {
        Self {
            notify: true,
            pass: false,
            stop: true,
        }
    }
}

/// Policy per signal number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPolicyTable
{
    policies: BTreeMap<i32, SignalPolicy>,
}

impl Default for SignalPolicyTable
{
    fn default() -> Self
    {
        DEFAULT_POLICIES.clone()
    }
}

impl SignalPolicyTable
{
    /// Policy for `signal`; unknown signals get the default policy.
    pub fn get(&self, signal: i32) -> SignalPolicy
    {
        self.policies.get(&signal).copied().unwrap_or_default()
    }

    /// Replace the policy for `signal`.
    pub fn set(&mut self, signal: i32, policy: SignalPolicy) -> ArmtrapResult<()>
    {
        if signal_name(signal).is_none() {
            return Err(ArmtrapError::InvalidArgument(format!("unknown signal {signal}")));
        }
        self.policies.insert(signal, policy);
        Ok(())
    }

    /// `(signal, policy)` pairs in signal order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, SignalPolicy)> + '_
    {
        self.policies.iter().map(|(signal, policy)| (*signal, *policy))
    }
}

impl fmt::Display for SignalPolicyTable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        writeln!(f, "{:<11} {:<5} {:<5} {:<6}", "NAME", "PASS", "STOP", "NOTIFY")?;
        write!(f, "=========== ===== ===== ======")?;
        for (signal, policy) in self.iter() {
            write!(
                f,
                "\n{:<11} {:<5} {:<5} {:<6}",
                signal_name(signal).unwrap_or("?"),
                policy.pass,
                policy.stop,
                policy.notify
            )?;
        }
        Ok(())
    }
}

/// Table shared between the command layer and the listener thread.
pub type SharedSignalPolicies = Arc<RwLock<SignalPolicyTable>>;

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_defaults()
    {
        let table = SignalPolicyTable::default();
        assert_eq!(table.get(11), SignalPolicy::default());
        assert_eq!(table.get(20), SignalPolicy::QUIET);
        assert_eq!(table.iter().count(), 31);
    }

    #[test]
    fn test_parse_signal()
    {
        assert_eq!(parse_signal("SIGSEGV").unwrap(), 11);
        assert_eq!(parse_signal("usr1").unwrap(), 30);
        assert_eq!(parse_signal("2").unwrap(), 2);
        assert!(parse_signal("64").is_err());
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn test_set_rejects_unknown_signal()
    {
        let mut table = SignalPolicyTable::default();
        assert!(table.set(0, SignalPolicy::QUIET).is_err());
        table.set(2, SignalPolicy::QUIET).unwrap();
        assert_eq!(table.get(2), SignalPolicy::QUIET);
    }

    #[test]
    fn test_display_lists_every_signal()
    {
        let rendered = SignalPolicyTable::default().to_string();
        assert!(rendered.starts_with("NAME"));
        assert!(rendered.contains("SIGCHLD     true  false false"));
    }
}
