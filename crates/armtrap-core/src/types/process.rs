//! Process and thread identifiers.

use std::fmt;

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use armtrap_core::types::ProcessId;
///
/// let pid = ProcessId::from(100);
/// assert_eq!(u32::from(pid), 100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Registry-assigned thread number
///
/// Stable for the lifetime of the thread inside one session and never
/// reused: the first thread seen is `1`, the next new one `2`, and so on.
/// This is the number users type in `thread select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId
{
    /// Raw numeric id.
    pub fn raw(self) -> u32
    {
        self.0
    }
}

impl From<u32> for ThreadId
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// OS handle of a target thread
///
/// On macOS this is the `thread_act_t` send right returned by
/// `task_threads()`. Ports are only meaningful to the controller that
/// produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPort(pub u32);

impl From<u32> for ThreadPort
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadPort
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:#x}", self.0)
    }
}
