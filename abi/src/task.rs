//! Task ABI types shared between kernel subsystems.
//!
//! This module contains **only** the types, constants, and enums that form the
//! stable interface of the task engine. Kernel-internal implementation details
//! (the task record itself, run-queue linkage, timer bindings) live in
//! `hypos_core::sched::task_struct`.

use bitflags::bitflags;

// --- Topology & identity space ---

pub const MAX_CPUS: usize = 8;

/// Size of the task identity space and the task table.
pub const MAX_TASKS: usize = 128;

/// Identity bits `[0, NR_REALTIME_PIDS)` are reserved: a real-time priority is
/// also its task id. Dense ids are handed out from `NR_REALTIME_PIDS` upward.
pub const NR_REALTIME_PIDS: usize = 64;

// --- Priorities ---

/// Highest numeric real-time priority. Anything at or below this value is a
/// real-time task with `pid == prio`.
pub const PRIO_LOWEST: u8 = 63;

/// Sentinel priority for ordinary tasks scheduled within their home CPU's
/// run queue.
pub const PRIO_PCPU: u8 = 64;

/// Sentinel priority for the per-CPU idle task.
pub const PRIO_IDLE: u8 = 65;

// --- Stacks & sizing ---

pub const TASK_STACK_SIZE: usize = 0x8000; // 32 KiB
pub const BOOT_STACK_SIZE: usize = 0x4000; // 16 KiB
pub const PAGE_SIZE: usize = 0x1000;
pub const TASK_NAME_MAX_LEN: usize = 32;

/// Default scheduling quantum, in timer ticks.
pub const TASK_RUN_TIME_TICKS: u32 = 100;

// --- Cross-CPU event pool ---

pub const NR_TASK_EVENTS: usize = 32;

// --- Affinity sentinels ---

/// "Any CPU": resolved to CPU 0 at creation time.
pub const CPU_AFF_ANY: u16 = 0xFFFF;

/// "The creating CPU": resolved once, at creation time.
pub const CPU_AFF_LOCAL: u16 = 0xFFFE;

// --- Task state ---

bitflags! {
    /// Lifecycle state of a task. The empty set means "ready".
    ///
    /// `PEND_EVENT`/`PEND_FLAG` record *what kind* of object the task is
    /// blocked on; waiters hand the matching bits to the wake path as a mask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskStat: u32 {
        const PEND_EVENT = 0x01;
        const SUSPEND = 0x08;
        const PEND_FLAG = 0x20;
        const RUNNING = 0x100;

        const PEND_ANY = Self::PEND_EVENT.bits() | Self::PEND_FLAG.bits();
    }
}

impl TaskStat {
    #[inline]
    pub const fn ready() -> Self {
        Self::empty()
    }

    /// Blocked on some object, possibly with a timeout armed.
    #[inline]
    pub fn is_pending(self) -> bool {
        self.intersects(Self::PEND_ANY)
    }

    #[inline]
    pub fn is_ready(self) -> bool {
        self.is_empty()
    }
}

/// Why a pending task woke up.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PendStat {
    /// Not pending, or woken by a regular delivery.
    #[default]
    Ok = 0,
    /// The wait timed out before anything was delivered.
    Timeout = 1,
    /// The wait was aborted by a third party.
    Abort = 2,
}

impl PendStat {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Timeout,
            2 => Self::Abort,
            _ => Self::Ok,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

// --- Task flags ---

bitflags! {
    /// Creation-time task attributes. Bits at `USER_SHIFT` and above are
    /// reserved for higher layers and pass through the engine untouched.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        const VCPU = 0x01;
        const IDLE = 0x02;
        const PERCPU = 0x04;

        const _ = !0;
    }
}

impl TaskFlags {
    pub const USER_SHIFT: u32 = 8;
}

// --- Cross-CPU event actions ---

/// What a cross-CPU task event asks the owner CPU to do.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskEventAction {
    /// An event object the task pends on was posted; deliver the message and
    /// clear the wait bits named in the mask.
    EventReady = 0,
    /// A flag group the task pends on fired; deliver the ready flags and keep
    /// only the state bits named in the mask.
    FlagReady = 1,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_empty_set_is_ready() {
        let stat = TaskStat::ready();
        assert!(stat.is_ready());
        assert!(!stat.is_pending());
    }

    #[test]
    fn stat_pend_bits_are_pending() {
        let stat = TaskStat::PEND_EVENT | TaskStat::SUSPEND;
        assert!(stat.is_pending());
        assert!(!stat.is_ready());

        let stat = TaskStat::PEND_FLAG;
        assert!(stat.is_pending());
    }

    #[test]
    fn stat_suspend_alone_is_not_pending() {
        let stat = TaskStat::SUSPEND;
        assert!(!stat.is_pending());
        assert!(!stat.is_ready());
    }

    #[test]
    fn user_flag_bits_are_retained() {
        let raw = TaskFlags::VCPU.bits() | (1 << TaskFlags::USER_SHIFT);
        let flags = TaskFlags::from_bits_retain(raw);
        assert!(flags.contains(TaskFlags::VCPU));
        assert_eq!(flags.bits(), raw);
    }

    #[test]
    fn pend_stat_round_trips() {
        for tag in [PendStat::Ok, PendStat::Timeout, PendStat::Abort] {
            assert_eq!(PendStat::from_u8(tag.as_u8()), tag);
        }
    }

    #[test]
    fn identity_regions_are_disjoint() {
        assert!(NR_REALTIME_PIDS < MAX_TASKS);
        assert_eq!(PRIO_LOWEST as usize, NR_REALTIME_PIDS - 1);
        assert!(PRIO_PCPU > PRIO_LOWEST);
        assert!(PRIO_IDLE > PRIO_LOWEST);
    }
}
