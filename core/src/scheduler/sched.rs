//! Global ready state and reschedule plumbing.
//!
//! Real-time tasks are marked runnable in a kernel-wide priority bucket
//! table: one group bit per eight priorities plus a per-group byte, indexed
//! by the coordinates precomputed on the task. Lookup of the highest ready
//! priority is two trailing-zero scans. Per-CPU tasks are marked runnable on
//! their home CPU's ready list instead.
//!
//! The engine never switches contexts itself; it only raises per-CPU
//! "resched needed" flags (and the reschedule IPI for remote CPUs) and lets
//! the scheduler backend act on them.

use core::sync::atomic::{AtomicBool, Ordering};

use hypos_lib::IrqMutex;
use hypos_lib::pcr;

use super::per_cpu;
use super::task_struct::Task;

// =============================================================================
// Real-time ready table (kernel-wide lock)
// =============================================================================

struct RtReadyTable {
    grp: u8,
    tbl: [u8; 8],
}

impl RtReadyTable {
    const fn new() -> Self {
        Self { grp: 0, tbl: [0; 8] }
    }

    fn mark(&mut self, by: u8, bity: u8, bitx: u8) {
        self.grp |= bity;
        self.tbl[by as usize] |= bitx;
    }

    fn unmark(&mut self, by: u8, bity: u8, bitx: u8) {
        self.tbl[by as usize] &= !bitx;
        if self.tbl[by as usize] == 0 {
            self.grp &= !bity;
        }
    }

    fn highest(&self) -> Option<u8> {
        if self.grp == 0 {
            return None;
        }
        let by = self.grp.trailing_zeros() as u8;
        let bx = self.tbl[by as usize].trailing_zeros() as u8;
        Some((by << 3) + bx)
    }

    fn is_ready(&self, prio: u8) -> bool {
        self.tbl[(prio >> 3) as usize] & (1 << (prio & 0x07)) != 0
    }
}

static RT_READY: IrqMutex<RtReadyTable> = IrqMutex::new(RtReadyTable::new());

// =============================================================================
// Readiness
// =============================================================================

/// Mark `task` runnable: real-time tasks go into the global bucket table
/// under the kernel-wide lock, per-CPU tasks onto their home CPU's ready
/// list. Idempotent, so a timeout and a racing delivery cannot double-mark.
///
/// Ready-structure locks nest inside the per-task lock here; no path in the
/// engine acquires the task lock while holding one of them.
pub fn set_task_ready(task: *mut Task) {
    if task.is_null() {
        return;
    }
    // SAFETY: callers hand in a live task from the table.
    let task_ref = unsafe { &*task };
    if task_ref.is_realtime() {
        RT_READY
            .lock()
            .mark(task_ref.by, task_ref.bity, task_ref.bitx);
    } else {
        per_cpu::ready_list_add(task_ref.affinity as usize, task);
    }
}

/// Withdraw a real-time task's ready mark. The scheduler backend calls this
/// when it dispatches the task; per-CPU tasks are dequeued by their owner
/// instead.
pub fn clear_rt_task_ready(task: *mut Task) {
    if task.is_null() {
        return;
    }
    // SAFETY: as in `set_task_ready`.
    let task_ref = unsafe { &*task };
    if task_ref.is_realtime() {
        RT_READY
            .lock()
            .unmark(task_ref.by, task_ref.bity, task_ref.bitx);
    }
}

pub fn highest_rt_prio() -> Option<u8> {
    RT_READY.lock().highest()
}

pub fn is_rt_prio_ready(prio: u8) -> bool {
    prio >> 3 < 8 && RT_READY.lock().is_ready(prio)
}

pub fn reset_ready_table() {
    let mut table = RT_READY.lock();
    table.grp = 0;
    table.tbl = [0; 8];
}

// =============================================================================
// Resched requests
// =============================================================================

static OS_RUNNING: AtomicBool = AtomicBool::new(false);

/// Flip once the scheduler backend starts dispatching; creation paths only
/// yield after this.
pub fn set_os_running(running: bool) {
    OS_RUNNING.store(running, Ordering::Release);
}

#[inline]
pub fn os_is_running() -> bool {
    OS_RUNNING.load(Ordering::Acquire)
}

/// Ask the executing CPU to reconsider its running task at the next safe
/// point.
pub fn set_need_resched() {
    per_cpu::set_need_resched(pcr::current_cpu_id());
}

/// Yield request. The engine never blocks; this only raises the local flag.
pub fn sched() {
    set_need_resched();
}

/// Ask `cpu` to reschedule. Fire-and-forget; remote CPUs get the reschedule
/// IPI, the local CPU just has its flag raised.
pub fn pcpu_resched(cpu: usize) {
    per_cpu::set_need_resched(cpu);
    if cpu != pcr::current_cpu_id() {
        pcr::send_resched_ipi(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_table_marks_and_scans() {
        let mut table = RtReadyTable::new();
        assert_eq!(table.highest(), None);

        // prio 21: by 2, bx 5
        table.mark(2, 1 << 2, 1 << 5);
        // prio 9: by 1, bx 1
        table.mark(1, 1 << 1, 1 << 1);
        assert_eq!(table.highest(), Some(9));
        assert!(table.is_ready(21));
        assert!(!table.is_ready(20));

        table.unmark(1, 1 << 1, 1 << 1);
        assert_eq!(table.highest(), Some(21));
        table.unmark(2, 1 << 2, 1 << 5);
        assert_eq!(table.highest(), None);
    }
}
