//! Per-CPU delay timers.
//!
//! Every task's delay timer lives in the timer queue of its home CPU, so the
//! expiry handler always runs where the task's ready state may be mutated.
//! The platform's tick interrupt calls [`run_cpu_timers`] with the local
//! tick count; due entries fire [`task_timeout_handler`].

use hypos_abi::task::{MAX_CPUS, MAX_TASKS, PendStat, TaskStat};
use hypos_lib::IrqMutex;
use hypos_lib::klog_warn;
use hypos_lib::pcr;

use super::sched;
use super::task_struct::Task;
use core::ptr;

#[derive(Clone, Copy)]
struct TimerEntry {
    task: *mut Task,
    wake_tick: u64,
    active: bool,
}

impl TimerEntry {
    const fn empty() -> Self {
        Self {
            task: ptr::null_mut(),
            wake_tick: 0,
            active: false,
        }
    }
}

struct TimerQueue {
    entries: [TimerEntry; MAX_TASKS],
}

// SAFETY: entries hold raw pointers to engine-owned tasks; queue access is
// serialized through the IrqMutex.
unsafe impl Send for TimerQueue {}

impl TimerQueue {
    const fn new() -> Self {
        Self {
            entries: [TimerEntry::empty(); MAX_TASKS],
        }
    }

    fn clear(&mut self) {
        self.entries = [TimerEntry::empty(); MAX_TASKS];
    }

    fn upsert(&mut self, task: *mut Task, wake_tick: u64) -> bool {
        let mut free_idx = None;
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if entry.active && entry.task == task {
                entry.wake_tick = wake_tick;
                return true;
            }
            if !entry.active && free_idx.is_none() {
                free_idx = Some(idx);
            }
        }

        if let Some(idx) = free_idx {
            self.entries[idx] = TimerEntry {
                task,
                wake_tick,
                active: true,
            };
            true
        } else {
            false
        }
    }

    fn remove(&mut self, task: *mut Task) {
        for entry in self.entries.iter_mut() {
            if entry.active && entry.task == task {
                *entry = TimerEntry::empty();
                break;
            }
        }
    }

    fn collect_due(&mut self, now_tick: u64, out: &mut [*mut Task; MAX_TASKS]) -> usize {
        let mut count = 0usize;
        for entry in self.entries.iter_mut() {
            if !entry.active {
                continue;
            }
            if tick_reached(now_tick, entry.wake_tick) {
                if count < out.len() {
                    out[count] = entry.task;
                    count += 1;
                }
                *entry = TimerEntry::empty();
            }
        }
        count
    }
}

static TIMERS: [IrqMutex<TimerQueue>; MAX_CPUS] =
    [const { IrqMutex::new(TimerQueue::new()) }; MAX_CPUS];

#[inline]
fn tick_reached(now_tick: u64, deadline_tick: u64) -> bool {
    now_tick.wrapping_sub(deadline_tick) < (1u64 << 63)
}

/// Arm (or re-arm) `task`'s delay timer to fire at `wake_tick` on its home
/// CPU. Fails only if the home queue is full, which cannot happen while the
/// queue is sized for every task in the system.
pub fn task_timer_start(task: *mut Task, wake_tick: u64) -> bool {
    if task.is_null() {
        return false;
    }
    // SAFETY: callers hand in a live task from the table.
    let cpu = unsafe { (*task).timer_cpu };
    match TIMERS.get(cpu) {
        Some(queue) => queue.lock().upsert(task, wake_tick),
        None => false,
    }
}

/// Disarm `task`'s delay timer if armed.
pub fn task_timer_stop(task: *mut Task) {
    if task.is_null() {
        return;
    }
    // SAFETY: as in `task_timer_start`.
    let cpu = unsafe { (*task).timer_cpu };
    if let Some(queue) = TIMERS.get(cpu) {
        queue.lock().remove(task);
    }
}

/// Fire every due timer on the executing CPU. Called from the local tick
/// interrupt with the CPU's current tick count.
pub fn run_cpu_timers(now_tick: u64) {
    let cpu = pcr::current_cpu_id();
    let mut due = [ptr::null_mut(); MAX_TASKS];
    let due_count = {
        let Some(queue) = TIMERS.get(cpu) else {
            return;
        };
        queue.lock().collect_due(now_tick, &mut due)
    };

    for task in due.iter().take(due_count) {
        task_timeout_handler(*task);
    }
}

/// Delay expiry for one task, on its home CPU.
///
/// A pending task is woken with `pend_stat = Timeout`; a plain delayed sleep
/// is simply made ready. Anything else means the timer lost a race with
/// another wake path: log it and leave the task untouched.
pub fn task_timeout_handler(task: *mut Task) {
    if task.is_null() {
        return;
    }
    // SAFETY: the timer queue only holds live tasks.
    let task_ref = unsafe { &*task };

    let mut wait = task_ref.wait.lock();

    if wait.stat.is_pending() {
        wait.delay = 0;
        sched::set_task_ready(task);
        wait.stat.remove(TaskStat::SUSPEND);
        wait.stat.remove(TaskStat::PEND_ANY);
        wait.pend_stat = PendStat::Timeout;
        drop(wait);
        sched::set_need_resched();
    } else if wait.delay != 0 {
        wait.delay = 0;
        sched::set_task_ready(task);
        wait.stat.remove(TaskStat::SUSPEND);
        drop(wait);
        sched::set_need_resched();
    } else {
        klog_warn!(
            "timer: unexpected wake for task {} (stat {:?}, pend {:?})",
            task_ref.pid,
            wait.stat,
            wait.pend_stat
        );
    }
}

/// Disarm everything on every CPU. Reinitialisation only.
pub fn reset_timer_queues() {
    for queue in TIMERS.iter() {
        queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_compare_handles_wraparound() {
        assert!(tick_reached(10, 10));
        assert!(tick_reached(11, 10));
        assert!(!tick_reached(9, 10));
        // Deadline just after a wrap of the tick counter.
        assert!(tick_reached(1, u64::MAX));
    }
}
