//! Cross-CPU task event delivery.
//!
//! A task's ready state is only ever mutated on the CPU that owns it. A CPU
//! that wants to wake a task homed elsewhere fills in an event descriptor and
//! forwards it with a function-call IPI; the handler runs on the owner and
//! applies the wake there.
//!
//! Descriptors come from a fixed 32-slot arena governed by a bitmap, so the
//! path works from interrupt context without an allocator. The pool is lossy:
//! exhaustion returns null and the sender treats the delivery as transiently
//! failed; the waiter stays correct because a later delivery or its own
//! timeout still wakes it.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr;

use hypos_abi::task::{NR_TASK_EVENTS, TaskEventAction, TaskStat};
use hypos_lib::bitmap::Bitmap;
use hypos_lib::klog_error;
use hypos_lib::pcr;
use hypos_lib::smp::{SmpCallError, smp_function_call};
use hypos_lib::spinlock::IrqMutex;

use super::sched;
use super::task_struct::Task;

pub struct TaskEvent {
    /// Slot index in the arena; set when the slot is claimed.
    pub id: usize,
    pub action: TaskEventAction,
    pub task: *mut Task,
    pub msg: *mut c_void,
    /// For `EventReady`: state bits to clear. For `FlagReady`: bits to keep.
    pub mask: u32,
    /// For `FlagReady`: the ready flags to deliver.
    pub flags: u32,
}

impl TaskEvent {
    const fn empty() -> Self {
        Self {
            id: 0,
            action: TaskEventAction::EventReady,
            task: ptr::null_mut(),
            msg: ptr::null_mut(),
            mask: 0,
            flags: 0,
        }
    }
}

struct EventArena(UnsafeCell<[TaskEvent; NR_TASK_EVENTS]>);

// SAFETY: a slot is only written by whoever holds its occupancy bit, claimed
// through the pool lock below.
unsafe impl Sync for EventArena {}

static EVENTS: EventArena =
    EventArena(UnsafeCell::new([const { TaskEvent::empty() }; NR_TASK_EVENTS]));
static EVENT_MAP: IrqMutex<Bitmap<1>> = IrqMutex::new(Bitmap::new());

/// Claim a free event slot. Null when the pool is exhausted, a transient
/// failure the caller must back off from.
pub fn alloc_task_event() -> *mut TaskEvent {
    let bit = {
        let mut map = EVENT_MAP.lock();
        let Some(bit) = map.next_zero_bit(0, NR_TASK_EVENTS) else {
            return ptr::null_mut();
        };
        map.set(bit);
        bit
    };

    // SAFETY: the occupancy bit makes this slot exclusively ours.
    unsafe {
        let event = (EVENTS.0.get() as *mut TaskEvent).add(bit);
        (*event).id = bit;
        event
    }
}

/// Return a slot to the pool. Only the occupancy bit is touched (no memory
/// is freed), so this is safe from interrupt context.
pub fn release_task_event(event: *mut TaskEvent) {
    if event.is_null() {
        return;
    }
    // SAFETY: the slot was claimed through `alloc_task_event`.
    let id = unsafe { (*event).id };
    EVENT_MAP.lock().clear(id);
}

/// Occupied slot count, for diagnostics.
pub fn event_pool_in_use() -> usize {
    EVENT_MAP.lock().count_set()
}

/// Reclaim every slot. Reinitialisation only.
pub fn reset_event_pool() {
    EVENT_MAP.lock().clear_all();
}

// =============================================================================
// Delivery
// =============================================================================

/// Forward `event` to the CPU owning `event.task` and run the wake handler
/// there.
pub fn task_ipi_event(
    task: *mut Task,
    event: *mut TaskEvent,
    wait: bool,
) -> Result<(), SmpCallError> {
    if task.is_null() || event.is_null() {
        return Err(SmpCallError::BadCpu);
    }
    // SAFETY: the caller hands in a live task.
    let cpu = unsafe { (*task).affinity as usize };
    smp_function_call(cpu, task_ipi_event_handler, event as *mut c_void, wait)
}

/// Executes on the destination CPU. Validates that the task is still owned
/// here, applies the action under the task lock, then releases the slot.
fn task_ipi_event_handler(data: *mut c_void) {
    if data.is_null() {
        klog_error!("task_event: delivery with no event descriptor");
        return;
    }
    let event = data as *mut TaskEvent;
    // SAFETY: a queued event stays valid until its slot is released below.
    let (task, action, msg, mask, flags) = unsafe {
        (
            (*event).task,
            (*event).action,
            (*event).msg,
            (*event).mask,
            (*event).flags,
        )
    };

    if task.is_null() {
        release_task_event(event);
        return;
    }
    // SAFETY: events only carry tasks from the table.
    let task_ref = unsafe { &*task };

    // Stale delivery: the task migrated or stopped being a per-CPU task
    // between send and arrival. Drop silently; a consistent delivery must
    // follow from the originator.
    if task_ref.affinity as usize != pcr::current_cpu_id() || !task_ref.is_percpu() {
        release_task_event(event);
        return;
    }

    {
        let mut wait = task_ref.wait.lock();

        match action {
            TaskEventAction::EventReady => {
                // Already woken by its timeout: drop.
                if wait.stat.is_pending() {
                    wait.msg = msg;
                    wait.stat &= !TaskStat::from_bits_retain(mask);
                    wait.wait_event = ptr::null_mut();
                    sched::set_task_ready(task);
                    sched::set_need_resched();
                }
            }
            TaskEventAction::FlagReady => {
                if wait.stat.is_pending() {
                    wait.delay = 0;
                    wait.flags_rdy = flags;
                    wait.stat &= TaskStat::from_bits_retain(mask);
                    sched::set_need_resched();
                }
            }
        }
    }

    // Slot release after dropping the task lock; it only clears a bitmap
    // bit, so it is interrupt-safe.
    release_task_event(event);
}
