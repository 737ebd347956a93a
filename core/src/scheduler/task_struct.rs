//! Kernel-internal task structures.
//!
//! Contains the `Task` record, the stack-top `TaskInfo` header, and the
//! lock-protected wait state. The ABI-stable enums and constants remain in
//! `hypos_abi::task`.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::AtomicBool;

use hypos_abi::task::{
    PRIO_LOWEST, PRIO_PCPU, PendStat, TASK_NAME_MAX_LEN, TaskFlags, TaskStat,
};
use hypos_lib::IrqMutex;
use hypos_lib::string::bytes_as_str;

pub type TaskEntry = fn(*mut c_void);

// =============================================================================
// TaskInfo: stack-top header
// =============================================================================

/// Two-word header co-located at the top of every task stack
/// (`Task::stack_origin` points at it). The back-pointer lets low-level code
/// find the owning task from nothing but a stack address.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TaskInfo {
    pub task: *mut Task,
    pub cpu: usize,
}

impl TaskInfo {
    pub const SIZE: usize = size_of::<TaskInfo>();

    /// Lay the header down at `origin`.
    ///
    /// # Safety
    /// `origin` must be writable, `SIZE` bytes long, and aligned for a
    /// pointer.
    pub unsafe fn write_at(origin: *mut u8, task: *mut Task, cpu: usize) {
        // SAFETY: per the caller's contract.
        unsafe { ptr::write(origin as *mut TaskInfo, TaskInfo { task, cpu }) };
    }
}

const _: () = assert!(TaskInfo::SIZE == 2 * size_of::<usize>());

// =============================================================================
// WaitState: per-task lock-protected wake state
// =============================================================================

/// Everything a wake path may mutate, guarded by the per-task lock
/// (`Task::wait`). The lock is taken in timer and IPI context, so it is an
/// interrupt-safe spinlock.
#[derive(Clone, Copy)]
pub struct WaitState {
    pub stat: TaskStat,
    pub pend_stat: PendStat,
    /// Remaining ticks of a sleep/wait-with-timeout; 0 means no timeout armed.
    pub delay: u32,
    /// Message delivered by a successful event wake.
    pub msg: *mut c_void,
    /// Flag bits delivered by a successful flag wake.
    pub flags_rdy: u32,
    /// Object the task is blocked on; cleared on wake.
    pub wait_event: *mut c_void,
}

// SAFETY: the raw pointers are opaque handles owned by the waiting layer;
// access is serialized through the enclosing IrqMutex.
unsafe impl Send for WaitState {}

impl WaitState {
    pub const fn new() -> Self {
        Self {
            stat: TaskStat::ready(),
            pend_stat: PendStat::Ok,
            delay: 0,
            msg: ptr::null_mut(),
            flags_rdy: 0,
            wait_event: ptr::null_mut(),
        }
    }
}

impl Default for WaitState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Task: the task control block
// =============================================================================

pub struct Task {
    pub pid: usize,
    pub prio: u8,
    /// Home CPU. Resolved from the creation sentinels exactly once; tasks do
    /// not migrate afterwards.
    pub affinity: u16,
    pub flags: TaskFlags,
    pub name: [u8; TASK_NAME_MAX_LEN],

    /// The per-task lock and the state it protects.
    pub wait: IrqMutex<WaitState>,

    /// Destruction requested; honored by higher layers at a safe point.
    pub del_req: AtomicBool,
    /// Scheduling quantum in ticks.
    pub run_time: u32,

    // Priority bucket coordinates, set only for real-time priorities:
    // group index, index within the group, and the two single-bit masks.
    pub by: u8,
    pub bx: u8,
    pub bity: u8,
    pub bitx: u8,

    // Owned stack region. `stack_origin` points at the TaskInfo header.
    pub stack_origin: *mut u8,
    pub stack_base: *mut u8,
    pub stack_size: usize,

    pub entry: Option<TaskEntry>,
    pub udata: *mut c_void,

    /// CPU whose timer queue drives this task's delay timer.
    pub timer_cpu: usize,

    // Intrusive links, owned by the home CPU's run structure and protected by
    // its lock: `next_task` chains the task list, `next_stat` chains whichever
    // of the ready/new lists the task is on.
    pub(crate) next_task: *mut Task,
    pub(crate) next_stat: *mut Task,
}

// SAFETY: Task is shared across CPUs as a raw pointer; the wake state is
// behind the per-task lock, the list links behind the owning run-queue lock,
// and the remaining fields are written only during construction.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            prio: 0,
            affinity: 0,
            flags: TaskFlags::empty(),
            name: [0; TASK_NAME_MAX_LEN],
            wait: IrqMutex::new(WaitState::new()),
            del_req: AtomicBool::new(false),
            run_time: 0,
            by: 0,
            bx: 0,
            bity: 0,
            bitx: 0,
            stack_origin: ptr::null_mut(),
            stack_base: ptr::null_mut(),
            stack_size: 0,
            entry: None,
            udata: ptr::null_mut(),
            timer_cpu: 0,
            next_task: ptr::null_mut(),
            next_stat: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.prio <= PRIO_LOWEST
    }

    #[inline]
    pub fn is_percpu(&self) -> bool {
        self.prio == PRIO_PCPU
    }

    #[inline]
    pub fn is_vcpu(&self) -> bool {
        self.flags.contains(TaskFlags::VCPU)
    }

    /// Precompute the priority bucket coordinates. Only meaningful for
    /// real-time priorities; the scheduler's O(1) lookup indexes with them.
    #[inline]
    pub fn set_prio_coords(&mut self) {
        self.by = self.prio >> 3;
        self.bx = self.prio & 0x07;
        self.bity = 1 << self.by;
        self.bitx = 1 << self.bx;
    }

    /// Copy of the lock-protected wake state, for diagnostics and tests.
    pub fn wait_snapshot(&self) -> WaitState {
        *self.wait.lock()
    }

    pub fn name_str(&self) -> &str {
        bytes_as_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prio_coords_split_into_groups_of_eight() {
        let mut task = Task::empty();
        task.prio = 0;
        task.set_prio_coords();
        assert_eq!((task.by, task.bx, task.bity, task.bitx), (0, 0, 1, 1));

        task.prio = 5;
        task.set_prio_coords();
        assert_eq!((task.by, task.bx), (0, 5));
        assert_eq!((task.bity, task.bitx), (1, 1 << 5));

        task.prio = PRIO_LOWEST;
        task.set_prio_coords();
        assert_eq!((task.by, task.bx), (7, 7));
        assert_eq!((task.bity, task.bitx), (1 << 7, 1 << 7));
    }

    #[test]
    fn empty_task_is_ready_and_unlinked() {
        let task = Task::empty();
        let wait = task.wait_snapshot();
        assert!(wait.stat.is_ready());
        assert_eq!(wait.pend_stat, PendStat::Ok);
        assert!(task.next_task.is_null());
        assert!(task.next_stat.is_null());
    }
}
