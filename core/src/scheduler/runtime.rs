//! Idle-task bootstrap.
//!
//! The idle records and the per-CPU boot stacks are statically reserved:
//! they exist before any allocator does, and the invariant "every CPU has a
//! current task" must hold from the first instruction that takes a spinlock.
//! [`tasks_early_init`] seeds that invariant; later each CPU promotes its
//! record into a real table entry with [`create_idle_task`].

use core::cell::UnsafeCell;
use core::ptr;

use hypos_abi::task::{
    BOOT_STACK_SIZE, MAX_CPUS, PRIO_IDLE, PRIO_PCPU, TASK_STACK_SIZE, TaskFlags, TaskStat,
};
use hypos_lib::init_flag::InitFlag;
use hypos_lib::{klog_info, pcr};

use super::hooks;
use super::per_cpu;
use super::task::{self, TaskCreateError};
use super::task_struct::{Task, TaskInfo};

#[repr(C, align(4096))]
struct BootStack([u8; BOOT_STACK_SIZE]);

struct IdleRecords(UnsafeCell<[Task; MAX_CPUS]>);

// SAFETY: each record belongs to exactly one CPU; cross-CPU readers only see
// it through the table after `create_idle_task` publishes it.
unsafe impl Sync for IdleRecords {}

struct BootStacks(UnsafeCell<[BootStack; MAX_CPUS]>);

// SAFETY: each boot stack belongs to exactly one CPU.
unsafe impl Sync for BootStacks {}

static IDLE_TASKS: IdleRecords =
    IdleRecords(UnsafeCell::new([const { Task::empty() }; MAX_CPUS]));

static BOOT_STACKS: BootStacks =
    BootStacks(UnsafeCell::new([const { BootStack([0; BOOT_STACK_SIZE]) }; MAX_CPUS]));

static EARLY_INIT: InitFlag = InitFlag::new();

/// The statically reserved idle record for `cpu`.
fn idle_record(cpu: usize) -> *mut Task {
    // SAFETY: `cpu` is bounds-checked by every caller.
    unsafe { (IDLE_TASKS.0.get() as *mut Task).add(cpu) }
}

/// Whether `task` points into the static idle array (as opposed to the heap).
pub fn is_static_idle_record(task: *const Task) -> bool {
    let base = IDLE_TASKS.0.get() as usize;
    let end = base + MAX_CPUS * size_of::<Task>();
    (base..end).contains(&(task as usize))
}

/// Top of `cpu`'s boot stack.
pub fn boot_stack_top(cpu: usize) -> *mut u8 {
    // SAFETY: `cpu` is bounds-checked by every caller.
    unsafe { (BOOT_STACKS.0.get() as *mut u8).add((cpu + 1) * BOOT_STACK_SIZE) }
}

/// Very-early bring-up, before the scheduler exists: zero the idle records,
/// seed every CPU's current/next task pointers with them, and lay a
/// synthetic `TaskInfo` at the top of each boot stack so that current-task
/// lookups work from the first instruction. Idempotent; also used by engine
/// reinitialisation.
pub fn tasks_early_init() {
    let _ = EARLY_INIT.init_once();

    for cpu in 0..MAX_CPUS {
        let task = idle_record(cpu);
        // SAFETY: the record is statically reserved and either untouched or
        // orphaned by a prior reinitialisation.
        unsafe { ptr::write(task, Task::empty()) };

        per_cpu::set_current_task(cpu, task);
        per_cpu::set_next_task(cpu, task);

        // SAFETY: the header lands inside the CPU's own boot stack.
        unsafe {
            let origin = boot_stack_top(cpu).sub(TaskInfo::SIZE);
            TaskInfo::write_at(origin, task, cpu);
        }
    }
}

/// Promote the executing CPU's idle record into a real task.
///
/// Claims the reserved idle identity (a CPU that already has an idle task is
/// refused), installs the static record in the table, and re-runs the
/// constructor with no stack: the CPU is already running on its boot stack,
/// which the record then adopts. The task comes up `RUNNING`: it *is* what
/// the CPU is executing.
///
/// Panics if early init never ran; a CPU without an idle task cannot
/// continue.
pub fn create_idle_task() -> Result<usize, TaskCreateError> {
    if !EARLY_INIT.is_set() {
        panic!("create_idle_task before tasks_early_init");
    }

    let cpu = pcr::current_cpu_id();
    let pid = task::alloc_pid(PRIO_IDLE, cpu).ok_or(TaskCreateError::NoPid)?;

    let task = idle_record(cpu);
    task::install_task(pid, task);

    // SAFETY: the record is this CPU's own static slot.
    let task_ref = unsafe { &mut *task };
    task::init_task(
        task_ref,
        "idle-task",
        ptr::null_mut(),
        ptr::null_mut(),
        PRIO_IDLE,
        pid,
        cpu,
        0,
        TaskFlags::empty(),
    );
    hooks::run_task_module_inits(task);

    // Adopt the boot stack: its header is already in place from early init.
    task_ref.stack_origin = unsafe { boot_stack_top(cpu).sub(TaskInfo::SIZE) };
    task_ref.stack_base = task_ref.stack_origin;
    task_ref.stack_size = TASK_STACK_SIZE;

    task_ref.wait.lock().stat = TaskStat::RUNNING;
    task_ref.flags |= TaskFlags::IDLE;

    per_cpu::set_idle_task(cpu, task);
    hooks::run_task_create_hooks(task);

    per_cpu::set_current_prio(cpu, PRIO_PCPU);
    per_cpu::set_next_prio(cpu, PRIO_PCPU);

    klog_info!("sched: cpu{} idle task up (pid {})", cpu, pid);

    Ok(pid)
}
