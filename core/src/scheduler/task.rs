//! Task table, identity allocation, and task construction.
//!
//! Identities are dense indexes into a fixed table. The low region doubles
//! as the real-time priority space (`pid == prio` there) and is claimed by
//! test-and-set; everything else is handed out first-free from the dense
//! region. A slot goes `Empty → Reserved → Installed → Empty`, with
//! `Reserved` only ever appearing for the priority-reserved region.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use hypos_abi::task::{
    CPU_AFF_ANY, CPU_AFF_LOCAL, MAX_TASKS, NR_REALTIME_PIDS, PRIO_IDLE, PRIO_LOWEST, PRIO_PCPU,
    TASK_RUN_TIME_TICKS, TASK_STACK_SIZE, TaskFlags, TaskStat,
};
use hypos_lib::bitmap::Bitmap;
use hypos_lib::spinlock::IrqMutex;
use hypos_lib::string::copy_name;
use hypos_lib::{klog_debug, klog_info, pcr};
use hypos_mm::kernel_heap::{kfree, kmalloc};
use hypos_mm::page_alloc::{alloc_pages, free_pages, page_align, pages_for};

use super::hooks;
use super::per_cpu;
use super::runtime;
use super::sched;
use super::task_struct::{Task, TaskEntry, TaskInfo, WaitState};

// =============================================================================
// Task table
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskSlot {
    /// Identity free.
    Empty,
    /// Identity claimed, record not installed yet.
    Reserved,
    /// Live task.
    Installed(*mut Task),
}

struct TaskTable {
    map: Bitmap<2>,
    slots: [TaskSlot; MAX_TASKS],
}

// SAFETY: the slots hold raw pointers to engine-owned tasks; table access is
// serialized through the IrqMutex.
unsafe impl Send for TaskTable {}

impl TaskTable {
    const fn new() -> Self {
        Self {
            map: Bitmap::new(),
            slots: [TaskSlot::Empty; MAX_TASKS],
        }
    }
}

static TASK_TABLE: IrqMutex<TaskTable> = IrqMutex::new(TaskTable::new());

/// Number of installed tasks; lock-free so diagnostics can read it anywhere.
static TASK_COUNT: AtomicU32 = AtomicU32::new(0);

pub fn task_count() -> u32 {
    TASK_COUNT.load(Ordering::Acquire)
}

const _: () = {
    assert!(Bitmap::<2>::BITS == MAX_TASKS);
    assert!(NR_REALTIME_PIDS == PRIO_LOWEST as usize + 1);
};

// =============================================================================
// Identity allocation
// =============================================================================

/// Claim a task identity for `prio`, homed on `cpu`.
///
/// Real-time priorities are their own identity: first-set wins, and the slot
/// is marked `Reserved` until the record is installed. Sentinel priorities
/// draw from the dense region, except a second idle task for a CPU that
/// already has one, which is refused outright.
pub fn alloc_pid(prio: u8, cpu: usize) -> Option<usize> {
    let mut table = TASK_TABLE.lock();

    if prio > PRIO_LOWEST {
        if prio == PRIO_IDLE && !per_cpu::idle_task(cpu).is_null() {
            return None;
        }
        let pid = table.map.next_zero_bit(NR_REALTIME_PIDS, MAX_TASKS)?;
        table.map.set(pid);
        Some(pid)
    } else {
        let pid = prio as usize;
        if table.map.test_and_set(pid) {
            return None;
        }
        table.slots[pid] = TaskSlot::Reserved;
        Some(pid)
    }
}

/// Return an identity. Out-of-range pids are ignored.
pub fn release_pid(pid: usize) {
    if pid >= MAX_TASKS {
        return;
    }
    let mut table = TASK_TABLE.lock();
    table.map.clear(pid);
    table.slots[pid] = TaskSlot::Empty;
}

/// Bounds-checked lookup. Null for free, reserved, or out-of-range slots.
pub fn pid_to_task(pid: usize) -> *mut Task {
    if pid >= MAX_TASKS {
        return ptr::null_mut();
    }
    match TASK_TABLE.lock().slots[pid] {
        TaskSlot::Installed(task) => task,
        _ => ptr::null_mut(),
    }
}

/// Raw slot state, for the scheduler backend and diagnostics.
pub fn task_table_slot(pid: usize) -> TaskSlot {
    if pid >= MAX_TASKS {
        return TaskSlot::Empty;
    }
    TASK_TABLE.lock().slots[pid]
}

pub(crate) fn install_task(pid: usize, task: *mut Task) {
    TASK_TABLE.lock().slots[pid] = TaskSlot::Installed(task);
    TASK_COUNT.fetch_add(1, Ordering::AcqRel);
}

// =============================================================================
// Construction
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskCreateError {
    /// The affinity names neither a present CPU nor a sentinel.
    InvalidAffinity,
    /// Identity space exhausted, or the reserved identity is taken.
    NoPid,
    /// Record or stack allocation failed.
    OutOfMemory,
}

/// Fill in a task record. `stack_top` may be null for tasks that inherit a
/// stack (the idle path); otherwise the `TaskInfo` header is reserved at the
/// top and the usable frame sits below it.
pub(crate) fn init_task(
    task: &mut Task,
    name: &str,
    stack_top: *mut u8,
    arg: *mut c_void,
    prio: u8,
    pid: usize,
    cpu: usize,
    stk_size: usize,
    flags: TaskFlags,
) {
    if !stack_top.is_null() {
        // SAFETY: the caller provides a stack of at least `stk_size` bytes
        // ending at `stack_top`.
        let origin = unsafe { stack_top.sub(TaskInfo::SIZE) };
        task.stack_origin = origin;
        task.stack_base = origin;
        task.stack_size = stk_size;
        // SAFETY: `origin` is inside the owned stack and pointer-aligned.
        unsafe { TaskInfo::write_at(origin, task as *mut Task, cpu) };
    }

    task.udata = arg;
    task.pid = pid;
    task.prio = prio;
    task.flags = flags;
    task.affinity = cpu as u16;
    task.del_req.store(false, Ordering::Relaxed);
    task.run_time = TASK_RUN_TIME_TICKS;
    task.timer_cpu = cpu;

    if prio <= PRIO_LOWEST {
        task.set_prio_coords();
    }

    {
        let mut wait = task.wait.lock();
        *wait = WaitState::new();
        // VCPU tasks are born suspended; the VM layer decides when they run.
        if flags.contains(TaskFlags::VCPU) {
            wait.stat = TaskStat::SUSPEND;
        }
    }

    if prio == PRIO_IDLE {
        task.flags |= TaskFlags::IDLE;
    }

    copy_name(&mut task.name, name);
}

/// Make a constructed task visible to scheduling: per-CPU tasks are homed on
/// their CPU's lists, real-time tasks are marked globally ready, and the
/// right CPU is asked to reschedule. VCPU tasks stay suspended.
fn activate_task(task: *mut Task) {
    // SAFETY: `task` was just installed in the table.
    let task_ref = unsafe { &*task };
    let home = task_ref.affinity as usize;

    if task_ref.is_percpu() {
        per_cpu::attach_percpu_task(home, task);
    }

    if task_ref.is_vcpu() {
        return;
    }

    if task_ref.is_realtime() {
        sched::set_task_ready(task);
        if sched::os_is_running() {
            sched::sched();
        }
    } else if home != pcr::current_cpu_id() {
        sched::pcpu_resched(home);
    }
}

/// Create a task and hand it to the dispatcher.
///
/// Failures unwind in strict reverse order: the stack, then the record, then
/// the identity. Nothing stays registered.
pub fn create_task(
    name: &str,
    func: TaskEntry,
    arg: *mut c_void,
    prio: u8,
    aff: u16,
    flags: TaskFlags,
) -> Result<usize, TaskCreateError> {
    let home = match aff {
        CPU_AFF_ANY => 0,
        CPU_AFF_LOCAL => pcr::current_cpu_id(),
        cpu if (cpu as usize) < pcr::cpu_count() => cpu as usize,
        _ => return Err(TaskCreateError::InvalidAffinity),
    };

    let pid = alloc_pid(prio, home).ok_or(TaskCreateError::NoPid)?;

    let task = kmalloc(size_of::<Task>()) as *mut Task;
    if task.is_null() {
        klog_info!("task: no memory for task record");
        release_pid(pid);
        return Err(TaskCreateError::OutOfMemory);
    }
    // SAFETY: `task` is a fresh, properly sized allocation.
    unsafe { ptr::write(task, Task::empty()) };

    let stk_size = page_align(TASK_STACK_SIZE);
    let stack = alloc_pages(pages_for(stk_size));
    if stack.is_null() {
        klog_info!("task: no memory for task stack");
        // SAFETY: `task` came from kmalloc above and holds no owned state yet.
        unsafe { kfree(task as *mut u8) };
        release_pid(pid);
        return Err(TaskCreateError::OutOfMemory);
    }
    klog_debug!("task: stack {:p} for task-{}", stack, pid);

    // The task is visible in the table before it appears on any run list.
    install_task(pid, task);

    // SAFETY: we own the fresh record and the stack block.
    let task_ref = unsafe { &mut *task };
    let stack_top = unsafe { stack.add(stk_size) };
    init_task(task_ref, name, stack_top, arg, prio, pid, home, stk_size, flags);
    task_ref.entry = Some(func);

    hooks::run_task_module_inits(task);
    hooks::run_task_create_hooks(task);
    hooks::arch_init_task(task);

    activate_task(task);

    Ok(pid)
}

/// One worker per online CPU. Per-CPU failures are logged and skipped so the
/// remaining CPUs still get theirs.
pub fn create_percpu_task(name: &str, func: TaskEntry, arg: *mut c_void, flags: TaskFlags) {
    for cpu in 0..pcr::cpu_count() {
        if !pcr::is_cpu_online(cpu) {
            continue;
        }
        if let Err(err) = create_task(name, func, arg, PRIO_PCPU, cpu as u16, flags) {
            klog_info!("task: create [{}] failed on cpu{} ({:?})", name, cpu, err);
        }
    }
}

/// Real-time tasks are pinned to CPU 0 by convention; their priority is also
/// their identity.
pub fn create_realtime_task(
    name: &str,
    func: TaskEntry,
    arg: *mut c_void,
    prio: u8,
    flags: TaskFlags,
) -> Result<usize, TaskCreateError> {
    create_task(name, func, arg, prio, 0, flags)
}

/// Back a guest virtual CPU. Always an ordinary per-CPU task, and only the
/// VCPU flag survives; it is what keeps the task suspended until the VM
/// layer starts it.
pub fn create_vcpu_task(
    name: &str,
    func: TaskEntry,
    arg: *mut c_void,
    aff: u16,
    flags: TaskFlags,
) -> Result<usize, TaskCreateError> {
    create_task(name, func, arg, PRIO_PCPU, aff, flags & TaskFlags::VCPU)
}

// =============================================================================
// Reinitialisation
// =============================================================================

/// Tear the table down: every identity is released and heap-backed records
/// and stacks are freed. The statically allocated idle records survive.
/// Run lists and timer queues must already be clear: nothing may still
/// reference the records.
pub fn reset_task_table() {
    let mut victims: [Option<*mut Task>; MAX_TASKS] = [None; MAX_TASKS];
    {
        let mut table = TASK_TABLE.lock();
        for (pid, slot) in table.slots.iter_mut().enumerate() {
            if let TaskSlot::Installed(task) = *slot {
                victims[pid] = Some(task);
            }
            *slot = TaskSlot::Empty;
        }
        table.map.clear_all();
    }
    TASK_COUNT.store(0, Ordering::Release);

    for task in victims.iter().flatten() {
        let task = *task;
        if runtime::is_static_idle_record(task) {
            continue;
        }
        // SAFETY: the slots are cleared, so nothing can reach this record;
        // stack geometry recovers the original page allocation.
        unsafe {
            let task_ref = &*task;
            if !task_ref.stack_origin.is_null() && task_ref.stack_size != 0 {
                let stack = task_ref
                    .stack_origin
                    .add(TaskInfo::SIZE)
                    .sub(task_ref.stack_size);
                free_pages(stack, pages_for(task_ref.stack_size));
            }
            kfree(task as *mut u8);
        }
    }
}
