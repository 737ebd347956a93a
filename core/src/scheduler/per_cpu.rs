//! Per-CPU run structures.
//!
//! Each CPU owns three intrusive task lists: `tasks` (every task homed on the
//! CPU), `ready` (runnable here, now) and `new` (homed here but created from
//! another CPU; the owner splices them into `ready` at its next scheduling
//! opportunity). List membership is protected by the per-CPU lock; the
//! current/next/idle task pointers are plain atomics so early-boot code can
//! read them before anything else exists.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

use hypos_abi::task::MAX_CPUS;
use hypos_lib::IrqMutex;
use hypos_lib::pcr;

use super::task_struct::Task;

// =============================================================================
// Intrusive task queues
// =============================================================================

/// Which link field a queue chains through. A task sits on the task list and
/// on at most one of ready/new simultaneously, so two link fields suffice.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Link {
    Task,
    Stat,
}

struct TaskQueue {
    head: *mut Task,
    tail: *mut Task,
    count: u32,
    link: Link,
}

impl TaskQueue {
    const fn new(link: Link) -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            count: 0,
            link,
        }
    }

    #[inline]
    unsafe fn next(&self, task: *mut Task) -> *mut Task {
        // SAFETY: `task` is a live queue member; links are guarded by the
        // enclosing lock.
        unsafe {
            match self.link {
                Link::Task => (*task).next_task,
                Link::Stat => (*task).next_stat,
            }
        }
    }

    #[inline]
    unsafe fn set_next(&self, task: *mut Task, next: *mut Task) {
        // SAFETY: as in `next`.
        unsafe {
            match self.link {
                Link::Task => (*task).next_task = next,
                Link::Stat => (*task).next_stat = next,
            }
        }
    }

    fn contains(&self, task: *mut Task) -> bool {
        let mut cursor = self.head;
        while !cursor.is_null() {
            if cursor == task {
                return true;
            }
            cursor = unsafe { self.next(cursor) };
        }
        false
    }

    /// Append `task`; enqueueing a task that is already on the queue is a
    /// no-op, so racing wake paths cannot double-insert.
    fn enqueue(&mut self, task: *mut Task) {
        if task.is_null() || self.contains(task) {
            return;
        }
        unsafe { self.set_next(task, ptr::null_mut()) };
        if self.head.is_null() {
            self.head = task;
        } else {
            unsafe { self.set_next(self.tail, task) };
        }
        self.tail = task;
        self.count += 1;
    }

    fn dequeue(&mut self) -> *mut Task {
        let task = self.head;
        if task.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            self.head = self.next(task);
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            self.set_next(task, ptr::null_mut());
        }
        self.count -= 1;
        task
    }

    fn clear(&mut self) {
        while !self.dequeue().is_null() {}
    }

    #[inline]
    fn len(&self) -> u32 {
        self.count
    }
}

// =============================================================================
// Per-CPU state
// =============================================================================

pub struct PcpuLists {
    tasks: TaskQueue,
    ready: TaskQueue,
    new: TaskQueue,
    nr_pcpu_task: u32,
}

// SAFETY: the queues hold raw pointers into tasks owned by the engine; all
// access is serialized through the enclosing IrqMutex.
unsafe impl Send for PcpuLists {}

impl PcpuLists {
    const fn new() -> Self {
        Self {
            tasks: TaskQueue::new(Link::Task),
            ready: TaskQueue::new(Link::Stat),
            new: TaskQueue::new(Link::Stat),
            nr_pcpu_task: 0,
        }
    }
}

pub struct Pcpu {
    lists: IrqMutex<PcpuLists>,
    idle_task: AtomicPtr<Task>,
    current_task: AtomicPtr<Task>,
    next_task: AtomicPtr<Task>,
    need_resched: AtomicBool,
    current_prio: AtomicU8,
    next_prio: AtomicU8,
}

impl Pcpu {
    const fn new() -> Self {
        Self {
            lists: IrqMutex::new(PcpuLists::new()),
            idle_task: AtomicPtr::new(ptr::null_mut()),
            current_task: AtomicPtr::new(ptr::null_mut()),
            next_task: AtomicPtr::new(ptr::null_mut()),
            need_resched: AtomicBool::new(false),
            current_prio: AtomicU8::new(0),
            next_prio: AtomicU8::new(0),
        }
    }
}

static PCPUS: [Pcpu; MAX_CPUS] = [const { Pcpu::new() }; MAX_CPUS];

#[inline]
fn pcpu(cpu: usize) -> Option<&'static Pcpu> {
    PCPUS.get(cpu)
}

// =============================================================================
// Current / next / idle task pointers
// =============================================================================

pub fn current_task(cpu: usize) -> *mut Task {
    pcpu(cpu).map_or(ptr::null_mut(), |p| p.current_task.load(Ordering::Acquire))
}

pub fn set_current_task(cpu: usize, task: *mut Task) {
    if let Some(p) = pcpu(cpu) {
        p.current_task.store(task, Ordering::Release);
    }
}

pub fn next_task(cpu: usize) -> *mut Task {
    pcpu(cpu).map_or(ptr::null_mut(), |p| p.next_task.load(Ordering::Acquire))
}

pub fn set_next_task(cpu: usize, task: *mut Task) {
    if let Some(p) = pcpu(cpu) {
        p.next_task.store(task, Ordering::Release);
    }
}

pub fn idle_task(cpu: usize) -> *mut Task {
    pcpu(cpu).map_or(ptr::null_mut(), |p| p.idle_task.load(Ordering::Acquire))
}

pub fn set_idle_task(cpu: usize, task: *mut Task) {
    if let Some(p) = pcpu(cpu) {
        p.idle_task.store(task, Ordering::Release);
    }
}

// =============================================================================
// Resched flags & priorities
// =============================================================================

pub fn set_need_resched(cpu: usize) {
    if let Some(p) = pcpu(cpu) {
        p.need_resched.store(true, Ordering::Release);
    }
}

pub fn need_resched(cpu: usize) -> bool {
    pcpu(cpu).is_some_and(|p| p.need_resched.load(Ordering::Acquire))
}

/// Consume the flag; the scheduler backend calls this at its safe point.
pub fn take_need_resched(cpu: usize) -> bool {
    pcpu(cpu).is_some_and(|p| p.need_resched.swap(false, Ordering::AcqRel))
}

pub fn set_current_prio(cpu: usize, prio: u8) {
    if let Some(p) = pcpu(cpu) {
        p.current_prio.store(prio, Ordering::Release);
    }
}

pub fn current_prio(cpu: usize) -> u8 {
    pcpu(cpu).map_or(0, |p| p.current_prio.load(Ordering::Acquire))
}

pub fn set_next_prio(cpu: usize, prio: u8) {
    if let Some(p) = pcpu(cpu) {
        p.next_prio.store(prio, Ordering::Release);
    }
}

pub fn next_prio(cpu: usize) -> u8 {
    pcpu(cpu).map_or(0, |p| p.next_prio.load(Ordering::Acquire))
}

// =============================================================================
// Placement
// =============================================================================

/// Home a freshly constructed per-CPU task on `cpu`. Created locally it goes
/// straight onto `ready`; created from another CPU it lands on `new` and
/// waits for the owner's pickup.
pub fn attach_percpu_task(cpu: usize, task: *mut Task) {
    let Some(p) = pcpu(cpu) else {
        return;
    };
    let mut lists = p.lists.lock();
    lists.tasks.enqueue(task);
    if cpu == pcr::current_cpu_id() {
        lists.ready.enqueue(task);
    } else {
        lists.new.enqueue(task);
    }
    lists.nr_pcpu_task += 1;
}

/// Make `task` runnable on its home CPU's ready list. Idempotent.
pub fn ready_list_add(cpu: usize, task: *mut Task) {
    if let Some(p) = pcpu(cpu) {
        p.lists.lock().ready.enqueue(task);
    }
}

/// Splice the `new` list into `ready`. The owner CPU calls this on its next
/// scheduling opportunity; returns how many tasks moved.
pub fn pick_new_tasks(cpu: usize) -> u32 {
    let Some(p) = pcpu(cpu) else {
        return 0;
    };
    let mut lists = p.lists.lock();
    let mut moved = 0;
    loop {
        let task = lists.new.dequeue();
        if task.is_null() {
            break;
        }
        lists.ready.enqueue(task);
        moved += 1;
    }
    moved
}

pub fn nr_pcpu_task(cpu: usize) -> u32 {
    pcpu(cpu).map_or(0, |p| p.lists.lock().nr_pcpu_task)
}

pub fn ready_count(cpu: usize) -> u32 {
    pcpu(cpu).map_or(0, |p| p.lists.lock().ready.len())
}

pub fn new_count(cpu: usize) -> u32 {
    pcpu(cpu).map_or(0, |p| p.lists.lock().new.len())
}

pub fn ready_list_contains(cpu: usize, task: *mut Task) -> bool {
    pcpu(cpu).is_some_and(|p| p.lists.lock().ready.contains(task))
}

pub fn new_list_contains(cpu: usize, task: *mut Task) -> bool {
    pcpu(cpu).is_some_and(|p| p.lists.lock().new.contains(task))
}

pub fn task_list_contains(cpu: usize, task: *mut Task) -> bool {
    pcpu(cpu).is_some_and(|p| p.lists.lock().tasks.contains(task))
}

// =============================================================================
// Reinitialisation
// =============================================================================

/// Empty one CPU's run lists; the idle pointer survives.
pub fn clear_cpu_queues(cpu: usize) {
    let Some(p) = pcpu(cpu) else {
        return;
    };
    let mut lists = p.lists.lock();
    lists.tasks.clear();
    lists.ready.clear();
    lists.new.clear();
    lists.nr_pcpu_task = 0;
    drop(lists);
    p.current_task.store(ptr::null_mut(), Ordering::Release);
}

pub fn clear_all_cpu_queues() {
    for cpu in 0..MAX_CPUS {
        clear_cpu_queues(cpu);
    }
}

/// Full per-CPU reset, idle pointer and resched state included. Used by
/// engine reinitialisation.
pub fn reset_pcpu_state() {
    for (cpu, p) in PCPUS.iter().enumerate() {
        clear_cpu_queues(cpu);
        p.idle_task.store(ptr::null_mut(), Ordering::Release);
        p.next_task.store(ptr::null_mut(), Ordering::Release);
        p.need_resched.store(false, Ordering::Release);
        p.current_prio.store(0, Ordering::Release);
        p.next_prio.store(0, Ordering::Release);
    }
}
