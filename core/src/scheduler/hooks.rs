//! Registration points around task construction.
//!
//! Higher layers attach per-task plug-in state (module initialisers) and
//! creation notifications here; the architecture backend registers the
//! routine that lays down the initial register frame. All three follow the
//! function-pointer registration idiom used across the kernel; the engine
//! itself has no compile-time knowledge of its clients.

use hypos_lib::IrqMutex;
use spin::Once;

use super::task_struct::Task;

pub type TaskHook = fn(*mut Task);

const MAX_TASK_HOOKS: usize = 8;

struct HookSet {
    hooks: [Option<TaskHook>; MAX_TASK_HOOKS],
    count: usize,
}

impl HookSet {
    const fn new() -> Self {
        Self {
            hooks: [None; MAX_TASK_HOOKS],
            count: 0,
        }
    }

    fn register(&mut self, hook: TaskHook) -> bool {
        if self.count == MAX_TASK_HOOKS {
            return false;
        }
        self.hooks[self.count] = Some(hook);
        self.count += 1;
        true
    }

    fn snapshot(&self) -> [Option<TaskHook>; MAX_TASK_HOOKS] {
        self.hooks
    }
}

static MODULE_INIT_HOOKS: IrqMutex<HookSet> = IrqMutex::new(HookSet::new());
static CREATE_HOOKS: IrqMutex<HookSet> = IrqMutex::new(HookSet::new());

fn run_hooks(set: &IrqMutex<HookSet>, task: *mut Task) {
    // Copy the registrations out first; hooks run without the registry lock
    // so they are free to create tasks themselves.
    let hooks = set.lock().snapshot();
    for hook in hooks.iter().flatten() {
        hook(task);
    }
}

/// Attach a per-task module-state initialiser, run during construction for
/// every task (the idle tasks included).
pub fn register_task_module_init(hook: TaskHook) -> bool {
    MODULE_INIT_HOOKS.lock().register(hook)
}

pub(crate) fn run_task_module_inits(task: *mut Task) {
    run_hooks(&MODULE_INIT_HOOKS, task);
}

/// Attach a notification hook, run once a task is fully constructed.
pub fn register_task_create_hook(hook: TaskHook) -> bool {
    CREATE_HOOKS.lock().register(hook)
}

pub(crate) fn run_task_create_hooks(task: *mut Task) {
    run_hooks(&CREATE_HOOKS, task);
}

/// Drop every registered module-init and create hook. Reinitialisation only.
pub fn reset_task_hooks() {
    *MODULE_INIT_HOOKS.lock() = HookSet::new();
    *CREATE_HOOKS.lock() = HookSet::new();
}

// =============================================================================
// Architecture backend seam
// =============================================================================

static ARCH_TASK_INIT: Once<TaskHook> = Once::new();

/// Install the architecture routine that builds a task's initial register
/// frame on its stack from `entry`/`udata`. Registered once at bring-up.
pub fn register_arch_task_init(hook: TaskHook) {
    ARCH_TASK_INIT.call_once(|| hook);
}

pub(crate) fn arch_init_task(task: *mut Task) {
    if let Some(hook) = ARCH_TASK_INIT.get() {
        hook(task);
    }
}
