//! CPU registry and architecture dispatch seams.
//!
//! The engine never talks to hardware directly. Everything that depends on
//! the platform (which CPU is executing, how to raise an IPI, how to mask
//! interrupts) funnels through a **registered function pointer**. The arch
//! layer installs the real implementations during bring-up; until then the
//! defaults are inert (CPU 0, no-op IPIs, no-op interrupt control), which is
//! also what host-side tests rely on.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub use hypos_abi::task::MAX_CPUS;

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);
static ONLINE_MASK: AtomicUsize = AtomicUsize::new(1);

/// Record the number of CPUs present. Clamped to `MAX_CPUS`.
pub fn set_cpu_count(count: usize) {
    let count = count.clamp(1, MAX_CPUS);
    CPU_COUNT.store(count, Ordering::Release);
}

#[inline]
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

pub fn mark_cpu_online(cpu: usize) {
    if cpu < MAX_CPUS {
        ONLINE_MASK.fetch_or(1 << cpu, Ordering::AcqRel);
    }
}

pub fn mark_cpu_offline(cpu: usize) {
    if cpu < MAX_CPUS {
        ONLINE_MASK.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }
}

#[inline]
pub fn is_cpu_online(cpu: usize) -> bool {
    cpu < MAX_CPUS && ONLINE_MASK.load(Ordering::Acquire) & (1 << cpu) != 0
}

// ---------------------------------------------------------------------------
// Current-CPU lookup
// ---------------------------------------------------------------------------

pub type CurrentCpuFn = fn() -> usize;

static CURRENT_CPU_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install the platform's current-CPU reader (e.g. a GS-based lookup).
pub fn register_current_cpu_fn(f: CurrentCpuFn) {
    CURRENT_CPU_FN.store(f as *mut (), Ordering::Release);
}

/// Index of the executing CPU. Before registration this is always 0, which
/// matches the boot processor running alone.
#[inline]
pub fn current_cpu_id() -> usize {
    let fn_ptr = CURRENT_CPU_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return 0;
    }
    // SAFETY: only `register_current_cpu_fn` stores into this slot, and it
    // stores a valid `CurrentCpuFn`.
    let f: CurrentCpuFn = unsafe { core::mem::transmute(fn_ptr) };
    f()
}

// ---------------------------------------------------------------------------
// IPI transmission
// ---------------------------------------------------------------------------

/// Raises an IPI on the CPU given by index.
pub type IpiFn = fn(usize);

static RESCHED_IPI_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static FUNCTION_CALL_IPI_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

pub fn register_resched_ipi_fn(f: IpiFn) {
    RESCHED_IPI_FN.store(f as *mut (), Ordering::Release);
}

pub fn register_function_call_ipi_fn(f: IpiFn) {
    FUNCTION_CALL_IPI_FN.store(f as *mut (), Ordering::Release);
}

fn dispatch_ipi(slot: &AtomicPtr<()>, target_cpu: usize) {
    let fn_ptr = slot.load(Ordering::Acquire);
    if !fn_ptr.is_null() {
        // SAFETY: the slot only ever holds a valid `IpiFn`.
        let f: IpiFn = unsafe { core::mem::transmute(fn_ptr) };
        f(target_cpu);
    }
}

/// Kick `target_cpu` into its reschedule vector.
pub fn send_resched_ipi(target_cpu: usize) {
    dispatch_ipi(&RESCHED_IPI_FN, target_cpu);
}

/// Kick `target_cpu` into its function-call vector; the handler there drains
/// the CPU's call mailbox via `smp::smp_process_function_calls`.
pub fn send_function_call_ipi(target_cpu: usize) {
    dispatch_ipi(&FUNCTION_CALL_IPI_FN, target_cpu);
}

// ---------------------------------------------------------------------------
// Interrupt flag control
// ---------------------------------------------------------------------------

pub type IrqSaveFn = fn() -> usize;
pub type IrqRestoreFn = fn(usize);

static IRQ_SAVE_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static IRQ_RESTORE_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install the platform's interrupt mask/restore pair. `save` disables
/// interrupts and returns the previous flags; `restore` reinstates them.
pub fn register_irq_ops(save: IrqSaveFn, restore: IrqRestoreFn) {
    IRQ_SAVE_FN.store(save as *mut (), Ordering::Release);
    IRQ_RESTORE_FN.store(restore as *mut (), Ordering::Release);
}

#[inline]
pub(crate) fn irq_save() -> usize {
    let fn_ptr = IRQ_SAVE_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return 0;
    }
    // SAFETY: the slot only ever holds a valid `IrqSaveFn`.
    let f: IrqSaveFn = unsafe { core::mem::transmute(fn_ptr) };
    f()
}

#[inline]
pub(crate) fn irq_restore(flags: usize) {
    let fn_ptr = IRQ_RESTORE_FN.load(Ordering::Acquire);
    if !fn_ptr.is_null() {
        // SAFETY: the slot only ever holds a valid `IrqRestoreFn`.
        let f: IrqRestoreFn = unsafe { core::mem::transmute(fn_ptr) };
        f(flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_mask_tracks_marks() {
        let _serial = crate::test_support::lock();
        mark_cpu_online(3);
        assert!(is_cpu_online(3));
        mark_cpu_offline(3);
        assert!(!is_cpu_online(3));
        assert!(!is_cpu_online(MAX_CPUS));
    }

    #[test]
    fn cpu_count_is_clamped() {
        let _serial = crate::test_support::lock();
        set_cpu_count(MAX_CPUS + 10);
        assert_eq!(cpu_count(), MAX_CPUS);
        set_cpu_count(0);
        assert_eq!(cpu_count(), 1);
        set_cpu_count(1);
    }
}
