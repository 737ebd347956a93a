//! Cross-CPU function calls.
//!
//! Each CPU owns a fixed mailbox of pending calls. A sender enqueues the
//! function and argument into the target's mailbox, raises the function-call
//! IPI, and optionally spins until the target has executed the call. The
//! target's IPI vector drains its mailbox via [`smp_process_function_calls`].
//!
//! The mailboxes are fixed arenas so that calls can be posted from interrupt
//! context without touching an allocator.

use core::ffi::c_void;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::pcr;
use crate::spinlock::IrqMutex;

pub type SmpCallFn = fn(*mut c_void);

/// Pending calls per CPU. Senders that find the mailbox full get an error and
/// must retry; the engine's own traffic stays far below this.
const NR_SMP_CALLS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmpCallError {
    BadCpu,
    QueueFull,
}

#[derive(Clone, Copy)]
struct SmpCall {
    func: SmpCallFn,
    data: *mut c_void,
    /// Completion flag on the waiting sender's stack; null for fire-and-forget.
    done: *const AtomicBool,
}

struct CallQueue {
    slots: [Option<SmpCall>; NR_SMP_CALLS],
}

// SAFETY: the raw pointers in a queued call are owned by the sender until the
// call executes; all queue access is serialized through the IrqMutex.
unsafe impl Send for CallQueue {}

impl CallQueue {
    const fn new() -> Self {
        Self {
            slots: [None; NR_SMP_CALLS],
        }
    }

    fn push(&mut self, call: SmpCall) -> Result<(), SmpCallError> {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(call);
                return Ok(());
            }
        }
        Err(SmpCallError::QueueFull)
    }

    fn pop(&mut self) -> Option<SmpCall> {
        for slot in self.slots.iter_mut() {
            if slot.is_some() {
                return slot.take();
            }
        }
        None
    }
}

static CALL_QUEUES: [IrqMutex<CallQueue>; pcr::MAX_CPUS] =
    [const { IrqMutex::new(CallQueue::new()) }; pcr::MAX_CPUS];

/// Run `func(data)` on `target_cpu`.
///
/// A call aimed at the executing CPU runs inline. Otherwise the call is
/// mailed to the target and the function-call IPI is raised; with `wait` the
/// sender spins until the target has executed it, so `wait` must not be used
/// before the IPI path is wired up.
pub fn smp_function_call(
    target_cpu: usize,
    func: SmpCallFn,
    data: *mut c_void,
    wait: bool,
) -> Result<(), SmpCallError> {
    if target_cpu >= pcr::cpu_count() {
        return Err(SmpCallError::BadCpu);
    }

    if target_cpu == pcr::current_cpu_id() {
        func(data);
        return Ok(());
    }

    let done = AtomicBool::new(false);
    let call = SmpCall {
        func,
        data,
        done: if wait { &done } else { core::ptr::null() },
    };

    CALL_QUEUES[target_cpu].lock().push(call)?;
    pcr::send_function_call_ipi(target_cpu);

    if wait {
        while !done.load(Ordering::Acquire) {
            spin_loop();
        }
    }

    Ok(())
}

/// Drain the executing CPU's mailbox. Called from the function-call IPI
/// vector. The mailbox lock is dropped around each call so that handlers can
/// post further calls.
pub fn smp_process_function_calls() {
    let cpu = pcr::current_cpu_id();

    loop {
        let call = CALL_QUEUES[cpu].lock().pop();
        let Some(call) = call else {
            break;
        };

        (call.func)(call.data);

        if !call.done.is_null() {
            // SAFETY: a non-null `done` points at the sender's stack flag,
            // which stays alive until we set it (the sender is spinning).
            unsafe { (*call.done).store(true, Ordering::Release) };
        }
    }
}

/// Drop every queued call on every CPU. Used when a CPU goes away mid-flight
/// and by reinitialisation paths; waiting senders are released as completed.
pub fn clear_pending_calls() {
    for queue in CALL_QUEUES.iter() {
        loop {
            let call = queue.lock().pop();
            let Some(call) = call else {
                break;
            };
            if !call.done.is_null() {
                // SAFETY: same lifetime contract as in the drain path.
                unsafe { (*call.done).store(true, Ordering::Release) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    static HITS: AtomicU32 = AtomicU32::new(0);

    fn bump(_data: *mut c_void) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn local_call_runs_inline() {
        let _serial = crate::test_support::lock();
        let before = HITS.load(Ordering::SeqCst);
        smp_function_call(pcr::current_cpu_id(), bump, core::ptr::null_mut(), false).unwrap();
        assert!(HITS.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn bad_cpu_is_rejected() {
        let _serial = crate::test_support::lock();
        let err = smp_function_call(pcr::MAX_CPUS, bump, core::ptr::null_mut(), false);
        assert_eq!(err, Err(SmpCallError::BadCpu));
    }
}
