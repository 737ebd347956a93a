#![no_std]

#[cfg(test)]
extern crate std;

// Tests that touch process-wide state (CPU registry, preemption counters,
// call mailboxes) serialize on this lock; cargo runs tests concurrently.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub mod alignment;
pub mod bitmap;
pub mod init_flag;
pub mod klog;
pub mod pcr;
pub mod preempt;
pub mod smp;
pub mod spinlock;
pub mod string;

pub use alignment::{align_down_usize, align_up_usize};
pub use bitmap::Bitmap;
pub use init_flag::InitFlag;
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use pcr::{
    MAX_CPUS, cpu_count, current_cpu_id, is_cpu_online, mark_cpu_offline, mark_cpu_online,
    register_current_cpu_fn, register_function_call_ipi_fn, register_irq_ops,
    register_resched_ipi_fn, send_function_call_ipi, send_resched_ipi, set_cpu_count,
};
pub use preempt::{PreemptGuard, is_preemption_disabled, preempt_count};
pub use smp::{SmpCallError, smp_function_call, smp_process_function_calls};
pub use spinlock::{IrqMutex, IrqMutexGuard};
pub use string::{bytes_as_str, copy_name};
