//! Interrupt-safe spinlocks.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, Ordering};

use crate::pcr;
use crate::preempt::PreemptGuard;

/// Mutex that disables interrupts AND preemption while held.
/// Required for state touched from both normal and interrupt context.
///
/// Uses a **ticket lock** internally for FIFO fairness: each acquirer takes a
/// monotonically-increasing ticket and spins until `now_serving` matches, so
/// CPUs acquire the lock in request order and none starves under contention.
///
/// Interrupt masking goes through the ops installed with
/// [`pcr::register_irq_ops`]; before the arch layer registers them the lock
/// degrades to a plain ticket lock.
pub struct IrqMutex<T> {
    /// Ticket counter. `lock()` takes the next ticket via `fetch_add(1)`.
    /// Wraps at `u16::MAX`; equality checks handle wrap-around.
    next_ticket: AtomicU16,
    /// Ticket currently being served. Incremented on unlock.
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex hands out exclusive access through ticket acquisition with
// interrupts and preemption disabled, making it safe to share across contexts.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_flags: usize,
    _preempt: PreemptGuard,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Check if the lock is currently held (or has waiters).
    #[inline]
    pub fn is_locked(&self) -> bool {
        let next = self.next_ticket.load(Ordering::Relaxed);
        let serving = self.now_serving.load(Ordering::Relaxed);
        next != serving
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let preempt = PreemptGuard::new();
        let saved_flags = pcr::irq_save();

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Spin until our ticket is being served. The Acquire read makes the
        // previous holder's writes visible once our ticket comes up.
        // Proportional backoff: one PAUSE per ticket of distance, capped,
        // keeps queued CPUs off the cache line.
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            let distance = my_ticket.wrapping_sub(serving) as u32;
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }

        IrqMutexGuard {
            mutex: self,
            saved_flags,
            _preempt: preempt,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let preempt = PreemptGuard::new();
        let saved_flags = pcr::irq_save();

        // Succeed only if the lock is free (next_ticket == now_serving).
        // If someone grabbed a ticket in the meantime the CAS fails and we
        // bail out without waiting.
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                saved_flags,
                _preempt: preempt,
            })
        } else {
            pcr::irq_restore(saved_flags);
            drop(preempt);
            None
        }
    }

    /// Release the lock without a guard.
    ///
    /// # Safety
    /// Only valid when the holding guard was leaked and no code is still
    /// inside the critical section. The protected data must be consistent.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        self.now_serving
            .store(self.next_ticket.load(Ordering::Relaxed), Ordering::Release);
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Hand the lock to the next waiter in FIFO order; Release ordering
        // publishes our writes to the next acquirer.
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        pcr::irq_restore(self.saved_flags);
        // _preempt drops after this
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trip() {
        let _serial = crate::test_support::lock();
        let mutex = IrqMutex::new(5u32);
        {
            let mut guard = mutex.lock();
            assert!(mutex.is_locked());
            *guard += 1;
        }
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let _serial = crate::test_support::lock();
        let mutex = IrqMutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }
}
