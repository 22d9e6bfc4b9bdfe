use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{Cpu, InterruptLock, current_cpu, lock_current_cpu};

/// Mutual exclusion spin lock.
///
/// The lock records the owning CPU; it is held exactly when `cpu` is
/// non-null. Interrupts are disabled for as long as any spinlock is held on
/// a CPU (see `Cpu::lock`/`Cpu::unlock`), which keeps the interrupt handler
/// from deadlocking against the code it interrupted.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

/// # Safety
/// The inner data can only be reached through a guard or an exclusive
/// reference, so sharing the lock is safe whenever `T` can be sent.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

/// A guard that releases the lock (and the CPU's interrupt hold) on drop.
#[derive(Debug)]
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

/// # Safety
/// Only one thread can hold a guard at a time.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if this CPU holds the lock.
    ///
    /// # Safety
    /// Must be called with interrupts disabled.
    pub unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { current_cpu() as *mut Cpu }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let _intr_lock = lock_current_cpu();

        unsafe {
            assert!(!self.holding(), "acquire {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        current_cpu() as *mut Cpu,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Releases the lock by consuming the guard and hands back the lock
    /// itself so the caller can re-acquire later (see `proc::sleep`).
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Releases the lock without going through a guard.
    ///
    /// # Safety
    /// The caller must hold the lock through a guard it cannot reach (the
    /// one the scheduler keeps across `swtch` into a new process).
    pub unsafe fn force_unlock(&self) {
        unsafe {
            assert!(self.holding(), "force unlock {}", self.name);
            self.cpu.store(ptr::null_mut(), Ordering::Release);
            current_cpu().unlock();
        }
    }

    /// Consumes the lock; no guard can be outstanding.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Exclusive borrow of the lock gives exclusive access to the data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Use this over `get_mut` when rules must be broken (panic paths,
    /// debug dumps).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: the guard carries an interrupt hold, so holding is stable
        unsafe {
            assert!(self.lock.holding(), "release {}", self.lock.name);
        }

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
        // _intr_lock drop re-enables interrupts if this was the last hold
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
