use core::cell::UnsafeCell;

use crate::proc::{self, Channel, Pid, current_proc};
use crate::spinlock::SpinLock;

/// Lock state, guarded by a spinlock.
#[derive(Debug)]
struct SleepLockInner {
    locked: bool,
    pid: Option<Pid>,
}

/// A lock that puts the caller to sleep while waiting.
/// Unlike a spinlock, interrupts stay enabled while a sleep lock is held,
/// so it can be held across disk I/O.
#[derive(Debug)]
pub struct SleepLock<T> {
    _name: &'static str,
    /// protects the lock state, not the data
    inner: SpinLock<SleepLockInner>,
    data: UnsafeCell<T>,
}

/// A guard that releases the sleep lock when dropped.
#[derive(Debug)]
pub struct SleepLockGuard<'a, T: 'a> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SleepLock {
            _name: name,
            inner: SpinLock::new(
                SleepLockInner {
                    locked: false,
                    pid: None,
                },
                name,
            ),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if the current process holds the lock.
    pub fn holding(&self) -> bool {
        let inner = self.inner.lock();

        inner.locked && (inner.pid == Some(current_proc().inner.lock().pid))
    }

    /// Acquires the lock, sleeping until it is free.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut inner = self.inner.lock();

        while inner.locked {
            inner = proc::sleep(Channel::Lock(self as *const _ as usize), inner);
        }

        inner.locked = true;
        inner.pid = Some(current_proc().inner.lock().pid);

        SleepLockGuard { lock: self }
    }

    /// Consumes the lock and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns the inner data without taking the lock.
    ///
    /// # Safety
    /// The caller must ensure nothing else can hold or take the lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: 'a> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.lock.inner.lock();
        inner.locked = false;
        inner.pid = None;

        // wake up any waiters before dropping the spinlock
        proc::wakeup(Channel::Lock(self.lock as *const _ as usize));
    }
}

impl<T> core::ops::Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// # Safety
/// The lock hands out `&mut T` to whichever process acquires it, so `T`
/// must be `Send` for the lock to be shared.
unsafe impl<T> Sync for SleepLock<T> where T: Send {}

/// # Safety
/// Sending the lock also transfers ownership of the inner data.
unsafe impl<T> Send for SleepLock<T> where T: Send {}
