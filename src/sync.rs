use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set lock guarding `T`.
///
/// Critical sections behind it are a handful of list operations and, rarely,
/// a page provider call, so busy waiting beats parking the thread.
pub(crate) struct SpinLock<T> {
  locked: AtomicBool,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
  pub(crate) const fn new(value: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

pub(crate) struct SpinGuard<'a, T> {
  lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.lock.value.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.lock.value.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  fn drop(&mut self) {
    self.lock.unlock();
  }
}

#[cfg(test)]
mod tests {
  use super::SpinLock;
  use std::thread;

  #[test]
  fn guards_counter_across_threads() {
    let lock = SpinLock::new(0usize);

    thread::scope(|s| {
      for _ in 0..8 {
        s.spawn(|| {
          for _ in 0..10_000 {
            *lock.lock() += 1;
          }
        });
      }
    });

    assert_eq!(*lock.lock(), 80_000);
  }
}
