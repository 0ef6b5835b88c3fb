// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! The Mutex/Condvar type in this crate wraps the standard library versions and mirrors the same
//! methods, except that they panic where the standard library would return an Error. This API
//! codifies our error handling strategy around poisoned mutexes in crosvm-style code:
//!
//! - Releasing a lock on panic is fine because the process is already headed for death.
//! - Unwinding into a poisoned lock is a bug, so crashing loudly at the lock site is preferable to
//!   propagating a `PoisonError` nobody can meaningfully handle.

use std::fmt::Debug;
use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::WaitTimeoutResult;
use std::time::Duration;

/// A Mutex wrapper whose `lock()` does not return a `Result`.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    lock: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            lock: StdMutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.lock.into_inner().unwrap()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("mutex is poisoned"),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self.lock.get_mut() {
            Ok(value) => value,
            Err(_) => panic!("mutex is poisoned"),
        }
    }
}

impl<T: ?Sized + Debug> Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.lock.fmt(f)
    }
}

/// A Condvar wrapper whose methods do not return `Result`.
#[derive(Default)]
pub struct Condvar {
    cond: StdCondvar,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            cond: StdCondvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        match self.cond.wait(guard) {
            Ok(guard) => guard,
            Err(_) => panic!("condvar is poisoned"),
        }
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        match self.cond.wait_timeout(guard, timeout) {
            Ok(result) => result,
            Err(_) => panic!("condvar is poisoned"),
        }
    }

    pub fn notify_one(&self) {
        self.cond.notify_one()
    }

    pub fn notify_all(&self) {
        self.cond.notify_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_lock_and_mutate() {
        let m = Mutex::new(5u32);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn mutex_into_inner() {
        let m = Mutex::new(vec![1, 2, 3]);
        assert_eq!(m.into_inner(), vec![1, 2, 3]);
    }
}
