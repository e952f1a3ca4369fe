//! Multiple-readers/single-writer lock with read-to-write upgrade.
//!
//! The lock is a small state machine over a `parking_lot` mutex and condition
//! variable. It models three permits:
//!
//! - **turn**: a turnstile. Readers pass through it on entry, writers hold it
//!   for their whole critical section. A queued writer therefore blocks new
//!   readers and cannot be starved by a stream of overlapping reads.
//! - **write**: the mutual exclusion token. Held by the single active writer,
//!   or on behalf of all readers while at least one reader is active.
//! - **readers**: the number of active readers. The first reader takes the
//!   write token for the group and the last one hands it back.
//!
//! An upgrade leaves the reader group before queueing on the turnstile, so two
//! readers upgrading at the same time cannot wait on each other. The upgrade is
//! not atomic: another writer may run in between, and callers must re-validate
//! whatever they observed under the read guard.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Permits {
    turn: bool,
    write: bool,
    readers: usize,
}

/// Reader/writer lock with explicit fairness turnstile and upgradeable reads.
pub struct MrswLock<T> {
    permits: Mutex<Permits>,
    released: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through guards. Shared references exist only
// while the write token is held on behalf of readers, and the exclusive
// reference only while a single writer holds it, so the usual RwLock bounds
// apply.
unsafe impl<T: Send> Send for MrswLock<T> {}
unsafe impl<T: Send + Sync> Sync for MrswLock<T> {}

impl<T> MrswLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            permits: Mutex::new(Permits::default()),
            released: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Enter a read transaction.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut permits = self.permits.lock();
        // Pass through the turnstile, then join (or open) the reader group.
        while permits.turn || (permits.readers == 0 && permits.write) {
            self.released.wait(&mut permits);
        }
        if permits.readers == 0 {
            permits.write = true;
        }
        permits.readers += 1;
        ReadGuard { lock: self }
    }

    /// Enter a write transaction.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut permits = self.permits.lock();
        while permits.turn {
            self.released.wait(&mut permits);
        }
        permits.turn = true;
        while permits.write {
            self.released.wait(&mut permits);
        }
        permits.write = true;
        WriteGuard { lock: self }
    }

    /// Whether a writer currently holds or is queued on the turnstile.
    pub fn is_writer_pending(&self) -> bool {
        self.permits.lock().turn
    }

    /// Number of active readers.
    pub fn reader_count(&self) -> usize {
        self.permits.lock().readers
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn leave_read(&self) {
        let mut permits = self.permits.lock();
        debug_assert!(permits.readers > 0, "reader count underflow");
        permits.readers -= 1;
        if permits.readers == 0 {
            permits.write = false;
            self.released.notify_all();
        }
    }

    fn leave_write(&self) {
        let mut permits = self.permits.lock();
        permits.write = false;
        permits.turn = false;
        self.released.notify_all();
    }
}

impl<T: Default> Default for MrswLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for MrswLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let permits = self.permits.lock();
        f.debug_struct("MrswLock")
            .field("turn", &permits.turn)
            .field("write", &permits.write)
            .field("readers", &permits.readers)
            .finish_non_exhaustive()
    }
}

/// Shared access for the duration of a read transaction.
#[must_use = "dropping the guard ends the read transaction"]
pub struct ReadGuard<'a, T> {
    lock: &'a MrswLock<T>,
}

impl<'a, T> ReadGuard<'a, T> {
    /// Finish this read transaction as a write transaction.
    ///
    /// Anything observed through the read guard may have changed by the time
    /// the write guard is returned.
    pub fn upgrade(self) -> WriteGuard<'a, T> {
        let lock = self.lock;
        drop(self);
        lock.write()
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the reader group holds the write token, so no exclusive
        // reference can exist while this guard is alive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.leave_read();
    }
}

/// Exclusive access for the duration of a write transaction.
#[must_use = "dropping the guard ends the write transaction"]
pub struct WriteGuard<'a, T> {
    lock: &'a MrswLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard is the sole holder of the write token.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard is the sole holder of the write token.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.leave_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, mpsc};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_readers_overlap() {
        let lock = Arc::new(MrswLock::new(7u32));
        let barrier = Arc::new(Barrier::new(3));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let guard = lock.read();
                    // Every reader must be inside before any can leave.
                    barrier.wait();
                    *guard
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(MrswLock::new(0u32));
        let inside_write = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = Arc::clone(&lock);
            let inside_write = Arc::clone(&inside_write);
            let overlaps = Arc::clone(&overlaps);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    if i % 2 == 0 {
                        let mut guard = lock.write();
                        inside_write.store(true, Ordering::SeqCst);
                        *guard += 1;
                        inside_write.store(false, Ordering::SeqCst);
                    } else {
                        let _guard = lock.read();
                        if inside_write.load(Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*lock.read(), 4 * 200);
    }

    #[test]
    fn test_queued_writer_blocks_new_readers() {
        let lock = Arc::new(MrswLock::new(Vec::<&'static str>::new()));
        let first_reader = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.write().push("writer"))
        };
        wait_until(|| lock.is_writer_pending());

        let (entered_tx, entered_rx) = mpsc::channel();
        let late_reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let guard = lock.read();
                entered_tx.send(guard.clone()).unwrap();
            })
        };

        // The late reader must queue behind the writer.
        assert!(entered_rx.recv_timeout(Duration::from_millis(50)).is_err());

        drop(first_reader);
        writer.join().unwrap();
        let observed = entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        late_reader.join().unwrap();

        assert_eq!(observed, vec!["writer"]);
    }

    #[test]
    fn test_upgrade_sees_exclusive_access() {
        let lock = MrswLock::new(1u32);
        let guard = lock.read();
        assert_eq!(*guard, 1);

        let mut guard = guard.upgrade();
        *guard = 2;
        assert_eq!(lock.reader_count(), 0);
        drop(guard);

        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn test_concurrent_upgrades_do_not_deadlock() {
        let lock = Arc::new(MrswLock::new(0u32));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let guard = lock.read();
                    barrier.wait();
                    let mut guard = guard.upgrade();
                    *guard += 1;
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 4);
    }

    fn faulty_write(lock: &MrswLock<u32>) {
        let _guard = lock.write();
        panic!("fault inside write transaction");
    }

    #[test]
    fn test_permits_released_when_writer_panics() {
        let lock = Arc::new(MrswLock::new(0u32));
        let result = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || faulty_write(&lock)).join()
        };
        assert!(result.is_err());

        assert!(!lock.is_writer_pending());
        *lock.write() += 1;
        assert_eq!(*lock.read(), 1);
    }
}
