//! Lock / transaction composition.
//!
//! A lock taken inside a transaction must be released exactly once no
//! matter how the transaction ends. `tx_wlock` acquires and schedules
//! the release for abort; `tx_unlock_on_commit` schedules it for
//! commit. The abort stack runs LIFO and the commit stack FIFO, so a
//! transaction that enlisted several locks releases them in reverse
//! acquisition order on abort.
//!
//! The guards returned by the inode layer keep using the lock while it
//! is "forgotten" here; see `InodeWriteGuard`.

use core::mem;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::obj::Tx;

/// Write-acquire `lock` and schedule its release on transaction abort.
pub fn rwlock_tx_wlock<T: 'static>(tx: &Tx<'_>, lock: &Arc<RwLock<T>>) {
    let guard = lock.write();
    mem::forget(guard);
    let lock = Arc::clone(lock);
    tx.on_abort(move || {
        // SAFETY: the matching write acquisition was forgotten above
        // and no guard for it exists anymore.
        unsafe { lock.force_unlock_write() };
    });
}

/// Schedule the release of a write-held `lock` on transaction commit.
pub fn rwlock_tx_unlock_on_commit<T: 'static>(tx: &Tx<'_>, lock: &Arc<RwLock<T>>) {
    let lock = Arc::clone(lock);
    tx.on_commit(move || {
        // SAFETY: the caller holds the write side without a live guard.
        unsafe { lock.force_unlock_write() };
    });
}

/// Acquire a pool-scoped mutex and schedule its release on abort.
pub fn mutex_tx_lock<T: 'static>(tx: &Tx<'_>, mutex: &Arc<Mutex<T>>) {
    let guard = mutex.lock();
    mem::forget(guard);
    let mutex = Arc::clone(mutex);
    tx.on_abort(move || {
        // SAFETY: the matching acquisition was forgotten above.
        unsafe { mutex.force_unlock() };
    });
}

/// Schedule the release of a held pool-scoped mutex on commit.
pub fn mutex_tx_unlock_on_commit<T: 'static>(tx: &Tx<'_>, mutex: &Arc<Mutex<T>>) {
    let mutex = Arc::clone(mutex);
    tx.on_commit(move || {
        // SAFETY: the caller holds the mutex without a live guard.
        unsafe { mutex.force_unlock() };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::ObjStore;

    #[test]
    fn abort_releases_enlisted_rwlock() {
        let store = ObjStore::create(1 << 20);
        let lock = Arc::new(RwLock::new(0u32));

        let tx = store.tx_begin();
        rwlock_tx_wlock(&tx, &lock);
        assert!(lock.try_read().is_none(), "write-held inside the tx");
        drop(tx); // abort

        assert!(lock.try_write().is_some(), "released exactly once");
    }

    #[test]
    fn commit_releases_enlisted_rwlock() {
        let store = ObjStore::create(1 << 20);
        let lock = Arc::new(RwLock::new(0u32));

        let tx = store.tx_begin();
        rwlock_tx_wlock(&tx, &lock);
        rwlock_tx_unlock_on_commit(&tx, &lock);
        tx.commit();

        assert!(lock.try_write().is_some());
    }

    #[test]
    fn mutex_follows_the_same_discipline() {
        let store = ObjStore::create(1 << 20);
        let mtx = Arc::new(Mutex::new(()));

        let tx = store.tx_begin();
        mutex_tx_lock(&tx, &mtx);
        assert!(mtx.try_lock().is_none());
        drop(tx);
        assert!(mtx.try_lock().is_some());

        let tx = store.tx_begin();
        mutex_tx_lock(&tx, &mtx);
        mutex_tx_unlock_on_commit(&tx, &mtx);
        tx.commit();
        assert!(mtx.try_lock().is_some());
    }
}
