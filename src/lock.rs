use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A token proving the lock is held. Dropping it releases the lock.
pub struct LockToken {
    _guard: OwnedMutexGuard<()>,
}

/// Async mutual exclusion guarding mutation of shared registry state.
/// Registration and unregistration sequences triggered by independent
/// async events run under this lock so they never interleave into an
/// inconsistent list.
#[derive(Clone, Debug, Default)]
pub struct ObjectLock {
    inner: Arc<Mutex<()>>,
}

impl ObjectLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub async fn lock(&self) -> LockToken {
        LockToken {
            _guard: self.inner.clone().lock_owned().await,
        }
    }

    pub fn unlock(&self, token: LockToken) {
        drop(token);
    }

    /// Acquire, run `f`, and release — the release happens on every exit
    /// path, early returns and panics included.
    pub async fn run_locked<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _token = self.lock().await;
        f().await
    }
}
