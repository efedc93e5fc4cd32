use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// NB: poisoned locks are recovered - no critical section leaves its data inconsistent
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// waits until a boolean stop / shutdown signal is raised
pub(crate) async fn signalled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|&raised| raised).await.is_err() {
        // the signal can not be raised any more
        std::future::pending::<()>().await;
    }
}
