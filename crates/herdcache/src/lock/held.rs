//! Per-task record of held leases.
//!
//! A task that holds `lock:k` and then asks for `lock:k` again would poll
//! against itself until the acquisition window closes. The set of lock keys
//! held by the running task is kept in a task-local so the provider can fail
//! such requests immediately. Tasks spawned from inside the scope do not
//! inherit it.

use std::collections::HashSet;
use std::future::Future;

tokio::task_local! {
    static HELD_LEASES: HashSet<String>;
}

/// Check if the current task is running under a lease on `lock_key`.
pub fn is_held_by_current_task(lock_key: &str) -> bool {
    HELD_LEASES
        .try_with(|held| held.contains(lock_key))
        .unwrap_or(false)
}

/// Run `fut` with `lock_key` added to the current task's held set.
pub(crate) async fn holding<F: Future>(lock_key: &str, fut: F) -> F::Output {
    let mut held = HELD_LEASES.try_with(|h| h.clone()).unwrap_or_default();
    held.insert(lock_key.to_string());
    HELD_LEASES.scope(held, fut).await
}
