use std::sync::Arc;

use tokio::sync::watch;

/// Counted join for detached tasks: each task holds a [`WorkGuard`] and [`WorkGroup::wait`]
/// resolves once none are outstanding.
#[derive(Debug, Clone)]
pub struct WorkGroup {
    pending: Arc<watch::Sender<usize>>,
}

impl Default for WorkGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkGroup {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            pending: Arc::new(tx),
        }
    }

    pub fn enter(&self) -> WorkGuard {
        self.pending.send_modify(|n| *n += 1);
        WorkGuard {
            pending: Arc::clone(&self.pending),
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Leaves the group on drop, including when the task panics or is aborted.
#[derive(Debug)]
pub struct WorkGuard {
    pending: Arc<watch::Sender<usize>>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}
