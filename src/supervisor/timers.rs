//! Epoch-scoped background tasks owned by the supervisor.
//!
//! Every timer, poll loop and launch runs as its own tokio task keyed by
//! [`TaskKind`]. Scheduling a kind replaces (and aborts) the previous task
//! of that kind; dropping the set aborts everything.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    LoadTimeout,
    ReadyGrace,
    Relaunch,
    Launch,
    Poll,
    PresentationWatch,
}

#[derive(Default)]
pub struct Tasks {
    running: HashMap<TaskKind, JoinHandle<()>>,
}

impl Tasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, kind: TaskKind, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.running.insert(kind, tokio::spawn(future)) {
            previous.abort();
        }
    }

    /// Runs `then` once `delay` has elapsed, unless cancelled first.
    pub fn spawn_after<F>(&mut self, kind: TaskKind, delay: Duration, then: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(kind, async move {
            tokio::time::sleep(delay).await;
            then.await;
        });
    }

    pub fn cancel(&mut self, kind: TaskKind) {
        if let Some(handle) = self.running.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, kind: TaskKind) -> bool {
        self.running
            .get(&kind)
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn bump(counter: &Arc<AtomicU32>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut tasks = Tasks::new();
        tasks.spawn_after(TaskKind::LoadTimeout, Duration::from_secs(10), bump(&fired));

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut tasks = Tasks::new();
        tasks.spawn_after(TaskKind::ReadyGrace, Duration::from_millis(200), bump(&fired));
        assert!(tasks.is_pending(TaskKind::ReadyGrace));
        tasks.cancel(TaskKind::ReadyGrace);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!tasks.is_pending(TaskKind::ReadyGrace));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_previous() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut tasks = Tasks::new();
        tasks.spawn_after(TaskKind::Relaunch, Duration::from_millis(100), bump(&fired));
        tasks.spawn_after(TaskKind::Relaunch, Duration::from_millis(300), bump(&fired));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_everything() {
        let fired = Arc::new(AtomicU32::new(0));
        {
            let mut tasks = Tasks::new();
            tasks.spawn_after(TaskKind::LoadTimeout, Duration::from_millis(10), bump(&fired));
            tasks.spawn_after(TaskKind::Poll, Duration::from_millis(10), bump(&fired));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
