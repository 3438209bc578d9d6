// ===============================
// src/tasks.rs
// ===============================
//
// Named task registry with one shared cancellation boundary.

use std::future::Future;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Instrument, Span};

pub struct TaskGroup {
    token: CancellationToken,
    span: Span,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new(token: CancellationToken, span: Span) -> Self {
        Self {
            token,
            span,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn under `name`, aborting a still-running task of the same name.
    /// Ignored once the group is shutting down.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.token.is_cancelled() {
            return;
        }
        let span = info_span!(parent: &self.span, "task", name = %name);
        let handle = tokio::spawn(fut.instrument(span));

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(prev) = tasks.insert(name, handle) {
            prev.abort();
        }
    }

    /// Abort one task by name. Returns whether it was still running.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(h) => {
                let running = !h.is_finished();
                h.abort();
                running
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .map_or(false, |h| !h.is_finished())
    }

    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Cancel everything and wait for it. Cancellation-induced join errors are
    /// expected; panics are logged.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let drained: Vec<(String, JoinHandle<()>)> = self.tasks.lock().drain().collect();
        for (_, h) in &drained {
            h.abort();
        }
        for (name, h) in drained {
            if let Err(e) = h.await {
                if e.is_panic() {
                    error!(task = %name, "task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn same_name_replaces_previous() {
        let group = TaskGroup::new(CancellationToken::new(), Span::none());
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            group.spawn("tick", async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_everything() {
        let group = TaskGroup::new(CancellationToken::new(), Span::none());
        group.spawn("forever", std::future::pending::<()>());
        group.spawn("other", std::future::pending::<()>());
        assert_eq!(group.running(), vec!["forever", "other"]);
        group.shutdown().await;
        assert!(group.running().is_empty());
        group.spawn("late", std::future::pending::<()>());
        assert!(!group.is_running("late"));
    }
}
