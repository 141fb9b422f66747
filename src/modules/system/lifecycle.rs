use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Long-running loops sharing one cancellation token.
pub struct BackgroundTasks {
    cancel_token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token handed to a new loop; cancelled on shutdown.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    pub fn register(&mut self, task_name: &'static str, handle: JoinHandle<()>) {
        tracing::info!("{} started", task_name);
        self.handles.push((task_name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels every loop and waits up to `timeout` for them to finish the
    /// tick they are in. Stragglers are aborted.
    pub async fn graceful_shutdown(self, timeout: Duration) {
        tracing::info!("Initiating graceful shutdown of background tasks...");
        self.cancel_token.cancel();

        let mut pending = Vec::with_capacity(self.handles.len());
        let abort_handles: Vec<_> = self
            .handles
            .iter()
            .map(|(name, handle)| (*name, handle.abort_handle()))
            .collect();
        for (name, handle) in self.handles {
            pending.push(async move { (name, handle.await) });
        }

        match tokio::time::timeout(timeout, futures::future::join_all(pending)).await {
            Ok(results) => {
                for (name, result) in results {
                    match result {
                        Ok(()) => tracing::debug!("{} completed", name),
                        Err(e) if e.is_cancelled() => tracing::info!("{} aborted", name),
                        Err(e) => tracing::warn!("{} error: {}", name, e),
                    }
                }
                tracing::info!("All background tasks stopped gracefully");
            }
            Err(_) => {
                for (name, abort) in abort_handles {
                    if !abort.is_finished() {
                        abort.abort();
                        tracing::warn!("{} force-aborted", name);
                    }
                }
                tracing::warn!(
                    "Graceful shutdown timed out after {:?}, remaining tasks were aborted",
                    timeout
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn cancelled_loops_finish_their_tick() {
        let mut tasks = BackgroundTasks::new();
        let finished = Arc::new(AtomicBool::new(false));

        let cancel = tasks.child_token();
        let flag = finished.clone();
        tasks.register(
            "test loop",
            tokio::spawn(async move {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            }),
        );
        assert_eq!(tasks.len(), 1);

        tasks.graceful_shutdown(Duration::from_secs(2)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stuck_task_is_aborted_after_timeout() {
        let mut tasks = BackgroundTasks::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.register(
            "stuck loop",
            tokio::spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            }),
        );

        tasks.graceful_shutdown(Duration::from_millis(50)).await;
        // Sender dropped by the abort.
        assert!(tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().is_err());
    }
}
