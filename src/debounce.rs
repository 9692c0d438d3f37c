// Coalesce rapid writes into one after a quiet period

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::models::Work;
use crate::storage::Storage;

enum Command<T> {
    Push(T),
    Flush(oneshot::Sender<()>),
}

/// Hands the most recent pushed value to a sink once no push has arrived for
/// `window`. Intermediate values are dropped. Dropping the debouncer (or
/// calling [`Debouncer::shutdown`]) writes any pending value.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn spawn<F>(window: Duration, mut sink: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<T>>();

        let handle = tokio::spawn(async move {
            let mut pending: Option<T> = None;
            loop {
                let command = if pending.is_some() {
                    match tokio::time::timeout(window, rx.recv()).await {
                        Ok(command) => command,
                        Err(_) => {
                            if let Some(value) = pending.take() {
                                sink(value);
                            }
                            continue;
                        }
                    }
                } else {
                    rx.recv().await
                };

                match command {
                    Some(Command::Push(value)) => pending = Some(value),
                    Some(Command::Flush(done)) => {
                        if let Some(value) = pending.take() {
                            sink(value);
                        }
                        let _ = done.send(());
                    }
                    None => {
                        if let Some(value) = pending.take() {
                            sink(value);
                        }
                        break;
                    }
                }
            }
        });

        Self { tx, handle }
    }

    /// Replace the pending value and restart the quiet period.
    pub fn push(&self, value: T) {
        let _ = self.tx.send(Command::Push(value));
    }

    /// Write the pending value now instead of waiting out the window.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Write anything pending and wait for the background task to end.
    pub async fn shutdown(self) {
        let Self { tx, handle } = self;
        drop(tx);
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "debounce task ended abnormally");
        }
    }
}

/// Debounced autosave of a work's chapters.
pub fn work_autosaver(storage: Storage, window: Duration) -> Debouncer<Work> {
    Debouncer::spawn(window, move |work: Work| match storage.update_work(&work) {
        Ok(()) => tracing::info!(work_id = work.id, "autosaved work"),
        Err(e) => tracing::warn!(work_id = work.id, error = %e, "autosave failed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapters::Chapter;
    use crate::models::NewWork;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn recording<T: Send + 'static>(window: Duration) -> (Debouncer<T>, Arc<Mutex<Vec<T>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let log = written.clone();
        let debouncer = Debouncer::spawn(window, move |value| log.lock().unwrap().push(value));
        (debouncer, written)
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_value_written_after_quiet_period() {
        let (debouncer, written) = recording(Duration::from_secs(2));

        debouncer.push(1);
        sleep(Duration::from_millis(500)).await;
        debouncer.push(2);
        sleep(Duration::from_millis(1500)).await;
        assert!(written.lock().unwrap().is_empty());

        sleep(Duration::from_millis(600)).await;
        assert_eq!(*written.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_each_write() {
        let (debouncer, written) = recording(Duration::from_secs(1));

        debouncer.push("a");
        sleep(Duration::from_secs(2)).await;
        debouncer.push("b");
        debouncer.push("c");
        sleep(Duration::from_secs(2)).await;

        assert_eq!(*written.lock().unwrap(), vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately() {
        let (debouncer, written) = recording(Duration::from_secs(60));
        debouncer.push(7);
        debouncer.flush().await;
        assert_eq!(*written.lock().unwrap(), vec![7]);

        // nothing pending, flush is a no-op
        debouncer.flush().await;
        assert_eq!(written.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_writes_pending_value() {
        let (debouncer, written) = recording(Duration::from_secs(60));
        debouncer.push(3);
        debouncer.shutdown().await;
        assert_eq!(*written.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_work_autosaver_persists_latest_chapters() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::at(temp.path()).unwrap();
        let mut work = storage.add_work(NewWork::novel("自动保存")).unwrap();

        let autosaver = work_autosaver(storage.clone(), Duration::from_millis(20));
        work.set_chapters(&[Chapter::new("第一章", "草稿")]).unwrap();
        autosaver.push(work.clone());
        work.set_chapters(&[Chapter::new("第一章", "定稿")]).unwrap();
        autosaver.push(work.clone());
        autosaver.shutdown().await;

        let saved = storage.get_work(work.id).unwrap().unwrap();
        assert_eq!(saved.chapters(), vec![Chapter::new("第一章", "定稿")]);
    }
}
