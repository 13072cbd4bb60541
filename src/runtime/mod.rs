use std::future::Future;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;

// How long stop() waits for the worker thread to acknowledge shutdown
// before detaching it.
const JOIN_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("background runtime is not running")]
    NotRunning,

    #[error("background task did not finish within {0:?}")]
    Timeout(Duration),

    #[error("failed to start background runtime: {0}")]
    Start(#[from] io::Error),
}

struct Worker {
    handle: tokio::runtime::Handle,
    stop_tx: Option<oneshot::Sender<()>>,
    exited_rx: mpsc::Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

// A single-threaded tokio runtime driven forever by one dedicated worker
// thread, so synchronous request handlers can run agent futures without each
// request owning a scheduler. Submission is thread-safe; the caller blocks
// until its task finishes or the timeout elapses.
pub struct BackgroundRuntime {
    worker: Mutex<Option<Worker>>,
}

impl BackgroundRuntime {
    pub fn new() -> Self {
        Self {
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread and its runtime. Calling this while the
    /// worker is already alive is a no-op.
    pub fn start(&self) -> Result<(), BridgeError> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(Worker::is_alive) {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("agent-bridge".to_string())
            .spawn(move || {
                // Parking on the stop signal keeps the runtime alive and
                // polling tasks spawned from other threads.
                runtime.block_on(async move {
                    let _ = stop_rx.await;
                });
                // Dropping the runtime cancels tasks that are still pending.
                drop(runtime);
                let _ = exited_tx.send(());
            })?;

        info!("background runtime started");
        *slot = Some(Worker {
            handle,
            stop_tx: Some(stop_tx),
            exited_rx,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Schedule `task` onto the background runtime and block the calling
    /// thread until it completes or `timeout` elapses. On timeout the task
    /// keeps running; its eventual result is discarded.
    pub fn submit_and_wait<F, T>(&self, task: F, timeout: Duration) -> Result<T, BridgeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = {
            let slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(worker) if worker.is_alive() => worker.handle.clone(),
                _ => return Err(BridgeError::NotRunning),
            }
        };

        let (result_tx, result_rx) = mpsc::sync_channel::<T>(1);
        handle.spawn(async move {
            let result = task.await;
            if result_tx.try_send(result).is_err() {
                debug!("discarding result of abandoned background task");
            }
        });

        match result_rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout(timeout)),
            // The runtime shut down underneath us and dropped the task.
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::NotRunning),
        }
    }

    /// Signal the worker to stop and wait for it with a bounded join.
    /// Safe to call repeatedly, or without a prior start().
    pub fn stop(&self) {
        let worker = {
            let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        let Some(mut worker) = worker else {
            return;
        };

        if let Some(stop_tx) = worker.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match worker.exited_rx.recv_timeout(JOIN_WAIT) {
            Ok(()) => {
                if let Some(thread) = worker.thread.take() {
                    if thread.join().is_err() {
                        warn!("background worker panicked during shutdown");
                    }
                }
                info!("background runtime stopped");
            }
            Err(_) => {
                warn!(
                    "background worker did not exit within {:?}, detaching it",
                    JOIN_WAIT
                );
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().is_some_and(Worker::is_alive)
    }
}

impl Default for BackgroundRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}
