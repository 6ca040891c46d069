use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A background queue that runs jobs one after another, in the order they were enqueued.
///
/// Every queue owns a dedicated thread, so jobs are free to do blocking file system I/O. The
/// thread shuts down once the last handle to the queue is dropped and all pending jobs ran.
#[derive(Debug, Clone)]
pub(crate) struct SerialQueue {
    name: &'static str,
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    pub fn new(name: &'static str) -> io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        thread::Builder::new().name(name.into()).spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(queue = name, "Cache queue job panicked");
                }
            }
            tracing::trace!(queue = name, "Cache queue shut down");
        })?;

        Ok(Self { name, sender })
    }

    /// Enqueues a job without waiting for it.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            tracing::error!(queue = self.name, "Cache queue is gone, dropping job");
        }
    }

    /// Enqueues a job and returns a receiver for its result.
    ///
    /// The receiver errors if the job never ran, or panicked.
    pub fn run<F, R>(&self, job: F) -> oneshot::Receiver<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            // the receiving side is allowed to lose interest
            let _ = tx.send(job());
        });
        rx
    }

    /// Resolves once every job enqueued before this call has run.
    pub async fn flush(&self) {
        let _ = self.run(|| ()).await;
    }
}
