//! Execution contexts (spec §5): main (cooperative, completions land
//! here), IO (serial FIFO worker, owns all filesystem access), and
//! transform (shared blocking pool for codec/transform work).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;

/// Where client-visible completions and placeholder/view mutations are
/// delivered. Injectable so tests can use a synchronous stand-in (spec
/// §9: "tests use a synchronous executor to make delivery deterministic").
pub trait MainExecutor: Send + Sync {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Dispatches onto the ambient tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioMainExecutor;

impl MainExecutor for TokioMainExecutor {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tokio::spawn(future);
    }
}

/// Runs the completion to completion inline, blocking the caller. Used
/// in tests so a client's `download_image` call observes every
/// completion before returning.
#[derive(Debug, Clone, Default)]
pub struct SyncMainExecutor;

impl MainExecutor for SyncMainExecutor {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        futures::executor::block_on(future);
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-slot serial worker fed by an unbounded channel: the natural
/// mapping of "one FIFO queue" onto cooperative tasks (spec §9). Every
/// job submitted is run to completion, in submission order, before the
/// next one starts --- this is what gives the disk tier its per-key
/// ordering guarantee without per-path locking.
#[derive(Clone)]
pub struct IoExecutor {
    sender: async_channel::Sender<Job>,
    _worker: Arc<JoinHandle<()>>,
}

impl IoExecutor {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        let worker = tokio::spawn(async move {
            while let Ok(job) = receiver.recv().await {
                if let Err(err) = tokio::task::spawn_blocking(job).await {
                    error!(%err, "io executor job panicked");
                }
            }
        });
        Self { sender, _worker: Arc::new(worker) }
    }

    /// Enqueues `job`; panics only if the worker task has been dropped,
    /// which cannot happen while this handle (and its `Arc`) is alive.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.try_send(Box::new(job));
    }
}

impl Default for IoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs CPU-bound codec/transform work on tokio's blocking pool, the
/// "shared concurrent pool" spec §5 calls for.
pub async fn run_on_transform_executor<F, T>(work: F) -> Result<T, tokio::task::JoinError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await
}
