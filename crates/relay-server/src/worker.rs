//! Single request worker.
//!
//! Request connections are many; the dispatcher is one. Every connection
//! submits its raw request bytes to a bounded queue and awaits the reply on a
//! oneshot channel, while one task drains the queue and runs the dispatcher
//! one request at a time. Log check-then-append sequences are therefore
//! never interleaved.

use crate::metrics;
use bytes::Bytes;
use relay_core::Dispatcher;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Job = (Bytes, oneshot::Sender<Bytes>);

/// The worker task has exited.
#[derive(Debug, Error)]
#[error("request worker stopped")]
pub struct WorkerStopped;

/// Handle for submitting requests to the worker.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<Job>,
}

impl RequestQueue {
    /// Spawn the worker task around a dispatcher.
    ///
    /// The worker exits once every queue handle is dropped.
    #[must_use]
    pub fn spawn(dispatcher: Dispatcher, depth: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let handle = tokio::spawn(run(dispatcher, rx));
        (Self { tx }, handle)
    }

    /// Submit encoded request bytes and wait for the encoded reply.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStopped`] if the worker is no longer running.
    pub async fn submit(&self, request: Bytes) -> Result<Bytes, WorkerStopped> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| WorkerStopped)?;
        reply_rx.await.map_err(|_| WorkerStopped)
    }
}

async fn run(dispatcher: Dispatcher, mut rx: mpsc::Receiver<Job>) {
    info!("Request worker started");

    while let Some((request, reply_tx)) = rx.recv().await {
        let start = Instant::now();
        let (reply, outcome) = dispatcher.handle_bytes(&request).await;
        metrics::record_request(&outcome, start.elapsed());

        if reply_tx.send(reply).is_err() {
            debug!(?outcome, "Requester went away before the reply");
        }
    }

    info!("Request worker stopped");
}
