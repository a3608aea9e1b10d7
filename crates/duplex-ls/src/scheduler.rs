//! Interleaves Serial and Parallel handler invocations.
//!
//! A dedicated worker thread drains a blocking queue of prepared handler
//! futures. Parallel items start immediately on the injected tokio runtime
//! and run concurrently; a Serial item waits for every in-flight parallel
//! task to finish, then runs to completion before the next queue item is
//! consumed. For two items A (enqueued first) and B, if either is Serial,
//! all side effects of A are ordered before any side effect of B.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use futures::future::BoxFuture;

/// The scheduling class of an inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessType {
    /// Mutually exclusive with all prior and later work.
    Serial,
    /// May overlap with other parallel items.
    #[default]
    Parallel,
}

struct Task {
    process: ProcessType,
    fut: BoxFuture<'static, ()>,
}

/// The scheduler worker and its queue.
pub struct Scheduler {
    tx: Option<Sender<Task>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the worker thread.
    ///
    /// `grace` bounds how long shutdown waits for in-flight parallel tasks
    /// before abandoning them. The runtime behind `handle` must have its
    /// timer enabled.
    pub fn new(handle: tokio::runtime::Handle, grace: Duration) -> Scheduler {
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let worker = thread::spawn(move || worker_loop(rx, handle, grace));
        Scheduler {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Enqueues a prepared handler future.
    ///
    /// Returns false when the scheduler has shut down.
    pub fn dispatch(
        &self,
        process: ProcessType,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> bool {
        let Some(tx) = &self.tx else { return false };
        tx.send(Task {
            process,
            fut: Box::pin(fut),
        })
        .is_ok()
    }

    /// Closes the queue and joins the worker, waiting up to the grace period
    /// for outstanding tasks. Idempotent.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("scheduler worker panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Task>, handle: tokio::runtime::Handle, grace: Duration) {
    let mut in_flight: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    for task in rx.iter() {
        in_flight.retain(|task| !task.is_finished());
        match task.process {
            ProcessType::Parallel => in_flight.push(handle.spawn(task.fut)),
            ProcessType::Serial => handle.block_on(async {
                for running in in_flight.drain(..) {
                    let _ = running.await;
                }
                task.fut.await;
            }),
        }
    }

    in_flight.retain(|task| !task.is_finished());
    if in_flight.is_empty() {
        return;
    }
    let drain = futures::future::join_all(in_flight);
    let abandoned = handle.block_on(async { tokio::time::timeout(grace, drain).await });
    if abandoned.is_err() {
        log::warn!("scheduler shutdown abandoned outstanding tasks after {grace:?}");
    }
    log::debug!("scheduler worker finished");
}
