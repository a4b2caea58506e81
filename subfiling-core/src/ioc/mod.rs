// vim: tw=80
//! I/O concentrator
//!
//! Every rank chosen as an IOC runs one receiver task, which admits requests
//! into the [`IoQueue`](queue::IoQueue), plus a [`WorkerPool`] that executes
//! them.  Completing a request may make others eligible, so workers dispatch
//! too.

use bytes::Bytes;
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
};
use tracing::{debug, info_span, warn};
use tracing_futures::Instrument;
use crate::{
    comm::Comm,
    context::SubfilingContext,
    rpc::{Request, tag},
    types::*,
};

pub mod queue;
pub mod worker;

use queue::IoQueue;
use worker::{Executor, Subfiles, Submitter, WorkerPool};

/// State shared by the receiver and the workers
struct Shared {
    ctx: Arc<SubfilingContext>,
    files: Subfiles,
    queue: Mutex<IoQueue>,
    submitter: Submitter,
    /// Signalled whenever the queue becomes empty
    idle: Notify,
    failures: Arc<AtomicU64>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, IoQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand every eligible request to the worker pool
    fn dispatch(self: &Arc<Self>) -> Result<()> {
        let ready = self.queue().try_dispatch();
        for d in ready {
            let shared = self.clone();
            self.submitter.submit(Box::pin(async move {
                let executor = Executor {
                    ctx: &shared.ctx,
                    files: &shared.files,
                    failures: &shared.failures,
                };
                executor.execute(d).await;
                shared.complete(d.seq);
            }))?;
        }
        Ok(())
    }

    fn complete(self: &Arc<Self>, seq: u64) {
        let empty = {
            let mut queue = self.queue();
            queue.complete(seq);
            queue.is_empty()
        };
        if empty {
            self.idle.notify_waiters();
        } else if let Err(e) = self.dispatch() {
            warn!("cannot dispatch: {e:?}");
        }
    }

    /// Wait until every admitted request has completed
    async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.queue().is_empty() {
                break;
            }
            notified.await;
        }
    }
}

/// Receive requests until told to shut down
async fn receive(shared: Arc<Shared>) -> Result<()> {
    let comm = shared.ctx.msg_comm().clone();
    loop {
        let env = comm.recv(None, None).await?;
        match Request::decode(&env) {
            Ok(Some(req)) => {
                let seq = shared.queue().enqueue(env.source, req);
                debug!(seq, source = env.source, ?req, "admit");
                shared.dispatch()?;
            },
            Ok(None) => break,
            Err(e) => {
                warn!(source = env.source, tag = %env.tag,
                      "discarding malformed request: {e:?}");
            }
        }
    }
    shared.drain().await;
    Ok(())
}

/// Owner's handle to a running IOC
pub struct IocHandle {
    receiver: JoinHandle<Result<()>>,
    pool: WorkerPool,
    msg_comm: Arc<dyn Comm>,
    failures: Arc<AtomicU64>,
}

impl IocHandle {
    /// Open this rank's subfiles and start serving them
    pub fn start(ctx: Arc<SubfilingContext>, create: bool, truncate: bool)
        -> Result<Self>
    {
        let ioc_idx = ctx.topology().ioc_idx().ok_or(Error::EINVAL)?;
        let files = Subfiles::open(&ctx, create, truncate)?;
        let (pool, submitter) = WorkerPool::new(ctx.thread_pool_size());
        let msg_comm = ctx.msg_comm().clone();
        let span = info_span!("ioc", ioc_idx, file_id = ctx.file_id());
        let failures = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(Shared {
            ctx,
            files,
            queue: Mutex::new(IoQueue::default()),
            submitter,
            idle: Notify::new(),
            failures: failures.clone(),
        });
        let receiver = tokio::spawn(receive(shared).instrument(span));
        Ok(IocHandle{receiver, pool, msg_comm, failures})
    }

    /// Stop receiving, finish any admitted requests, and wait for the
    /// workers to exit.  Returns the number of requests that failed over the
    /// IOC's lifetime.
    ///
    /// Clients must have finished all of their I/O first.
    pub async fn shutdown(self) -> Result<u64> {
        let me = self.msg_comm.rank();
        self.msg_comm.send(me, tag::SHUTDOWN, Bytes::new()).await?;
        let r = self.receiver.await.map_err(Error::unhandled_error)?;
        self.pool.join().await?;
        let failures = self.failures.load(Ordering::Relaxed);
        if failures > 0 {
            warn!(failures, "IOC stopped after failed requests");
        }
        r.map(|_| failures)
    }
}

impl fmt::Debug for IocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IocHandle")
            .field("rank", &self.msg_comm.rank())
            .field("workers", &self.pool.size())
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// LCOV_EXCL_STOP
