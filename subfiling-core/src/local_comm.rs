// vim: tw=80
//! An in-process implementation of [`Comm`]
//!
//! Every rank of a `LocalWorld` lives in the same process.  Each rank owns a
//! mailbox, and sending is just pushing onto the destination's mailbox.  It's
//! useful for tests, and for single-process tools that want to run a whole
//! process group on one tokio runtime.

use bytes::Bytes;
use futures::future;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::Notify;
use crate::{
    comm::*,
    types::*,
};

#[derive(Debug)]
struct Msg {
    ctx: u64,
    source: Rank,
    tag: Tag,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Msg>>,
    notify: Notify,
}

impl Mailbox {
    fn take(&self, ctx: u64, source: Option<Rank>, tag: Option<Tag>)
        -> Result<Option<Envelope>>
    {
        let mut queue = self.queue.lock().map_err(|_| Error::EPIPE)?;
        let pos = queue.iter().position(|m| {
            m.ctx == ctx &&
                source.map(|s| s == m.source).unwrap_or(true) &&
                tag.map(|t| t == m.tag).unwrap_or(true)
        });
        Ok(pos.and_then(|i| queue.remove(i))
            .map(|m| Envelope{source: m.source, tag: m.tag, payload: m.payload}))
    }
}

#[derive(Debug)]
struct World {
    mailboxes: Vec<Mailbox>,
    /// Node number of each rank
    placement: Vec<usize>,
    /// Maps (parent context, dup sequence number) to child context
    children: Mutex<HashMap<(u64, u64), u64>>,
    next_ctx: AtomicU64,
}

/// A group of in-process ranks
#[derive(Clone, Debug)]
pub struct LocalWorld {
    inner: Arc<World>
}

impl LocalWorld {
    /// Create a world of `size` ranks, all on the same node
    pub fn new(size: usize) -> Self {
        Self::with_placement(vec![0; size])
    }

    /// Create a world with one rank per element of `placement`.  Ranks with
    /// equal placement values share a node.
    pub fn with_placement(placement: Vec<usize>) -> Self {
        let mailboxes = placement.iter().map(|_| Mailbox::default()).collect();
        let inner = Arc::new(World {
            mailboxes,
            placement,
            children: Mutex::new(HashMap::new()),
            next_ctx: AtomicU64::new(1),
        });
        LocalWorld{inner}
    }

    pub fn size(&self) -> usize {
        self.inner.placement.len()
    }

    /// Return the world communicator for every rank, ordered by rank
    pub fn comms(&self) -> Vec<Arc<dyn Comm>> {
        (0..self.size()).map(|rank| {
            Arc::new(LocalComm::new(self.inner.clone(), rank, 0))
                as Arc<dyn Comm>
        }).collect()
    }
}

/// One rank's view of a `LocalWorld` communicator
#[derive(Debug)]
pub struct LocalComm {
    world: Arc<World>,
    rank: Rank,
    ctx: u64,
    ndups: AtomicU64,
}

impl LocalComm {
    fn new(world: Arc<World>, rank: Rank, ctx: u64) -> Self {
        LocalComm{world, rank, ctx, ndups: AtomicU64::new(0)}
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.placement.len()
    }

    fn node(&self) -> NodeInfo {
        let mynode = self.world.placement[self.rank];
        let mut local_rank = 0;
        let mut local_size = 0;
        let mut lead_rank = None;
        for (r, &node) in self.world.placement.iter().enumerate() {
            if node == mynode {
                lead_rank.get_or_insert(r);
                if r < self.rank {
                    local_rank += 1;
                }
                local_size += 1;
            }
        }
        NodeInfo {
            local_rank,
            local_size,
            lead_rank: lead_rank.unwrap_or(self.rank)
        }
    }

    fn group(&self) -> GroupId {
        GroupId(self.ctx)
    }

    fn dup(&self) -> CommFut<Arc<dyn Comm>> {
        let seq = self.ndups.fetch_add(1, Ordering::Relaxed);
        let r = self.world.children.lock()
            .map_err(|_| Error::EPIPE)
            .map(|mut children| {
                let next_ctx = &self.world.next_ctx;
                *children.entry((self.ctx, seq))
                    .or_insert_with(|| next_ctx.fetch_add(1, Ordering::Relaxed))
            }).map(|ctx| {
                Arc::new(LocalComm::new(self.world.clone(), self.rank, ctx))
                    as Arc<dyn Comm>
            });
        Box::pin(future::ready(r))
    }

    fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> CommFut<()> {
        let r = self.world.mailboxes.get(dest)
            .ok_or(Error::EINVAL)
            .and_then(|mb| {
                let msg = Msg{ctx: self.ctx, source: self.rank, tag, payload};
                mb.queue.lock().map_err(|_| Error::EPIPE)?.push_back(msg);
                mb.notify.notify_waiters();
                Ok(())
            });
        Box::pin(future::ready(r))
    }

    fn recv(&self, source: Option<Rank>, tag: Option<Tag>)
        -> CommFut<Envelope>
    {
        let world = self.world.clone();
        let rank = self.rank;
        let ctx = self.ctx;
        Box::pin(async move {
            let mb = &world.mailboxes[rank];
            loop {
                // Register interest before looking, so a message that arrives
                // in between isn't missed.
                let notified = mb.notify.notified();
                if let Some(env) = mb.take(ctx, source, tag)? {
                    return Ok(env);
                }
                notified.await;
            }
        })
    }
}

// LCOV_EXCL_STOP
