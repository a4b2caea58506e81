// vim: tw=80
//! Process-group messaging
//!
//! Subfiling doesn't implement its own transport.  Instead it runs over any
//! fixed-size process group that can do tagged point-to-point messaging.  The
//! handful of collectives that subfiling needs are layered on top of
//! point-to-point, using tags from a reserved range.

use bytes::Bytes;
use futures::{
    Future,
    future::{self, TryFutureExt},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    pin::Pin,
    sync::Arc
};
use crate::types::*;

#[cfg(test)] use mockall::automock;

/// Future returned by all `Comm` operations
pub type CommFut<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Message tag.  Receivers may select messages by tag.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
         Serialize)]
pub struct Tag(pub u32);

impl Tag {
    /// First tag reserved for collective operations
    pub const RESERVED: Tag = Tag(0xFFFF_0000);

    const BARRIER_IN: Tag = Tag(0xFFFF_0001);
    const BARRIER_OUT: Tag = Tag(0xFFFF_0002);
    const BCAST: Tag = Tag(0xFFFF_0003);
    const GATHER: Tag = Tag(0xFFFF_0004);

    pub fn is_reserved(self) -> bool {
        self >= Tag::RESERVED
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifies a communicator.  Communicators with equal ids have the same
/// membership and share a message space.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct GroupId(pub u64);

/// Where a process sits relative to the other processes on its node
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct NodeInfo {
    /// This process's rank among the processes on its node
    pub local_rank: Rank,
    /// Number of processes on this node
    pub local_size: usize,
    /// Lowest world rank on this node.  Identifies the node.
    pub lead_rank: Rank,
}

/// A received message
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Bytes,
}

/// A fixed-size group of communicating processes
///
/// Messages sent from one rank to another with the same tag are delivered in
/// the order in which they were sent.  There is no ordering between different
/// tags or different senders.
#[cfg_attr(test, automock)]
pub trait Comm: Send + Sync {
    /// This process's index within the group
    fn rank(&self) -> Rank;

    /// Number of processes in the group
    fn size(&self) -> usize;

    /// This process's placement on its node
    fn node(&self) -> NodeInfo;

    fn group(&self) -> GroupId;

    /// Create a new communicator with the same membership but a disjoint
    /// message space.  Collective: every rank must call it, in the same order
    /// relative to other `dup` calls on this communicator.
    fn dup(&self) -> CommFut<Arc<dyn Comm>>;

    /// Send `payload` to `dest`.  Completes once the message is buffered.
    fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> CommFut<()>;

    /// Receive the oldest message matching `source` and `tag`.  `None` matches
    /// anything.
    fn recv(&self, source: Option<Rank>, tag: Option<Tag>)
        -> CommFut<Envelope>;
}

/// Reduction operator for [`allreduce`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReduceOp {
    Max,
    Min,
    Sum,
}

impl ReduceOp {
    fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Sum => a.saturating_add(b),
        }
    }
}

fn encode<T: Serialize>(t: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(t)?))
}

fn decode<T: DeserializeOwned>(b: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(b)?)
}

/// Block until every rank in the group has entered the barrier
pub async fn barrier(comm: &dyn Comm) -> Result<()> {
    let size = comm.size();
    if comm.rank() == 0 {
        for r in 1..size {
            comm.recv(Some(r), Some(Tag::BARRIER_IN)).await?;
        }
        future::try_join_all((1..size).map(|r| {
            comm.send(r, Tag::BARRIER_OUT, Bytes::new())
        })).await?;
    } else {
        comm.send(0, Tag::BARRIER_IN, Bytes::new()).await?;
        comm.recv(Some(0), Some(Tag::BARRIER_OUT)).await?;
    }
    Ok(())
}

/// Broadcast a value from `root` to every rank.
///
/// `value` is only consulted on the root.  Other ranks may pass `None`.
pub async fn bcast<T>(comm: &dyn Comm, root: Rank, value: Option<T>)
    -> Result<T>
    where T: Serialize + DeserializeOwned
{
    if comm.rank() == root {
        let value = value.ok_or(Error::EINVAL)?;
        let payload = encode(&value)?;
        future::try_join_all((0..comm.size())
            .filter(|&r| r != root)
            .map(|r| comm.send(r, Tag::BCAST, payload.clone()))
        ).await?;
        Ok(value)
    } else {
        let env = comm.recv(Some(root), Some(Tag::BCAST)).await?;
        decode(&env.payload)
    }
}

/// Gather one value from every rank, and distribute the whole collection to
/// every rank.  The result is ordered by rank.
pub async fn allgather<T>(comm: &dyn Comm, value: T) -> Result<Vec<T>>
    where T: Serialize + DeserializeOwned
{
    let gathered = if comm.rank() == 0 {
        let mut v = Vec::with_capacity(comm.size());
        v.push(value);
        for r in 1..comm.size() {
            let env = comm.recv(Some(r), Some(Tag::GATHER)).await?;
            v.push(decode(&env.payload)?);
        }
        Some(v)
    } else {
        comm.send(0, Tag::GATHER, encode(&value)?).await?;
        None
    };
    bcast(comm, 0, gathered).await
}

/// Combine one integer from every rank with `op`, and return the result to
/// every rank
pub async fn allreduce(comm: &dyn Comm, value: i64, op: ReduceOp)
    -> Result<i64>
{
    let all = allgather(comm, value).await?;
    all.into_iter()
        .reduce(|a, b| op.apply(a, b))
        .ok_or(Error::EINVAL)
}

/// Send a serializable message
pub fn send_msg<T: Serialize>(comm: &dyn Comm, dest: Rank, tag: Tag, msg: &T)
    -> CommFut<()>
{
    match encode(msg) {
        Ok(payload) => comm.send(dest, tag, payload),
        Err(e) => Box::pin(future::err(e))
    }
}

/// Receive and decode a message from a known source
pub fn recv_msg<T>(comm: &dyn Comm, source: Rank, tag: Tag)
    -> impl Future<Output=Result<T>> + Send
    where T: DeserializeOwned + Send
{
    comm.recv(Some(source), Some(tag))
        .and_then(|env| future::ready(decode(&env.payload)))
}

// LCOV_EXCL_STOP
