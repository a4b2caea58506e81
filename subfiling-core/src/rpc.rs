// vim: tw=80
//! Wire protocol between clients and I/O concentrators
//!
//! Requests travel on the context's message communicator, which only IOCs
//! receive from.  Everything else (acknowledgements, payloads, and replies)
//! travels on the data communicator.
//!
//! A write goes like this:
//! 1. Client sends a `WRITE_REQUEST` header.
//! 2. Once the request is dispatched, the IOC replies with a `WRITE_ACK`
//!    carrying a per-request data tag, or zero to reject the request.
//! 3. Client sends the payload on the data tag.
//! 4. IOC writes it and sends a `WriteDone` on the matching completion tag.
//!
//! Reads are similar, except that the payload flows the other way.  When each
//! IOC serves exactly one subfile the acknowledgement is skipped, and the
//! payload arrives on the static `READ_DATA` tag.
//!
//! Write payloads, read payloads, and write completions are tagged from three
//! disjoint ranges.  A rank that is both a client and an IOC receives write
//! payloads in the one role and read payloads in the other, from the same
//! peers on the same communicator, so their tags must never coincide.

use bytes::Bytes;
use futures::{
    Future,
    future::{self, try_join_all},
};
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    pin::Pin,
};
use tracing::{instrument, warn};
use crate::{
    comm::{Envelope, Tag, recv_msg, send_msg},
    context::SubfilingContext,
    stripe::Segment,
    types::*,
};

/// Message tags
pub mod tag {
    use crate::comm::Tag;

    pub const WRITE_REQUEST: Tag = Tag(1);
    pub const READ_REQUEST: Tag = Tag(2);
    pub const TRUNCATE_REQUEST: Tag = Tag(3);
    pub const SIZE_REQUEST: Tag = Tag(4);
    /// Sent by an IOC to itself to stop its receiver
    pub const SHUTDOWN: Tag = Tag(5);

    pub const WRITE_ACK: Tag = Tag(16);
    pub const READ_ACK: Tag = Tag(17);
    pub const READ_DATA: Tag = Tag(18);
    pub const TRUNCATE_DONE: Tag = Tag(19);
    pub const SIZE_REPLY: Tag = Tag(20);

    /// First write payload tag.  Clients send on these.
    pub const WRITE_DATA_BASE: u32 = 0x100;
    /// First read payload tag.  IOCs send on these.
    pub const READ_DATA_BASE: u32 = 0x4000_0000;
    /// First write completion tag
    pub const DONE_BASE: u32 = 0x8000_0000;
    /// Number of distinct tags in each of the ranges above
    pub const DATA_SPAN: u32 = 0x3fff_0000;
}

fn seq_tag(base: u32, seq: u64) -> Tag {
    Tag(base + (seq % u64::from(tag::DATA_SPAN)) as u32)
}

/// The tag carrying the payload of the write with sequence number `seq`.
/// Never zero, because zero means NACK.
pub fn write_tag(seq: u64) -> Tag {
    seq_tag(tag::WRITE_DATA_BASE, seq)
}

/// The tag carrying the payload of the read with sequence number `seq`
pub fn read_tag(seq: u64) -> Tag {
    seq_tag(tag::READ_DATA_BASE, seq)
}

/// The tag on which the completion of the write using `data` is reported.
/// It differs from the data tag so that a rank writing to itself can't
/// mistake its own payload for the reply.
pub fn done_tag(data: Tag) -> Tag {
    Tag(data.0 - tag::WRITE_DATA_BASE + tag::DONE_BASE)
}

/// Header of a read or write request
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IoHeader {
    pub len: u64,
    /// Offset within the subfile
    pub offset: u64,
    pub subfile: SubfileIdx,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TruncateRequest {
    pub len: u64,
    pub subfile: SubfileIdx,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SizeRequest {
    pub subfile: SubfileIdx,
}

/// Acknowledges a read or write request.  Contains the data tag, or 0 for a
/// NACK.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ack(pub u32);

impl Ack {
    pub const NACK: Ack = Ack(0);

    pub fn data_tag(self) -> Option<Tag> {
        if self.0 == 0 {
            None
        } else {
            Some(Tag(self.0))
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WriteDone {
    pub tag: u32,
    pub status: std::result::Result<(), Error>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TruncateDone {
    pub status: std::result::Result<(), Error>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SizeReply {
    pub ioc_idx: usize,
    pub size: std::result::Result<u64, Error>,
    pub subfile: SubfileIdx,
}

/// Kind of an I/O request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    Read,
    Write,
    Truncate,
    Size
}

/// A decoded request, as seen by an IOC
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Request {
    Write(IoHeader),
    Read(IoHeader),
    Truncate(TruncateRequest),
    Size(SizeRequest),
}

impl Request {
    /// Decode a request from the message communicator.  Returns `None` for a
    /// shutdown message.
    pub fn decode(env: &Envelope) -> Result<Option<Self>> {
        let p = &env.payload[..];
        let req = match env.tag {
            tag::WRITE_REQUEST => Request::Write(bincode::deserialize(p)?),
            tag::READ_REQUEST => Request::Read(bincode::deserialize(p)?),
            tag::TRUNCATE_REQUEST =>
                Request::Truncate(bincode::deserialize(p)?),
            tag::SIZE_REQUEST => Request::Size(bincode::deserialize(p)?),
            tag::SHUTDOWN => return Ok(None),
            _ => return Err(Error::EPROTO)
        };
        Ok(Some(req))
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Request::Write(_) => OpKind::Write,
            Request::Read(_) => OpKind::Read,
            Request::Truncate(_) => OpKind::Truncate,
            Request::Size(_) => OpKind::Size,
        }
    }

    pub fn subfile(&self) -> SubfileIdx {
        match self {
            Request::Write(h) | Request::Read(h) => h.subfile,
            Request::Truncate(t) => t.subfile,
            Request::Size(s) => s.subfile,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Request::Write(_))
    }

    /// Truncates and size queries must run alone
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Request::Truncate(_) | Request::Size(_))
    }

    /// Byte range touched within the subfile, as a half-open range.  Only
    /// meaningful for reads and writes.
    pub fn range(&self) -> Option<(u64, u64)> {
        match self {
            Request::Write(h) | Request::Read(h) => {
                Some((h.offset, h.offset.saturating_add(h.len)))
            },
            _ => None
        }
    }
}

type BoxFut<T> = Pin<Box<dyn Future<Output=Result<T>> + Send>>;

/// Group segments by the IOC that serves them, preserving order
fn by_ioc<T>(ctx: &SubfilingContext, pieces: Vec<(Segment, T)>)
    -> BTreeMap<usize, (Rank, Vec<(Segment, T)>)>
{
    let mut m: BTreeMap<usize, (Rank, Vec<(Segment, T)>)> = BTreeMap::new();
    for (seg, buf) in pieces {
        let (ioc, rank) = ctx.ioc_for_subfile(seg.subfile);
        m.entry(ioc)
            .or_insert_with(|| (rank, Vec::new()))
            .1
            .push((seg, buf));
    }
    m
}

/// Wait for every future, even if some fail, and return the first error
async fn join_all_first_err<T>(futs: Vec<BoxFut<T>>) -> Result<Vec<T>> {
    future::join_all(futs).await.into_iter().collect()
}

/// Write one segment's worth of data: send the request and payload, and
/// return a future for the completion message
async fn write_segment(
    ctx: &SubfilingContext,
    ioc: usize,
    rank: Rank,
    seg: Segment,
    data: IoVec
) -> Result<BoxFut<()>>
{
    let data_comm = ctx.data_comm();
    let hdr = IoHeader{len: seg.len, offset: seg.subfile_offset,
                       subfile: seg.subfile};
    let _guard = ctx.ioc_lock(ioc).lock().await;
    send_msg(&**ctx.msg_comm(), rank, tag::WRITE_REQUEST, &hdr).await?;
    let ack: Ack = recv_msg(&**data_comm, rank, tag::WRITE_ACK).await?;
    let dtag = match ack.data_tag() {
        Some(t) => t,
        None => {
            warn!(ioc, subfile = seg.subfile, "write request rejected");
            return Err(Error::EIO);
        }
    };
    data_comm.send(rank, dtag, Bytes::copy_from_slice(&data[..])).await?;
    let done = recv_msg::<WriteDone>(&**data_comm, rank, done_tag(dtag));
    Ok(Box::pin(async move {
        let wd = done.await?;
        debug_assert_eq!(wd.tag, dtag.0);
        wd.status
    }))
}

/// Write `buf` at logical `offset`.
///
/// Requests for different IOCs are issued concurrently.  For each IOC, the
/// requests are sent back to back, and then all of the completions are
/// awaited.  Returns once all the data has been written.
#[instrument(skip(ctx, buf), fields(len = buf.len()))]
pub async fn write(ctx: &SubfilingContext, offset: u64, buf: IoVec)
    -> Result<()>
{
    let pieces = ctx.geometry().split_write(offset, &buf);
    let chains = by_ioc(ctx, pieces).into_iter()
        .map(|(ioc, (rank, pieces))| async move {
            let mut dones = Vec::with_capacity(pieces.len());
            let mut r = Ok(());
            for (seg, data) in pieces {
                match write_segment(ctx, ioc, rank, seg, data).await {
                    Ok(done) => dones.push(done),
                    Err(e) => {
                        r = Err(e);
                        break;
                    }
                }
            }
            let done_r = join_all_first_err(dones).await;
            r.and(done_r.map(drop))
        });
    try_join_all(chains).await.map(drop)
}

/// Send one read request, and return a future for its payload
async fn read_segment(
    ctx: &SubfilingContext,
    ioc: usize,
    rank: Rank,
    seg: Segment,
    mut dst: IoVecMut
) -> Result<BoxFut<()>>
{
    let data_comm = ctx.data_comm();
    let hdr = IoHeader{len: seg.len, offset: seg.subfile_offset,
                       subfile: seg.subfile};
    let guard = ctx.ioc_lock(ioc).lock().await;
    send_msg(&**ctx.msg_comm(), rank, tag::READ_REQUEST, &hdr).await?;
    let payload: BoxFut<Envelope> = if ctx.static_read_tag() {
        // The static tag is shared by all requests, so the payload must
        // arrive before another request may be sent.
        let env = data_comm.recv(Some(rank), Some(tag::READ_DATA)).await?;
        drop(guard);
        Box::pin(future::ok(env))
    } else {
        let ack: Ack = recv_msg(&**data_comm, rank, tag::READ_ACK).await?;
        drop(guard);
        match ack.data_tag() {
            Some(t) => data_comm.recv(Some(rank), Some(t)),
            None => {
                warn!(ioc, subfile = seg.subfile, "read request rejected");
                return Err(Error::EIO);
            }
        }
    };
    Ok(Box::pin(async move {
        let env = payload.await?;
        if env.payload.len() != dst.len() {
            warn!(ioc, subfile = seg.subfile, "short read reply");
            return Err(Error::EIO);
        }
        dst.copy_from_slice(&env.payload[..]);
        Ok(())
    }))
}

/// Read into `buf` from logical `offset`
#[instrument(skip(ctx, buf), fields(len = buf.len()))]
pub async fn read(ctx: &SubfilingContext, offset: u64, buf: IoVecMut)
    -> Result<()>
{
    let pieces = ctx.geometry().split_read(offset, buf);
    let chains = by_ioc(ctx, pieces).into_iter()
        .map(|(ioc, (rank, pieces))| async move {
            let mut payloads = Vec::with_capacity(pieces.len());
            let mut r = Ok(());
            for (seg, dst) in pieces {
                match read_segment(ctx, ioc, rank, seg, dst).await {
                    Ok(p) => payloads.push(p),
                    Err(e) => {
                        r = Err(e);
                        break;
                    }
                }
            }
            let payload_r = join_all_first_err(payloads).await;
            r.and(payload_r.map(drop))
        });
    try_join_all(chains).await.map(drop)
}

/// Truncate one subfile to `len` bytes.  Executes only once it reaches the
/// head of the IOC's queue.
#[instrument(skip(ctx))]
pub async fn truncate_subfile(
    ctx: &SubfilingContext,
    subfile: SubfileIdx,
    len: u64
) -> Result<()>
{
    let (ioc, rank) = ctx.ioc_for_subfile(subfile);
    let _guard = ctx.ioc_lock(ioc).lock().await;
    let req = TruncateRequest{len, subfile};
    send_msg(&**ctx.msg_comm(), rank, tag::TRUNCATE_REQUEST, &req).await?;
    let done: TruncateDone = recv_msg(&**ctx.data_comm(), rank,
                                      tag::TRUNCATE_DONE).await?;
    done.status
}

/// Query the size of one subfile
#[instrument(skip(ctx))]
pub async fn subfile_size(ctx: &SubfilingContext, subfile: SubfileIdx)
    -> Result<u64>
{
    let (ioc, rank) = ctx.ioc_for_subfile(subfile);
    let _guard = ctx.ioc_lock(ioc).lock().await;
    let req = SizeRequest{subfile};
    send_msg(&**ctx.msg_comm(), rank, tag::SIZE_REQUEST, &req).await?;
    let reply: SizeReply = recv_msg(&**ctx.data_comm(), rank,
                                    tag::SIZE_REPLY).await?;
    if reply.subfile != subfile || reply.ioc_idx != ioc {
        return Err(Error::EPROTO);
    }
    reply.size
}

// LCOV_EXCL_STOP
