// vim: tw=80
//! Worker pool and request execution for an I/O concentrator

use bytes::Bytes;
use futures::Future;
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::{self, JoinHandle},
};
use tracing::{debug, error, warn};
use tracing_futures::Instrument;
use crate::{
    comm::{Comm, Tag, send_msg},
    context::SubfilingContext,
    rpc::{
        Ack, IoHeader, Request, SizeReply, SizeRequest, TruncateDone,
        TruncateRequest, WriteDone, done_tag, read_tag, tag, write_tag
    },
    types::*,
};
use super::queue::Dispatched;

/// A unit of work for the pool
pub type Job = Pin<Box<dyn Future<Output=()> + Send>>;

/// How many times to retry a stalled read before giving up
const READ_RETRIES: u32 = 8;
/// Delay before the first read retry.  Doubles with each attempt.
const READ_RETRY_DELAY: Duration = Duration::from_micros(100);

/// Handle used to post work to a [`WorkerPool`]
#[derive(Clone, Debug)]
pub struct Submitter(mpsc::UnboundedSender<Job>);

impl Submitter {
    pub fn submit(&self, job: Job) -> Result<()> {
        self.0.send(job).map_err(|_| Error::EPIPE)
    }
}

/// A fixed number of tasks that execute jobs in the order they are posted.
///
/// Workers exit once every [`Submitter`] has been dropped and the backlog is
/// drained.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>
}

impl WorkerPool {
    pub fn new(size: usize) -> (Self, Submitter) {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..size.max(1)).map(|i| {
            let rx = rx.clone();
            let fut = async move {
                loop {
                    // Don't hold the lock while running the job
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => job.await,
                        None => break
                    }
                }
            }.instrument(tracing::debug_span!("worker", i));
            tokio::spawn(fut)
        }).collect();
        (WorkerPool{workers}, Submitter(tx))
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit
    pub async fn join(self) -> Result<()> {
        for w in self.workers {
            w.await.map_err(Error::unhandled_error)?;
        }
        Ok(())
    }
}

/// The open subfiles served by one IOC
#[derive(Debug, Default)]
pub struct Subfiles {
    files: BTreeMap<SubfileIdx, Arc<File>>
}

impl Subfiles {
    /// Open every subfile owned by this rank
    pub fn open(ctx: &SubfilingContext, create: bool, truncate: bool)
        -> Result<Self>
    {
        if create && !ctx.owned_subfiles().is_empty() {
            fs::create_dir_all(ctx.subfile_dir())?;
        }
        let mut files = BTreeMap::new();
        for &idx in ctx.owned_subfiles() {
            let path = ctx.subfile_path(idx);
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(truncate)
                .open(&path)
                .map_err(|e| {
                    warn!(path = %path.display(), "cannot open subfile: {e}");
                    Error::from(e)
                })?;
            files.insert(idx, Arc::new(f));
        }
        Ok(Subfiles{files})
    }

    /// Look up an owned subfile
    pub fn get(&self, idx: SubfileIdx) -> Result<Arc<File>> {
        self.files.get(&idx).cloned().ok_or(Error::EBADF)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Run a blocking file operation off of the reactor
async fn blocking<T, F>(f: F) -> Result<T>
    where F: FnOnce() -> Result<T> + Send + 'static,
          T: Send + 'static
{
    task::spawn_blocking(f).await.map_err(Error::unhandled_error)?
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

/// Fill `buf` from `offset`, retrying stalled reads with exponential backoff.
/// Whatever lies past the end of the file reads as zeros.
pub fn read_fully(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    read_fully_with(|b, o| file.read_at(b, o), buf, offset)
}

/// Like [`read_fully`], but with any positional read function
fn read_fully_with<F>(mut read_at: F, buf: &mut [u8], offset: u64)
    -> Result<()>
    where F: FnMut(&mut [u8], u64) -> io::Result<usize>
{
    let mut done = 0;
    let mut retries = 0;
    let mut delay = READ_RETRY_DELAY;
    while done < buf.len() {
        match read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                buf[done..].fill(0);
                break;
            },
            Ok(n) => done += n,
            Err(e) if is_transient(&e) && retries < READ_RETRIES => {
                retries += 1;
                thread::sleep(delay);
                delay *= 2;
            },
            Err(e) => {
                if retries > 0 {
                    error!(retries, "giving up on read: {e}");
                }
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Allocate a zeroed buffer of a length that came off the wire.  Fails
/// rather than aborting if the memory isn't available.
fn alloc_buf(len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| Error::ENOMEM)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::ENOMEM)?;
    buf.resize(len, 0);
    Ok(buf)
}

fn write_fully(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(buf, offset).map_err(Error::from)
}

/// Everything a worker needs to execute a request
pub struct Executor<'a> {
    pub ctx: &'a SubfilingContext,
    pub files: &'a Subfiles,
    /// Count of requests that failed, for reporting at shutdown
    pub failures: &'a AtomicU64,
}

impl<'a> Executor<'a> {
    fn data_comm(&self) -> &dyn Comm {
        &**self.ctx.data_comm()
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Execute one dispatched request and send its reply.  Failures are
    /// reported to the requester and counted; failures to reply are logged
    /// and counted.
    pub async fn execute(&self, d: Dispatched) {
        let r = match d.req {
            Request::Write(hdr) => self.write(d.seq, d.source, hdr).await,
            Request::Read(hdr) => self.read(d.seq, d.source, hdr).await,
            Request::Truncate(tr) => self.truncate(d.source, tr).await,
            Request::Size(sr) => self.size(d.source, sr).await,
        };
        if let Err(e) = r {
            error!(seq = d.seq, source = d.source, "cannot reply: {e:?}");
            self.record_failure();
        }
    }

    async fn write(&self, seq: u64, source: Rank, hdr: IoHeader)
        -> Result<()>
    {
        let comm = self.data_comm();
        let file = match self.files.get(hdr.subfile) {
            Ok(f) => f,
            Err(e) => {
                warn!(subfile = hdr.subfile, "rejecting write: {e:?}");
                self.record_failure();
                return send_msg(comm, source, tag::WRITE_ACK, &Ack::NACK)
                    .await;
            }
        };
        let dtag = write_tag(seq);
        send_msg(comm, source, tag::WRITE_ACK, &Ack(dtag.0)).await?;
        let env = comm.recv(Some(source), Some(dtag)).await?;
        let status = if env.payload.len() as u64 != hdr.len {
            Err(Error::EIO)
        } else {
            let offset = hdr.offset;
            let payload = env.payload;
            blocking(move || write_fully(&file, &payload[..], offset)).await
        };
        match status {
            Ok(()) if hdr.len > 0 => {
                let geometry = self.ctx.geometry();
                let last = hdr.offset + hdr.len - 1;
                self.ctx.update_eof(
                    geometry.logical_offset(hdr.subfile, last) + 1);
            },
            Ok(()) => (),
            Err(e) => {
                warn!(subfile = hdr.subfile, "write failed: {e:?}");
                self.record_failure();
            }
        }
        let done = WriteDone{tag: dtag.0, status};
        send_msg(comm, source, done_tag(dtag), &done).await
    }

    async fn read(&self, seq: u64, source: Rank, hdr: IoHeader)
        -> Result<()>
    {
        let comm = self.data_comm();
        let static_tag = self.ctx.static_read_tag();
        let data = match self.files.get(hdr.subfile) {
            Ok(file) => {
                let offset = hdr.offset;
                let len = hdr.len;
                blocking(move || {
                    let mut buf = alloc_buf(len)?;
                    read_fully(&file, &mut buf, offset).map(|_| buf)
                }).await
            },
            Err(e) => Err(e)
        };
        let data = match data {
            Ok(d) => Bytes::from(d),
            Err(e) => {
                warn!(subfile = hdr.subfile, "read failed: {e:?}");
                self.record_failure();
                return if static_tag {
                    // An empty payload tells the client that the read failed
                    comm.send(source, tag::READ_DATA, Bytes::new()).await
                } else {
                    send_msg(comm, source, tag::READ_ACK, &Ack::NACK).await
                };
            }
        };
        let dtag: Tag = if static_tag {
            tag::READ_DATA
        } else {
            let t = read_tag(seq);
            send_msg(comm, source, tag::READ_ACK, &Ack(t.0)).await?;
            t
        };
        comm.send(source, dtag, data).await
    }

    async fn truncate(&self, source: Rank, tr: TruncateRequest)
        -> Result<()>
    {
        let status = match self.files.get(tr.subfile) {
            Ok(file) => {
                let len = tr.len;
                blocking(move || file.set_len(len).map_err(Error::from)).await
            },
            Err(e) => Err(e)
        };
        debug!(subfile = tr.subfile, len = tr.len, ?status, "truncate");
        if status.is_err() {
            self.record_failure();
        }
        let done = TruncateDone{status};
        send_msg(self.data_comm(), source, tag::TRUNCATE_DONE, &done).await
    }

    async fn size(&self, source: Rank, sr: SizeRequest) -> Result<()> {
        let size = match self.files.get(sr.subfile) {
            Ok(file) => blocking(move || {
                file.metadata().map(|md| md.len()).map_err(Error::from)
            }).await,
            Err(e) => Err(e)
        };
        if size.is_err() {
            self.record_failure();
        }
        let ioc_idx = self.ctx.topology().ioc_idx().unwrap_or(usize::MAX);
        let reply = SizeReply{ioc_idx, size, subfile: sr.subfile};
        send_msg(self.data_comm(), source, tag::SIZE_REPLY, &reply).await
    }
}

// LCOV_EXCL_STOP
