// vim: tw=80
//! Logical files stored as a set of striped subfiles
//!
//! Opening, truncating, closing, and deleting are collective over the file's
//! communicator: every rank must make the same calls in the same order.
//! Reads and writes are independent.

use futures::future::try_join_all;
use std::{
    fs::{self, OpenOptions},
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, info, instrument, warn};
use crate::{
    comm::{self, Comm, ReduceOp},
    config::{ConfigFile, Env, SubfilingConfig, base_name, config_file_name},
    context::{ContextId, ContextRegistry, SubfilingContext},
    ioc::IocHandle,
    rpc,
    stripe::StripeGeometry,
    topology::TopologyCache,
    types::*,
    util::expand_sizes,
};

/// How to open a logical file
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpenFlags {
    /// Create the file if it doesn't exist
    pub create: bool,
    /// Discard any existing contents
    pub truncate: bool,
}

impl OpenFlags {
    /// Open an existing file
    pub fn existing() -> Self {
        OpenFlags::default()
    }

    /// Create a new file, or truncate an existing one
    pub fn create() -> Self {
        OpenFlags{create: true, truncate: true}
    }
}

/// Directories holding a file's subfiles and its configuration file
fn directories(path: &Path, config: &SubfilingConfig) -> (PathBuf, PathBuf) {
    let parent = path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let subfile_dir = config.subfile_prefix.clone()
        .unwrap_or_else(|| parent.to_owned());
    let config_dir = config.config_prefix.clone()
        .unwrap_or_else(|| subfile_dir.clone());
    (subfile_dir, config_dir)
}

/// Create or stat the stub file at the logical path, returning its inode
/// number for use as the file id
fn stub_file_id(path: &Path, flags: OpenFlags) -> Result<u64> {
    if flags.create {
        let f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(flags.truncate)
            .open(path)?;
        Ok(f.metadata()?.ino())
    } else {
        Ok(fs::metadata(path)?.ino())
    }
}

/// Location of an existing logical file's configuration file
pub fn config_path(path: &Path, config: &SubfilingConfig) -> Result<PathBuf> {
    let file_id = fs::metadata(path)?.ino();
    let (_, config_dir) = directories(path, config);
    Ok(config_dir.join(config_file_name(&base_name(path)?, file_id)))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into())
    }
}

/// Remove a logical file's stub, configuration file, and subfiles.
///
/// This is not collective.  Subfiles that don't exist are ignored.
pub fn remove_files(path: &Path, config: &SubfilingConfig) -> Result<()> {
    let (subfile_dir, _) = directories(path, config);
    let config_path = config_path(path, config)?;
    if let Some(cf) = ConfigFile::read(&config_path)? {
        let dir = if cf.subfile_dir.as_os_str().is_empty() {
            subfile_dir
        } else {
            cf.subfile_dir.clone()
        };
        for name in cf.subfiles.iter() {
            remove_if_exists(&dir.join(name))?;
        }
        remove_if_exists(&config_path)?;
    }
    fs::remove_file(path)?;
    debug!(path = %path.display(), "removed");
    Ok(())
}

/// Collectively delete a logical file.  Rank 0 does the work.
pub async fn delete(comm: &dyn Comm, path: &Path, config: &SubfilingConfig)
    -> Result<()>
{
    comm::barrier(comm).await?;
    let r = if comm.rank() == 0 {
        Some(remove_files(path, config))
    } else {
        None
    };
    comm::bcast(comm, 0, r).await?
}

#[derive(Debug, Default)]
struct Inner {
    registry: Mutex<ContextRegistry>,
    topologies: TopologyCache,
}

/// One rank's subfiling state: its open contexts and cached topologies.
///
/// Cloning produces another handle to the same state.
#[derive(Clone, Debug, Default)]
pub struct Subfiling {
    inner: Arc<Inner>
}

impl Subfiling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct files currently open
    pub fn open_contexts(&self) -> usize {
        self.inner.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Number of topologies still in use
    pub fn topologies(&self) -> usize {
        self.inner.topologies.len()
    }

    /// Collectively open a logical file.
    ///
    /// `config` supplies the striping parameters, which `env` may override.
    /// When opening an existing file, the parameters recorded in its
    /// configuration file win over the defaults, but disagreeing with an
    /// explicitly set value is an error.
    #[instrument(skip(self, comm, config, env))]
    pub async fn open(
        &self,
        comm: Arc<dyn Comm>,
        path: &Path,
        flags: OpenFlags,
        config: &SubfilingConfig,
        env: &Env
    ) -> Result<SubfilingFile>
    {
        let mut config = config.clone()
            .with_env(env, flags.create, comm.size())?;
        let (subfile_dir, config_dir) = directories(path, &config);
        let base = base_name(path)?;

        let stub = if comm.rank() == 0 {
            Some(stub_file_id(path, flags))
        } else {
            None
        };
        let file_id = comm::bcast(&*comm, 0, stub).await??;

        if !flags.truncate {
            self.reconcile(&*comm, &mut config,
                &config_dir.join(config_file_name(&base, file_id))).await?;
        }

        let reopened = self.inner.registry.lock()
            .map_err(|_| Error::EIO)?
            .acquire_file(file_id);
        if let Some((id, ctx)) = reopened {
            debug!(file_id, "sharing existing context");
            let f = SubfilingFile::new(self.clone(), id, ctx);
            if flags.truncate {
                // The subfiles are already open, so discard their contents
                // through the IOCs
                if let Err(e) = f.truncate(0).await {
                    f.close().await?;
                    return Err(e);
                }
            }
            return Ok(f);
        }

        let topology = self.inner.topologies
            .get(&*comm, config.ioc_selection, config.stripe_count)
            .await?;
        let num_subfiles = config.stripe_count.unwrap_or(topology.n_iocs());
        let geometry = StripeGeometry::new(config.stripe_size(),
                                           num_subfiles)?;
        let file_comm = comm.dup().await?;
        let msg_comm = comm.dup().await?;
        let data_comm = comm.dup().await?;
        let ctx = Arc::new(SubfilingContext::new(
            file_id,
            path,
            geometry,
            topology,
            subfile_dir,
            config_dir,
            [file_comm, msg_comm, data_comm],
            config.thread_pool_size
        )?);

        let (ioc, mut r) = if ctx.topology().rank_is_ioc() {
            match IocHandle::start(ctx.clone(), flags.create, flags.truncate) {
                Ok(ioc) => {
                    let r = if ctx.topology().ioc_idx() == Some(0) {
                        write_config_file(&ctx, flags)
                    } else {
                        Ok(())
                    };
                    (Some(ioc), r)
                },
                Err(e) => (None, Err(e))
            }
        } else {
            (None, Ok(()))
        };

        // Every rank must learn whether any IOC failed to start
        let failed = i64::from(r.is_err());
        match comm::allreduce(ctx.file_comm(), failed, ReduceOp::Max).await {
            Ok(0) => (),
            Ok(_) => {
                r = r.and(Err(Error::EIO));
            },
            Err(e) => {
                r = r.and(Err(e));
            }
        }
        if let Err(e) = r {
            warn!(path = %path.display(), "open failed: {e:?}");
            if let Some(ioc) = ioc {
                ioc.shutdown().await?;
            }
            return Err(e);
        }

        info!(file_id, stripe_size = geometry.stripe_size(),
              num_subfiles = geometry.num_subfiles(),
              n_iocs = ctx.topology().n_iocs(), "opened");
        let id = self.inner.registry.lock()
            .map_err(|_| Error::EIO)?
            .insert(ctx.clone(), ioc);
        Ok(SubfilingFile::new(self.clone(), id, ctx))
    }

    /// Adopt the striping parameters recorded by an existing file
    async fn reconcile(
        &self,
        comm: &dyn Comm,
        config: &mut SubfilingConfig,
        config_path: &Path
    ) -> Result<()>
    {
        let recorded = if comm.rank() == 0 {
            let r = ConfigFile::read(config_path)
                .map(|o| o.map(|cf| (cf.stripe_size, cf.subfile_count)));
            Some(r)
        } else {
            None
        };
        let recorded = comm::bcast(comm, 0, recorded).await??;
        if let Some((stripe_size, subfile_count)) = recorded {
            if config.stripe_size.is_some_and(|ss| ss != stripe_size) ||
                config.stripe_count.is_some_and(|n| n != subfile_count)
            {
                warn!(stripe_size, subfile_count,
                      "configuration disagrees with existing file");
                return Err(Error::EINVAL);
            }
            config.stripe_size = Some(stripe_size);
            config.stripe_count = Some(subfile_count);
        }
        Ok(())
    }
}

/// Record a new file's striping parameters
fn write_config_file(ctx: &SubfilingContext, flags: OpenFlags) -> Result<()> {
    let path = ctx.config_path();
    if !flags.create || (!flags.truncate && path.exists()) {
        return Ok(());
    }
    let geometry = ctx.geometry();
    let cf = ConfigFile::new(
        geometry.stripe_size(),
        ctx.topology().n_iocs(),
        geometry.num_subfiles(),
        ctx.path(),
        ctx.subfile_dir(),
        ctx.file_id()
    )?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    cf.write(&path)
}

/// An open logical file.  Must be closed with [`SubfilingFile::close`].
#[derive(Debug)]
pub struct SubfilingFile {
    subfiling: Subfiling,
    id: ContextId,
    ctx: Arc<SubfilingContext>,
    /// End of allocation
    eoa: AtomicU64,
}

impl SubfilingFile {
    fn new(subfiling: Subfiling, id: ContextId, ctx: Arc<SubfilingContext>)
        -> Self
    {
        SubfilingFile{subfiling, id, ctx, eoa: AtomicU64::new(0)}
    }

    pub fn context(&self) -> &Arc<SubfilingContext> {
        &self.ctx
    }

    pub fn file_id(&self) -> u64 {
        self.ctx.file_id()
    }

    pub fn eoa(&self) -> u64 {
        self.eoa.load(Ordering::Relaxed)
    }

    /// Set the end of allocation.  I/O may not extend past it.
    pub fn set_eoa(&self, addr: u64) {
        self.eoa.store(addr, Ordering::Relaxed);
    }

    fn check_range(&self, addr: u64, len: usize) -> Result<()> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.eoa() => Ok(()),
            _ => Err(Error::EOVERFLOW)
        }
    }

    /// Write `buf` at logical address `addr`
    pub async fn write(&self, addr: u64, buf: IoVec) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::EINVAL);
        }
        self.check_range(addr, buf.len())?;
        rpc::write(&self.ctx, addr, buf).await
    }

    /// Fill `buf` from logical address `addr`.  Unwritten regions read as
    /// zeros.
    pub async fn read(&self, addr: u64, buf: IoVecMut) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_range(addr, buf.len())?;
        rpc::read(&self.ctx, addr, buf).await
    }

    /// Write several buffers.
    ///
    /// `sizes` may be shorter than `addrs`: a size of zero, or a missing size,
    /// repeats the previous size from there on.  Each buffer must hold at
    /// least its size, and only that many bytes are written.
    pub async fn write_vector(
        &self,
        addrs: &[u64],
        sizes: &[usize],
        bufs: Vec<IoVec>
    ) -> Result<()>
    {
        if addrs.len() != bufs.len() || sizes.first() == Some(&0) {
            return Err(Error::EINVAL);
        }
        let sizes = expand_sizes(sizes, addrs.len())?;
        for ((&addr, &size), buf) in addrs.iter().zip(sizes.iter()).zip(bufs)
        {
            if buf.len() < size {
                return Err(Error::EINVAL);
            }
            self.check_range(addr, size)?;
            let mut buf = buf;
            self.write(addr, buf.split_to(size)).await?;
        }
        Ok(())
    }

    /// Read into several buffers.  `sizes` works as for
    /// [`write_vector`](Self::write_vector).
    pub async fn read_vector(
        &self,
        addrs: &[u64],
        sizes: &[usize],
        bufs: Vec<IoVecMut>
    ) -> Result<()>
    {
        if addrs.len() != bufs.len() {
            return Err(Error::EINVAL);
        }
        let sizes = expand_sizes(sizes, addrs.len())?;
        for ((&addr, &size), buf) in addrs.iter().zip(sizes.iter()).zip(bufs)
        {
            if buf.len() < size {
                return Err(Error::EINVAL);
            }
            self.check_range(addr, size)?;
            let mut buf = buf;
            self.read(addr, buf.split_to(size)).await?;
        }
        Ok(())
    }

    /// The logical end of file, as determined by the sizes of the subfiles
    #[instrument(skip(self), fields(file_id = self.file_id()))]
    pub async fn eof(&self) -> Result<u64> {
        let geometry = *self.ctx.geometry();
        let sizes = (0..geometry.num_subfiles()).map(|k| {
            let ctx = &self.ctx;
            async move {
                let size = rpc::subfile_size(ctx, k).await?;
                Ok::<u64, Error>(geometry.logical_eof(k, size))
            }
        });
        let eofs = try_join_all(sizes).await?;
        Ok(eofs.into_iter().max().unwrap_or(0))
    }

    /// Collectively truncate the logical file to `len` bytes
    #[instrument(skip(self), fields(file_id = self.file_id()))]
    pub async fn truncate(&self, len: u64) -> Result<()> {
        let comm = self.ctx.file_comm();
        // Wait for every rank's outstanding I/O
        comm::barrier(comm).await?;
        let r = if comm.rank() == 0 {
            let geometry = self.ctx.geometry();
            let futs = (0..geometry.num_subfiles()).map(|k| {
                rpc::truncate_subfile(&self.ctx, k, geometry.subfile_len(k, len))
            });
            Some(try_join_all(futs).await.map(drop))
        } else {
            None
        };
        comm::bcast(comm, 0, r).await?
    }

    /// Collectively close the file.  The last close of a context stops its
    /// IOC.
    #[instrument(skip(self), fields(file_id = self.file_id()))]
    pub async fn close(self) -> Result<()> {
        let comm = self.ctx.file_comm();
        comm::barrier(comm).await?;
        let ioc = self.subfiling.inner.registry.lock()
            .map_err(|_| Error::EIO)?
            .release(self.id)?;
        if let Some(ioc) = ioc {
            ioc.shutdown().await?;
        }
        // Don't let any rank race ahead and reopen the file before its IOCs
        // have stopped.
        comm::barrier(comm).await
    }
}

// LCOV_EXCL_STOP
