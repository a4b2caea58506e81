// vim: tw=80
//! Per-file subfiling state, and the registry that owns it

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::sync::Mutex as AsyncMutex;
use crate::{
    comm::Comm,
    config::{config_file_name, subfile_name},
    ioc::IocHandle,
    stripe::StripeGeometry,
    topology::Topology,
    types::*,
};

/// Everything one rank knows about one open logical file
pub struct SubfilingContext {
    file_id: u64,
    /// Path of the logical file
    path: PathBuf,
    /// The logical file's final path component
    base: String,
    geometry: StripeGeometry,
    topology: Arc<Topology>,
    subfile_dir: PathBuf,
    config_dir: PathBuf,
    /// Subfiles served by this rank's I/O concentrator, if it is one
    owned: Vec<SubfileIdx>,
    /// Logical offset of this rank's IOC's first stripe
    base_addr: u64,
    /// Largest logical offset written through this rank's IOC
    eof: Mutex<u64>,
    file_comm: Arc<dyn Comm>,
    msg_comm: Arc<dyn Comm>,
    data_comm: Arc<dyn Comm>,
    /// Serializes request/acknowledgement handshakes with each IOC, so that
    /// acknowledgements can't be confused
    ioc_locks: Vec<AsyncMutex<()>>,
    thread_pool_size: usize,
}

impl fmt::Debug for SubfilingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubfilingContext")
            .field("file_id", &self.file_id)
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .field("topology", &self.topology)
            .field("owned", &self.owned)
            .finish_non_exhaustive()
    }
}

/// The subfiles served by IOC `ioc_idx`.  Subfiles are assigned round-robin.
pub fn owned_subfiles(num_subfiles: usize, n_iocs: usize, ioc_idx: usize)
    -> Vec<SubfileIdx>
{
    (ioc_idx..num_subfiles).step_by(n_iocs).collect()
}

impl SubfilingContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_id: u64,
        path: &Path,
        geometry: StripeGeometry,
        topology: Arc<Topology>,
        subfile_dir: PathBuf,
        config_dir: PathBuf,
        comms: [Arc<dyn Comm>; 3],
        thread_pool_size: usize
    ) -> Result<Self>
    {
        let n_iocs = topology.n_iocs();
        if n_iocs == 0 || geometry.num_subfiles() < n_iocs {
            return Err(Error::EINVAL);
        }
        let base = crate::config::base_name(path)?;
        let (owned, base_addr) = match topology.ioc_idx() {
            Some(idx) => (
                owned_subfiles(geometry.num_subfiles(), n_iocs, idx),
                idx as u64 * geometry.stripe_size()
            ),
            None => (Vec::new(), 0)
        };
        let [file_comm, msg_comm, data_comm] = comms;
        let ioc_locks = (0..n_iocs).map(|_| AsyncMutex::new(())).collect();
        Ok(SubfilingContext {
            file_id,
            path: path.to_owned(),
            base,
            geometry,
            topology,
            subfile_dir,
            config_dir,
            owned,
            base_addr,
            eof: Mutex::new(0),
            file_comm,
            msg_comm,
            data_comm,
            ioc_locks,
            thread_pool_size,
        })
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> &StripeGeometry {
        &self.geometry
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn block_size(&self) -> u64 {
        self.geometry.block_size()
    }

    /// Subfiles served by this rank
    pub fn owned_subfiles(&self) -> &[SubfileIdx] {
        &self.owned[..]
    }

    pub fn subfile_dir(&self) -> &Path {
        &self.subfile_dir
    }

    /// Path of one subfile.  `idx` is 0-based.
    pub fn subfile_path(&self, idx: SubfileIdx) -> PathBuf {
        let n = self.geometry.num_subfiles();
        self.subfile_dir.join(subfile_name(&self.base, self.file_id, idx + 1, n))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(config_file_name(&self.base, self.file_id))
    }

    /// Collective communicator for the file
    pub fn file_comm(&self) -> &dyn Comm {
        &*self.file_comm
    }

    /// Communicator on which clients send requests to IOCs
    pub fn msg_comm(&self) -> &Arc<dyn Comm> {
        &self.msg_comm
    }

    /// Communicator for acknowledgements, payloads, and replies
    pub fn data_comm(&self) -> &Arc<dyn Comm> {
        &self.data_comm
    }

    /// The IOC index and world rank serving a subfile
    pub fn ioc_for_subfile(&self, subfile: SubfileIdx) -> (usize, Rank) {
        let ioc = subfile % self.topology.n_iocs();
        (ioc, self.topology.io_concentrators()[ioc])
    }

    pub(crate) fn ioc_lock(&self, ioc: usize) -> &AsyncMutex<()> {
        &self.ioc_locks[ioc]
    }

    /// When every IOC serves exactly one subfile (or there is only one
    /// subfile), read payloads travel on a single static tag and the
    /// acknowledgement round trip is skipped.
    pub fn static_read_tag(&self) -> bool {
        let n = self.geometry.num_subfiles();
        n == 1 || n == self.topology.n_iocs()
    }

    pub fn thread_pool_size(&self) -> usize {
        self.thread_pool_size
    }

    /// Largest logical offset written through this rank's IOC
    pub fn eof(&self) -> u64 {
        self.eof.lock().map(|g| *g).unwrap_or(0)
    }

    /// Record that data has been written up to `end`, if that is further
    /// than anything previously recorded
    pub fn update_eof(&self, end: u64) {
        if let Ok(mut eof) = self.eof.lock() {
            if end > *eof {
                *eof = end;
            }
        }
    }
}

/// Opaque handle to a context in a [`ContextRegistry`]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ContextId(usize);

#[derive(Debug)]
struct Entry {
    ctx: Arc<SubfilingContext>,
    ioc: Option<IocHandle>,
    refs: usize,
}

/// Owns every open context in the process.
///
/// Contexts live in an arena and are addressed by `ContextId`.  A context is
/// reference counted by the file handles using it, and is removed when the
/// last one releases it.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    by_file_id: HashMap<u64, ContextId>,
}

impl ContextRegistry {
    /// Add a new context with one reference
    pub fn insert(&mut self, ctx: Arc<SubfilingContext>, ioc: Option<IocHandle>)
        -> ContextId
    {
        let file_id = ctx.file_id();
        let entry = Entry{ctx, ioc, refs: 1};
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            },
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        let id = ContextId(idx);
        self.by_file_id.insert(file_id, id);
        id
    }

    pub fn get(&self, id: ContextId) -> Option<&Arc<SubfilingContext>> {
        self.slots.get(id.0)
            .and_then(Option::as_ref)
            .map(|e| &e.ctx)
    }

    /// Take another reference to the context for an already-open file
    pub fn acquire_file(&mut self, file_id: u64)
        -> Option<(ContextId, Arc<SubfilingContext>)>
    {
        let id = *self.by_file_id.get(&file_id)?;
        let entry = self.slots.get_mut(id.0)?.as_mut()?;
        entry.refs += 1;
        Some((id, entry.ctx.clone()))
    }

    /// Drop one reference.  If it was the last, remove the context and
    /// return its IOC, if any, so the caller can shut it down.
    pub fn release(&mut self, id: ContextId) -> Result<Option<IocHandle>> {
        let entry = self.slots.get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::EBADF)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(None);
        }
        let entry = self.slots[id.0].take().ok_or(Error::EBADF)?;
        self.free.push(id.0);
        if self.by_file_id.get(&entry.ctx.file_id()) == Some(&id) {
            self.by_file_id.remove(&entry.ctx.file_id());
        }
        Ok(entry.ioc)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// LCOV_EXCL_STOP
