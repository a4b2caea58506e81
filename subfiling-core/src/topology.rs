// vim: tw=80
//! Discovery of process placement, and selection of I/O concentrators
//!
//! Every rank contributes its own placement information.  After an allgather,
//! every rank holds an identical, sorted picture of the whole application, so
//! each rank can independently walk it and arrive at the same list of I/O
//! concentrators.

use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
};
use tracing::{debug, warn};
use crate::{
    comm::{self, Comm, GroupId},
    types::*,
};

/// Policy for choosing which ranks become I/O concentrators
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IocSelection {
    /// Use the first `n` ranks of every node
    OnePerNode(usize),
    /// Use every `n`th rank, starting with rank 0
    EveryNthRank(usize),
    /// Use `n` ranks in total, spread evenly
    Total(usize),
}

impl IocSelection {
    /// Numeric code of each policy, as used by the selection environment
    /// variable
    pub fn from_code(code: i64, value: usize) -> Result<Self> {
        match code {
            0 => Ok(IocSelection::OnePerNode(value)),
            1 => Ok(IocSelection::EveryNthRank(value)),
            3 => Ok(IocSelection::Total(value)),
            _ => Err(Error::EINVAL)
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            IocSelection::OnePerNode(_) => 0,
            IocSelection::EveryNthRank(_) => 1,
            IocSelection::Total(_) => 3,
        }
    }

    pub fn value(&self) -> usize {
        match *self {
            IocSelection::OnePerNode(n) => n,
            IocSelection::EveryNthRank(n) => n,
            IocSelection::Total(n) => n,
        }
    }

    fn same_policy(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl Default for IocSelection {
    fn default() -> Self {
        IocSelection::OnePerNode(1)
    }
}

impl fmt::Display for IocSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code(), self.value())
    }
}

/// One rank's placement, as shared with all other ranks
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LayoutEntry {
    pub rank: Rank,
    pub node_local_rank: Rank,
    pub node_local_size: usize,
    pub node_lead_rank: Rank,
}

/// Placement of every rank in the application
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppLayout {
    world_rank: Rank,
    /// Sorted by node, then by rank within the node
    layout: Vec<LayoutEntry>,
    /// Lead rank of every node, in node order
    node_ranks: Vec<Rank>,
}

impl AppLayout {
    pub fn new(world_rank: Rank, mut layout: Vec<LayoutEntry>) -> Result<Self>
    {
        layout.sort_by_key(|e| (e.node_lead_rank, e.node_local_rank));
        let node_ranks = layout.iter()
            .filter(|e| e.node_local_rank == 0)
            .map(|e| e.rank)
            .collect::<Vec<_>>();
        if node_ranks.is_empty() {
            return Err(Error::EINVAL);
        }
        Ok(AppLayout{world_rank, layout, node_ranks})
    }

    pub fn node_count(&self) -> usize {
        self.node_ranks.len()
    }

    pub fn world_size(&self) -> usize {
        self.layout.len()
    }
}

/// The result of resolving a selection policy against an `AppLayout`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    group: GroupId,
    layout: AppLayout,
    selection: IocSelection,
    /// World ranks of the I/O concentrators, indexed by IOC index
    io_concentrators: Vec<Rank>,
    /// This rank's index in `io_concentrators`, if it is one
    ioc_idx: Option<usize>,
}

impl Topology {
    /// Build a `Topology` from an already-gathered layout.
    ///
    /// If `stripe_count` is `Some`, the number of concentrators will never
    /// exceed it.
    pub fn from_layout(
        group: GroupId,
        layout: AppLayout,
        selection: IocSelection,
        stripe_count: Option<usize>
    ) -> Result<Self>
    {
        let world_size = layout.world_size();
        let (mut max_iocs, stride) = match selection {
            IocSelection::OnePerNode(0) |
            IocSelection::EveryNthRank(0) |
            IocSelection::Total(0) => return Err(Error::EINVAL),
            IocSelection::OnePerNode(per_node) => {
                (per_node * layout.node_count(), 1)
            },
            IocSelection::EveryNthRank(n) => {
                let n = n.min(world_size);
                ((world_size - 1) / n + 1, n)
            },
            IocSelection::Total(n) => {
                let n = n.min(world_size);
                let stride = if n > 1 { (world_size - 1) / (n - 1) } else { 1 };
                (n, stride)
            }
        };
        if let Some(sc) = stripe_count {
            if sc == 0 {
                return Err(Error::EINVAL);
            }
            max_iocs = max_iocs.min(sc);
        }

        let io_concentrators = match selection {
            IocSelection::OnePerNode(_) => Self::pick_per_node(&layout, max_iocs),
            _ => Self::pick_strided(&layout, max_iocs, stride)
        };
        if io_concentrators.len() != max_iocs {
            warn!(from = max_iocs, to = io_concentrators.len(),
                "Number of I/O concentrators adjusted");
        }
        let ioc_idx = io_concentrators.iter()
            .position(|&r| r == layout.world_rank);
        Ok(Topology{group, layout, selection, io_concentrators, ioc_idx})
    }

    fn pick_per_node(layout: &AppLayout, max_iocs: usize) -> Vec<Rank> {
        let node_count = layout.node_count();
        let iocs_per_node = if max_iocs > node_count {
            max_iocs / node_count
        } else {
            1
        };
        let mut iocs = Vec::with_capacity(max_iocs);
        let mut idx = 0;
        while idx < layout.layout.len() && iocs.len() < max_iocs {
            let first = &layout.layout[idx];
            let mut j = 0;
            while j < iocs_per_node && j < first.node_local_size &&
                iocs.len() < max_iocs
            {
                let e = &layout.layout[idx + j];
                debug_assert_eq!(e.node_lead_rank, first.node_lead_rank);
                iocs.push(e.rank);
                j += 1;
            }
            // Skip to the next node
            while idx < layout.layout.len() &&
                layout.layout[idx].node_lead_rank == first.node_lead_rank
            {
                idx += 1;
            }
        }
        iocs
    }

    fn pick_strided(layout: &AppLayout, max_iocs: usize, stride: usize)
        -> Vec<Rank>
    {
        layout.layout.iter()
            .step_by(stride)
            .take(max_iocs)
            .map(|e| e.rank)
            .collect()
    }

    /// Collectively discover the layout of `comm` and resolve `selection`
    /// against it.
    pub async fn resolve(
        comm: &dyn Comm,
        selection: IocSelection,
        stripe_count: Option<usize>
    ) -> Result<Self>
    {
        let node = comm.node();
        let me = LayoutEntry {
            rank: comm.rank(),
            node_local_rank: node.local_rank,
            node_local_size: node.local_size,
            node_lead_rank: node.lead_rank
        };
        let entries = comm::allgather(comm, me).await?;
        let layout = AppLayout::new(comm.rank(), entries)?;
        let topo = Topology::from_layout(comm.group(), layout, selection,
                                         stripe_count)?;
        debug!(iocs = ?topo.io_concentrators, ioc_idx = ?topo.ioc_idx,
               %selection, "resolved topology");
        Ok(topo)
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// World ranks of the I/O concentrators
    pub fn io_concentrators(&self) -> &[Rank] {
        &self.io_concentrators[..]
    }

    /// This rank's index among the I/O concentrators, if it is one
    pub fn ioc_idx(&self) -> Option<usize> {
        self.ioc_idx
    }

    pub fn n_iocs(&self) -> usize {
        self.io_concentrators.len()
    }

    pub fn node_count(&self) -> usize {
        self.layout.node_count()
    }

    pub fn rank_is_ioc(&self) -> bool {
        self.ioc_idx.is_some()
    }

    pub fn selection(&self) -> IocSelection {
        self.selection
    }

    pub fn world_rank(&self) -> Rank {
        self.layout.world_rank
    }

    pub fn world_size(&self) -> usize {
        self.layout.world_size()
    }

    /// Could this topology be reused for a file opened with these parameters?
    fn matches(
        &self,
        group: GroupId,
        selection: IocSelection,
        stripe_count: Option<usize>
    ) -> bool
    {
        if group != self.group || !selection.same_policy(&self.selection) {
            return false;
        }
        if stripe_count.map(|sc| sc < self.n_iocs()).unwrap_or(false) {
            return false;
        }
        match selection {
            IocSelection::OnePerNode(per_node) => {
                // An earlier stripe count may have capped the IOC count
                self.n_iocs() == per_node * self.node_count()
            },
            _ => selection == self.selection
        }
    }
}

/// Shares `Topology` objects between files that use the same process group
/// and selection policy.
///
/// The cache doesn't keep topologies alive.  Once every file using one has
/// closed, it is dropped.
#[derive(Debug, Default)]
pub struct TopologyCache {
    entries: Mutex<Vec<Weak<Topology>>>
}

impl TopologyCache {
    fn lookup(
        &self,
        group: GroupId,
        selection: IocSelection,
        stripe_count: Option<usize>
    ) -> Result<Option<Arc<Topology>>>
    {
        let mut entries = self.entries.lock().map_err(|_| Error::EIO)?;
        entries.retain(|w| w.strong_count() > 0);
        Ok(entries.iter()
            .filter_map(Weak::upgrade)
            .find(|t| t.matches(group, selection, stripe_count)))
    }

    /// Return a cached topology or collectively resolve a new one.
    ///
    /// Every rank of `comm` must have the same cache history, so that they
    /// all agree on whether a collective resolution is needed.
    pub async fn get(
        &self,
        comm: &dyn Comm,
        selection: IocSelection,
        stripe_count: Option<usize>
    ) -> Result<Arc<Topology>>
    {
        if let Some(t) = self.lookup(comm.group(), selection, stripe_count)? {
            return Ok(t);
        }
        let topo = Arc::new(Topology::resolve(comm, selection, stripe_count)
                            .await?);
        self.entries.lock()
            .map_err(|_| Error::EIO)?
            .push(Arc::downgrade(&topo));
        Ok(topo)
    }

    /// Number of live topologies
    pub fn len(&self) -> usize {
        self.entries.lock()
            .map(|e| e.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// LCOV_EXCL_STOP
