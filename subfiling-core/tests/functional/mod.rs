// vim: tw=80
//! Multi-rank tests of whole logical files, using in-process ranks

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use divbuf::DivBufShared;
use futures::future::join_all;
use tempfile::{Builder, TempDir};

use subfiling_core::{
    comm::{self, Comm},
    config::{Env, SubfilingConfig},
    file::{OpenFlags, Subfiling, SubfilingFile},
    local_comm::LocalWorld,
    topology::IocSelection,
    Result,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// Helper to describe a world of ranks and the file they share
#[derive(Clone, Debug)]
struct WorldBuilder {
    /// Node of each rank
    placement: Vec<usize>,
    config: SubfilingConfig,
    env: Vec<(String, String)>,
}

impl WorldBuilder {
    fn new(ranks: usize) -> Self {
        let config = SubfilingConfig {
            stripe_size: Some(1024),
            thread_pool_size: 2,
            ..Default::default()
        };
        WorldBuilder {
            placement: vec![0; ranks],
            config,
            env: Vec::new()
        }
    }

    fn env(&mut self, key: &str, value: &str) -> &mut Self {
        self.env.push((key.to_owned(), value.to_owned()));
        self
    }

    fn iocs(&mut self, selection: IocSelection) -> &mut Self {
        self.config.ioc_selection = selection;
        self
    }

    fn placement(&mut self, placement: Vec<usize>) -> &mut Self {
        self.placement = placement;
        self
    }

    fn stripe_size(&mut self, stripe_size: Option<u64>) -> &mut Self {
        self.config.stripe_size = stripe_size;
        self
    }

    fn subfiles(&mut self, n: usize) -> &mut Self {
        self.config.stripe_count = Some(n);
        self
    }

    /// Run `f` on every rank concurrently.  Results are in rank order.
    async fn run<F, Fut, T>(&self, path: &Path, f: F) -> Vec<T>
        where F: Fn(Peer) -> Fut,
              Fut: Future<Output=T>
    {
        let world = LocalWorld::with_placement(self.placement.clone());
        let env: Env = self.env.iter().cloned().collect();
        let ranks = world.comms().into_iter().map(|comm| {
            f(Peer {
                comm,
                subfiling: Subfiling::new(),
                config: self.config.clone(),
                env: env.clone(),
                path: path.to_owned()
            })
        });
        join_all(ranks).await
    }
}

/// One rank's handles
#[derive(Clone)]
struct Peer {
    comm: Arc<dyn Comm>,
    subfiling: Subfiling,
    config: SubfilingConfig,
    env: Env,
    path: PathBuf,
}

impl Peer {
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    async fn open(&self, flags: OpenFlags) -> Result<SubfilingFile> {
        self.subfiling.open(self.comm.clone(), &self.path, flags, &self.config,
                            &self.env).await
    }

    async fn barrier(&self) {
        t!(comm::barrier(&*self.comm).await);
    }
}

fn tempdir() -> TempDir {
    t!(Builder::new().prefix("subfiling_functional_test").tempdir())
}

/// Recognizable contents for a buffer
fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

async fn write_at(f: &SubfilingFile, addr: u64, data: &[u8]) {
    let dbs = DivBufShared::from(data.to_vec());
    t!(f.write(addr, dbs.try_const().unwrap()).await);
}

async fn read_at(f: &SubfilingFile, addr: u64, len: usize) -> Vec<u8> {
    let dbs = DivBufShared::from(vec![0xffu8; len]);
    t!(f.read(addr, dbs.try_mut().unwrap()).await);
    dbs.try_const().unwrap().to_vec()
}

mod io;
mod layout;
mod lifecycle;
