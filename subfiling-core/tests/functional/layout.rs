// vim: tw=80
//! Where the bytes land

use std::fs;

use pretty_assertions::assert_eq;

use subfiling_core::{
    config::{env_var, ConfigFile},
    file::OpenFlags,
    topology::IocSelection,
};

use super::*;

/// 4 subfiles served by 2 IOCs.  A full stripe row puts one stripe in each
/// subfile.
#[tokio::test]
async fn four_subfiles_two_iocs() {
    let dir = tempdir();
    let path = dir.path().join("f.h5");
    let data = pattern(3, 4096);
    let subfiles = WorldBuilder::new(4)
        .iocs(IocSelection::Total(2))
        .subfiles(4)
        .run(&path, |p| {
            let data = data.clone();
            async move {
                let f = t!(p.open(OpenFlags::create()).await);
                let ctx = f.context().clone();
                assert_eq!(ctx.topology().io_concentrators(), &[0, 3]);
                match ctx.topology().ioc_idx() {
                    Some(0) => assert_eq!(ctx.owned_subfiles(), &[0, 2]),
                    Some(1) => assert_eq!(ctx.owned_subfiles(), &[1, 3]),
                    _ => assert!(ctx.owned_subfiles().is_empty())
                }
                assert_eq!(ctx.ioc_for_subfile(2), (0, 0));
                assert_eq!(ctx.ioc_for_subfile(3), (1, 3));
                f.set_eoa(4096);
                if p.rank() == 1 {
                    write_at(&f, 0, &data).await;
                }
                p.barrier().await;
                assert_eq!(t!(f.eof().await), 4096);
                t!(f.close().await);
                (0..4).map(|k| ctx.subfile_path(k)).collect::<Vec<_>>()
            }
        }).await;
    for (k, sf) in subfiles[0].iter().enumerate() {
        let contents = t!(fs::read(sf));
        assert_eq!(&contents[..], &data[k * 1024..(k + 1) * 1024]);
    }
    let names = subfiles[0].iter()
        .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
        .collect::<Vec<_>>();
    assert!(names[0].starts_with("f.h5.subfile_"));
    assert!(names[0].ends_with("_1_of_4"));
    assert!(names[3].ends_with("_4_of_4"));
}

/// With a single subfile, logical and subfile addresses coincide
#[tokio::test]
async fn single_subfile() {
    let dir = tempdir();
    let path = dir.path().join("one.h5");
    let data = pattern(9, 2048);
    let subfiles = WorldBuilder::new(2)
        .iocs(IocSelection::Total(1))
        .run(&path, |p| {
            let data = data.clone();
            async move {
                let f = t!(p.open(OpenFlags::create()).await);
                assert_eq!(f.context().geometry().num_subfiles(), 1);
                f.set_eoa(4096);
                if p.rank() == 0 {
                    write_at(&f, 512, &data).await;
                }
                p.barrier().await;
                assert_eq!(t!(f.eof().await), 2560);
                let sf = f.context().subfile_path(0);
                t!(f.close().await);
                sf
            }
        }).await;
    let contents = t!(fs::read(&subfiles[1]));
    assert_eq!(contents.len(), 2560);
    assert!(contents[..512].iter().all(|&b| b == 0));
    assert_eq!(&contents[512..], &data[..]);
}

/// One IOC on each node
#[tokio::test]
async fn one_per_node() {
    let dir = tempdir();
    let path = dir.path().join("nodes.h5");
    let data = pattern(5, 5000);
    WorldBuilder::new(4)
        .placement(vec![0, 0, 1, 1])
        .iocs(IocSelection::OnePerNode(1))
        .run(&path, |p| {
            let data = data.clone();
            async move {
                let f = t!(p.open(OpenFlags::create()).await);
                let topo = f.context().topology().clone();
                assert_eq!(topo.node_count(), 2);
                assert_eq!(topo.io_concentrators(), &[0, 2]);
                assert_eq!(topo.rank_is_ioc(), p.rank() % 2 == 0);
                assert_eq!(f.context().geometry().num_subfiles(), 2);
                f.set_eoa(1 << 16);
                if p.rank() == 3 {
                    write_at(&f, 100, &data).await;
                }
                p.barrier().await;
                assert_eq!(read_at(&f, 100, 5000).await, data);
                t!(f.close().await);
            }
        }).await;
}

/// Environment variables override the striping configuration of a new file
#[tokio::test]
async fn env_overrides() {
    let dir = tempdir();
    let subdir = tempdir();
    let path = dir.path().join("env.h5");
    let prefix = subdir.path().to_str().unwrap().to_owned();
    let ctxs = WorldBuilder::new(2)
        .stripe_size(None)
        .env(env_var::STRIPE_SIZE, "0x800")
        .env(env_var::IOC_SELECTION_CRITERIA, "3:2")
        .env(env_var::SUBFILE_PREFIX, &prefix)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            let ctx = f.context().clone();
            t!(f.close().await);
            ctx
        }).await;
    let ctx = &ctxs[0];
    assert_eq!(ctx.geometry().stripe_size(), 2048);
    assert_eq!(ctx.topology().n_iocs(), 2);
    assert_eq!(ctx.subfile_dir(), subdir.path());
    assert!(ctx.subfile_path(0).starts_with(subdir.path()));
    assert!(ctx.subfile_path(1).exists());
    // The configuration file follows the subfiles by default
    let cf = t!(ConfigFile::read(&ctx.config_path())).unwrap();
    assert_eq!(cf.stripe_size, 2048);
    assert_eq!(cf.subfile_count, 2);
    assert_eq!(cf.aggregator_count, 2);
    // The stub file stays where the caller put it
    assert!(path.exists());
}
