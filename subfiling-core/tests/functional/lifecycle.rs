// vim: tw=80
//! Opening, truncating, closing, and deleting

use std::fs;

use pretty_assertions::assert_eq;
use rstest::rstest;

use subfiling_core::{
    config::SubfilingConfig,
    file::{self, OpenFlags},
    topology::IocSelection,
    Error,
};

use super::*;

/// Truncating to the current size changes nothing
#[tokio::test]
async fn truncate_idempotent() {
    let dir = tempdir();
    let path = dir.path().join("t.h5");
    let sizes = WorldBuilder::new(3)
        .iocs(IocSelection::Total(3))
        .subfiles(3)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(1 << 16);
            if p.rank() == 2 {
                write_at(&f, 0, &pattern(2, 5000)).await;
            }
            p.barrier().await;
            assert_eq!(t!(f.eof().await), 5000);
            t!(f.truncate(5000).await);
            t!(f.truncate(5000).await);
            assert_eq!(t!(f.eof().await), 5000);
            assert_eq!(read_at(&f, 0, 5000).await, pattern(2, 5000));
            let paths = (0..3).map(|k| f.context().subfile_path(k))
                .collect::<Vec<_>>();
            t!(f.close().await);
            paths.iter()
                .map(|p| t!(fs::metadata(p)).len())
                .collect::<Vec<_>>()
        }).await;
    // 5000 bytes are 4 full stripes and 904 more
    assert_eq!(sizes[0], vec![2048, 1024 + 904, 1024]);
}

/// Truncation can shrink or extend the file.  Truncated data reads as zeros
/// when the file is extended again.
#[rstest]
#[case::shrink(2500, 2500)]
#[case::extend(9000, 9000)]
#[case::empty(0, 0)]
#[tokio::test]
async fn truncate(#[case] len: u64, #[case] eof: u64) {
    let dir = tempdir();
    let path = dir.path().join("t.h5");
    WorldBuilder::new(2)
        .iocs(IocSelection::Total(2))
        .subfiles(2)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(1 << 16);
            let data = pattern(4, 4000);
            if p.rank() == 0 {
                write_at(&f, 0, &data).await;
            }
            t!(f.truncate(len).await);
            assert_eq!(t!(f.eof().await), eof);
            let kept = (len as usize).min(4000);
            let back = read_at(&f, 0, 4000).await;
            assert_eq!(&back[..kept], &data[..kept]);
            assert!(back[kept..].iter().all(|&b| b == 0));
            t!(f.close().await);
        }).await;
}

/// A file can be reopened with its recorded configuration, even by a
/// differently shaped world
#[tokio::test]
async fn reopen() {
    let dir = tempdir();
    let path = dir.path().join("r.h5");
    let data = pattern(6, 6000);
    WorldBuilder::new(4)
        .iocs(IocSelection::Total(2))
        .subfiles(4)
        .run(&path, |p| {
            let data = data.clone();
            async move {
                let f = t!(p.open(OpenFlags::create()).await);
                f.set_eoa(1 << 16);
                if p.rank() == 3 {
                    write_at(&f, 10, &data).await;
                }
                t!(f.close().await);
            }
        }).await;

    WorldBuilder::new(2)
        .stripe_size(None)
        .iocs(IocSelection::Total(1))
        .run(&path, |p| {
            let data = data.clone();
            async move {
                let f = t!(p.open(OpenFlags::existing()).await);
                let ctx = f.context();
                assert_eq!(ctx.geometry().stripe_size(), 1024);
                assert_eq!(ctx.geometry().num_subfiles(), 4);
                assert_eq!(ctx.topology().n_iocs(), 1);
                assert_eq!(t!(f.eof().await), 6010);
                f.set_eoa(1 << 16);
                assert_eq!(read_at(&f, 10, 6000).await, data);
                t!(f.close().await);
            }
        }).await;
}

/// Creating over an existing file discards its contents
#[tokio::test]
async fn recreate() {
    let dir = tempdir();
    let path = dir.path().join("c.h5");
    let builder = WorldBuilder::new(2);
    builder.run(&path, |p| async move {
        let f = t!(p.open(OpenFlags::create()).await);
        f.set_eoa(4096);
        if p.rank() == 1 {
            write_at(&f, 0, &pattern(1, 3000)).await;
        }
        t!(f.close().await);
    }).await;
    builder.run(&path, |p| async move {
        let f = t!(p.open(OpenFlags::create()).await);
        assert_eq!(t!(f.eof().await), 0);
        t!(f.close().await);
    }).await;
}

/// Explicitly requesting a different stripe size than the file was created
/// with fails on every rank
#[tokio::test]
async fn config_mismatch() {
    let dir = tempdir();
    let path = dir.path().join("m.h5");
    WorldBuilder::new(2).run(&path, |p| async move {
        t!(t!(p.open(OpenFlags::create()).await).close().await);
    }).await;
    let r = WorldBuilder::new(2)
        .stripe_size(Some(4096))
        .run(&path, |p| async move {
            let r = p.open(OpenFlags::existing()).await.map(drop);
            (r, p.subfiling.open_contexts())
        }).await;
    assert_eq!(r, vec![(Err(Error::EINVAL), 0), (Err(Error::EINVAL), 0)]);
}

/// If any IOC fails to open its subfiles, the open fails everywhere
#[test_log::test(tokio::test)]
async fn missing_subfile() {
    let dir = tempdir();
    let path = dir.path().join("x.h5");
    let builder = {
        let mut b = WorldBuilder::new(2);
        b.iocs(IocSelection::Total(2)).subfiles(2);
        b
    };
    let victims = builder.run(&path, |p| async move {
        let f = t!(p.open(OpenFlags::create()).await);
        let victim = f.context().subfile_path(1);
        t!(f.close().await);
        victim
    }).await;
    t!(fs::remove_file(&victims[0]));
    let r = builder.run(&path, |p| async move {
        let r = p.open(OpenFlags::existing()).await.map(drop);
        (r, p.subfiling.open_contexts())
    }).await;
    // Rank 1 is the IOC that owns the missing subfile
    assert_eq!(r, vec![(Err(Error::EIO), 0), (Err(Error::ENOENT), 0)]);
}

/// Opening a file twice on every rank shares one context and one set of IOCs
#[test_log::test(tokio::test)]
async fn open_twice() {
    let dir = tempdir();
    let path = dir.path().join("twice.h5");
    WorldBuilder::new(2)
        .iocs(IocSelection::Total(2))
        .run(&path, |p| async move {
            let f1 = t!(p.open(OpenFlags::create()).await);
            let f2 = t!(p.open(OpenFlags::existing()).await);
            assert!(Arc::ptr_eq(f1.context(), f2.context()));
            assert_eq!(p.subfiling.open_contexts(), 1);
            f1.set_eoa(4096);
            f2.set_eoa(4096);
            if p.rank() == 0 {
                write_at(&f1, 0, &pattern(8, 2000)).await;
            }
            p.barrier().await;
            assert_eq!(read_at(&f2, 0, 2000).await, pattern(8, 2000));
            t!(f1.close().await);
            assert_eq!(read_at(&f2, 0, 2000).await, pattern(8, 2000));
            t!(f2.close().await);
            assert_eq!(p.subfiling.open_contexts(), 0);
        }).await;
}

#[tokio::test]
async fn delete() {
    let dir = tempdir();
    let path = dir.path().join("d.h5");
    let config = SubfilingConfig {
        stripe_size: Some(1024),
        ..Default::default()
    };
    let paths = WorldBuilder::new(3)
        .iocs(IocSelection::Total(3))
        .run(&path, |p| {
            let config = config.clone();
            async move {
                let f = t!(p.open(OpenFlags::create()).await);
                let ctx = f.context().clone();
                t!(f.close().await);
                t!(file::delete(&*p.comm, &p.path, &config).await);
                let mut paths = (0..3).map(|k| ctx.subfile_path(k))
                    .collect::<Vec<_>>();
                paths.push(ctx.config_path());
                paths
            }
        }).await;
    assert!(!path.exists());
    for p in paths[0].iter() {
        assert!(!p.exists(), "{} still exists", p.display());
    }
    assert_eq!(t!(fs::read_dir(dir.path())).count(), 0);
}
