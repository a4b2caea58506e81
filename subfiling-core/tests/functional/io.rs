// vim: tw=80
//! Reads and writes from many ranks at once

use bytes::Bytes;
use divbuf::DivBufShared;
use pretty_assertions::assert_eq;
use rstest::rstest;

use subfiling_core::{
    comm::{recv_msg, send_msg},
    file::OpenFlags,
    rpc::{done_tag, tag, Ack, IoHeader, WriteDone},
    topology::IocSelection,
    Error,
};

use super::*;

/// Every rank writes its own region, then every rank reads all of them
#[rstest]
#[case::two_iocs(IocSelection::Total(2), 4)]
#[case::every_rank(IocSelection::EveryNthRank(1), 4)]
#[case::one_ioc(IocSelection::Total(1), 1)]
#[tokio::test]
async fn round_trip(#[case] iocs: IocSelection, #[case] subfiles: usize) {
    let dir = tempdir();
    let path = dir.path().join("round_trip.h5");
    let nranks = 4;
    WorldBuilder::new(nranks)
        .iocs(iocs)
        .subfiles(subfiles)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(1 << 20);
            let me = p.rank() as u64;
            write_at(&f, me * 5000 + 100, &pattern(me as u8, 3000)).await;
            p.barrier().await;
            for r in 0..nranks as u64 {
                let data = read_at(&f, r * 5000 + 100, 3000).await;
                assert_eq!(data, pattern(r as u8, 3000));
            }
            assert_eq!(t!(f.eof().await), 3 * 5000 + 100 + 3000);
            // Past the end of file reads zeros
            assert_eq!(read_at(&f, 18100, 100).await, vec![0u8; 100]);
            t!(f.close().await);
        }).await;
}

/// Overlapping writes take effect in the order they were issued, even when
/// issued concurrently
#[test_log::test(tokio::test)]
async fn overlapping_writes() {
    let dir = tempdir();
    let path = dir.path().join("overlap.h5");
    WorldBuilder::new(2)
        .iocs(IocSelection::Total(1))
        .subfiles(1)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(8192);
            let a = pattern(1, 3000);
            let b = pattern(2, 2048);
            if p.rank() == 1 {
                let dbs_a = DivBufShared::from(a.clone());
                let dbs_b = DivBufShared::from(b.clone());
                let (ra, rb) = futures::join!(
                    f.write(0, dbs_a.try_const().unwrap()),
                    f.write(512, dbs_b.try_const().unwrap())
                );
                t!(ra);
                t!(rb);
            }
            p.barrier().await;
            let mut expected = a;
            expected[512..2560].copy_from_slice(&b);
            assert_eq!(read_at(&f, 0, 3000).await, expected);
            t!(f.close().await);
        }).await;
}

/// Writes to disjoint ranges of one subfile, from several ranks at once
#[test_log::test(tokio::test)]
async fn disjoint_writes() {
    let dir = tempdir();
    let path = dir.path().join("disjoint.h5");
    WorldBuilder::new(3)
        .iocs(IocSelection::Total(1))
        .subfiles(1)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(4096);
            match p.rank() {
                1 => write_at(&f, 0, &pattern(1, 100)).await,
                2 => {
                    let lo = DivBufShared::from(pattern(2, 100));
                    let hi = DivBufShared::from(pattern(3, 100));
                    let (rl, rh) = futures::join!(
                        f.write(500, lo.try_const().unwrap()),
                        f.write(700, hi.try_const().unwrap())
                    );
                    t!(rl);
                    t!(rh);
                },
                _ => ()
            }
            p.barrier().await;
            let data = read_at(&f, 0, 800).await;
            assert_eq!(&data[0..100], &pattern(1, 100)[..]);
            assert!(data[100..500].iter().all(|&b| b == 0));
            assert_eq!(&data[500..600], &pattern(2, 100)[..]);
            assert!(data[600..700].iter().all(|&b| b == 0));
            assert_eq!(&data[700..800], &pattern(3, 100)[..]);
            assert_eq!(t!(f.eof().await), 800);
            t!(f.close().await);
        }).await;
}

/// A write that spans several full stripe rows, read back in one piece and in
/// unaligned fragments
#[tokio::test]
async fn multi_row() {
    let dir = tempdir();
    let path = dir.path().join("rows.h5");
    WorldBuilder::new(2)
        .iocs(IocSelection::Total(2))
        .subfiles(3)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(1 << 16);
            let data = pattern(7, 10_000);
            if p.rank() == 0 {
                write_at(&f, 333, &data).await;
            }
            p.barrier().await;
            assert_eq!(read_at(&f, 333, 10_000).await, data);
            let frag = read_at(&f, 333 + 1500, 4000).await;
            assert_eq!(&frag[..], &data[1500..5500]);
            assert_eq!(t!(f.eof().await), 10_333);
            t!(f.close().await);
        }).await;
}

#[tokio::test]
async fn vector() {
    let dir = tempdir();
    let path = dir.path().join("vector.h5");
    let addrs = [0u64, 2000, 5000];
    WorldBuilder::new(2)
        .iocs(IocSelection::Total(2))
        .subfiles(2)
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(8192);
            if p.rank() == 0 {
                // Sizes repeat, so only the first 100 bytes of the last
                // buffer are written
                let dbses = [pattern(1, 100), pattern(2, 100), pattern(3, 150)]
                    .into_iter()
                    .map(DivBufShared::from)
                    .collect::<Vec<_>>();
                let bufs = dbses.iter()
                    .map(|dbs| dbs.try_const().unwrap())
                    .collect::<Vec<_>>();
                t!(f.write_vector(&addrs, &[100], bufs).await);
            }
            p.barrier().await;
            let dbses = (0..3).map(|_| DivBufShared::from(vec![0u8; 100]))
                .collect::<Vec<_>>();
            let bufs = dbses.iter()
                .map(|dbs| dbs.try_mut().unwrap())
                .collect::<Vec<_>>();
            t!(f.read_vector(&addrs, &[100, 0], bufs).await);
            for (i, dbs) in dbses.iter().enumerate() {
                assert_eq!(&dbs.try_const().unwrap()[..],
                           &pattern(i as u8 + 1, 100)[..]);
            }
            assert_eq!(t!(f.eof().await), 5100);
            t!(f.close().await);
        }).await;
}

/// Requests past the allocated address space are rejected without touching
/// any IOC
#[tokio::test]
async fn past_eoa() {
    let dir = tempdir();
    let path = dir.path().join("eoa.h5");
    WorldBuilder::new(2)
        .iocs(IocSelection::Total(2))
        .run(&path, |p| async move {
            let f = t!(p.open(OpenFlags::create()).await);
            f.set_eoa(1000);
            let dbs = DivBufShared::from(vec![0u8; 100]);
            assert_eq!(f.write(950, dbs.try_const().unwrap()).await,
                       Err(Error::EOVERFLOW));
            assert_eq!(f.read(950, dbs.try_mut().unwrap()).await,
                       Err(Error::EOVERFLOW));
            assert_eq!(t!(f.eof().await), 0);
            t!(f.close().await);
        }).await;
}

/// Two ranks that are both IOCs read and write through each other at the
/// same time.  Rank 0's IOC waits for rank 1's write payload while rank 0
/// itself waits for read data from rank 1's IOC.  Each message must reach
/// the role it was meant for.
#[test_log::test(tokio::test)]
async fn crossed_read_and_write() {
    let dir = tempdir();
    let path = dir.path().join("crossed.h5");
    let payload = pattern(5, 100);
    WorldBuilder::new(2)
        .iocs(IocSelection::Total(2))
        .subfiles(4)
        .run(&path, |p| {
            let payload = payload.clone();
            async move {
                let f = t!(p.open(OpenFlags::create()).await);
                f.set_eoa(1 << 16);
                let ctx = f.context().clone();
                assert_eq!(ctx.ioc_for_subfile(0), (0, 0));
                assert_eq!(ctx.ioc_for_subfile(1), (1, 1));
                if p.rank() == 1 {
                    // Start a write to subfile 0, but hold the payload back
                    let hdr = IoHeader{len: 100, offset: 0, subfile: 0};
                    t!(send_msg(&**ctx.msg_comm(), 0, tag::WRITE_REQUEST, &hdr)
                       .await);
                    let ack: Ack = t!(recv_msg(&**ctx.data_comm(), 0,
                                               tag::WRITE_ACK).await);
                    let dtag = ack.data_tag().unwrap();
                    p.barrier().await;
                    p.barrier().await;
                    t!(ctx.data_comm().send(0, dtag, Bytes::from(payload))
                       .await);
                    let done: WriteDone = t!(recv_msg(&**ctx.data_comm(), 0,
                                                      done_tag(dtag)).await);
                    t!(done.status);
                } else {
                    p.barrier().await;
                    // Subfile 1 was never written
                    assert_eq!(read_at(&f, 1024, 100).await, vec![0u8; 100]);
                    p.barrier().await;
                }
                p.barrier().await;
                assert_eq!(read_at(&f, 0, 100).await, pattern(5, 100));
                assert_eq!(read_at(&f, 1024, 100).await, vec![0u8; 100]);
                t!(f.close().await);
            }
        }).await;
}
