// vim: tw=80
//! Post-read verification and self-healing
//!
//! Every verified read ends here, on a worker rather than on the device's
//! completion context.  Sectors whose contents fail their checksum are
//! re-read from the other mirrors in a fixed ring order; the first copy
//! that verifies heals the caller's buffer and is written back over every
//! copy that was tried and found bad.

use std::sync::Arc;

use divbuf::{DivBuf, DivBufInaccessible, DivBufMut, DivBufShared};
use futures::{StreamExt, stream::FuturesUnordered};
use tracing::{debug, warn};

use crate::{
    device::StatKind,
    dispatch::Inner,
    io_unit::UnitState,
    types::*,
    util::*
};

/// Next mirror in the retry ring.  Mirror numbers are 1-based and the ring
/// wraps, so every copy is visited exactly once before returning to the
/// start.
pub(crate) fn next_mirror(mirror: MirrorT, num_mirrors: MirrorT) -> MirrorT {
    mirror % num_mirrors + 1
}

/// Previous mirror in the ring, for walking write-backs from the good copy
/// backward over the bad ones.
pub(crate) fn prev_mirror(mirror: MirrorT, num_mirrors: MirrorT) -> MirrorT {
    if mirror <= 1 {
        num_mirrors
    } else {
        mirror - 1
    }
}

/// Deferred verification of one completed read.
///
/// Snapshotted at submission time; the buffer is reclaimed through `dbi`
/// once the device has released its view.
pub(crate) struct ReadVerify {
    pub dbi: DivBufInaccessible,
    /// Logical address of the first sector.
    pub logical: u64,
    pub len: u64,
    /// Mirror the original read was served from.
    pub mirror: MirrorT,
    pub num_mirrors: MirrorT,
    /// One expected checksum per sector.
    pub expected: Vec<u64>,
    pub state: Arc<UnitState>,
}

impl ReadVerify {
    /// Verify every sector, repairing the ones that fail.  Completes the
    /// unit exactly once, after the last repair attempt has finished.
    ///
    /// `io_failed` means the original read itself returned an error, so
    /// every sector's content is suspect regardless of what the checksums
    /// say about it.
    pub async fn run(self, inner: Arc<Inner>, io_failed: bool) {
        let bps = BYTES_PER_SECTOR as u64;
        debug_assert_eq!(self.expected.len(), (self.len / bps) as usize);
        // The device dropped its view when its future completed.
        let dbm = self.dbi.try_mut().unwrap();
        let mut remaining = Some(dbm);
        let mut repairs = FuturesUnordered::new();
        for (i, expected) in self.expected.iter().copied().enumerate() {
            let sector = match remaining.take() {
                Some(mut rest) if rest.len() > BYTES_PER_SECTOR => {
                    let s = rest.split_to(BYTES_PER_SECTOR);
                    remaining = Some(rest);
                    s
                },
                Some(rest) => rest,
                None => break,
            };
            if !io_failed && inner.csum.verify(&sector[..], expected) {
                continue;
            }
            let logical = self.logical + i as u64 * bps;
            repairs.push(repair_sector(inner.clone(), sector, logical,
                expected, self.mirror, self.num_mirrors, io_failed));
        }
        // Clean sectors release their views before any repair runs.
        drop(remaining);
        while let Some(r) = repairs.next().await {
            if let Err(e) = r {
                self.state.fold_error(e);
            }
        }
        self.state.complete_one();
    }
}

/// Read one candidate copy of the sector at `logical` into a scratch
/// buffer, verifying it against `expected`.
async fn fetch_good_copy(
    inner: &Arc<Inner>,
    logical: u64,
    expected: u64,
    mirror: MirrorT,
) -> Result<DivBufShared>
{
    let stripe = inner.mapper
        .resolve_mirror(logical, BYTES_PER_SECTOR as u64, mirror)?;
    let dev = inner.device(stripe.device)?;
    let tdbs = DivBufShared::from(vec![0u8; BYTES_PER_SECTOR]);
    let tdbm = tdbs.try_mut().unwrap();
    if let Err(e) = dev.read_at(tdbm, stripe.offset).await {
        inner.stats.record(stripe.device, StatKind::ReadErrors);
        return Err(e);
    }
    let ok = inner.csum.verify(&tdbs.try_const().unwrap()[..], expected);
    if ok {
        Ok(tdbs)
    } else {
        inner.stats.record(stripe.device, StatKind::CorruptionErrors);
        Err(Error::EINTEGRITY)
    }
}

/// Overwrite one mirror's copy of the sector with known-good data.
/// Best-effort; a failed write-back leaves the copy bad but doesn't fail
/// the read.
async fn write_back(inner: &Arc<Inner>, logical: u64, good: DivBuf,
                    mirror: MirrorT)
{
    let r = async {
        let stripe = inner.mapper
            .resolve_mirror(logical, BYTES_PER_SECTOR as u64, mirror)?;
        let dev = inner.device(stripe.device)?;
        dev.write_at(good, stripe.offset).await
            .inspect_err(|_| {
                inner.stats.record(stripe.device, StatKind::WriteErrors);
            })
    }.await;
    match r {
        Ok(()) => debug!(logical, mirror, "healed one copy"),
        Err(e) => warn!(logical, mirror, ?e, "write-back failed"),
    }
}

/// Repair one sector whose copy on mirror `orig` is bad.
///
/// Walks the ring forward from `orig` until a copy verifies, heals the
/// caller's buffer from it, then walks backward writing the good data over
/// every copy that was tried, `orig` inclusive.
async fn repair_sector(
    inner: Arc<Inner>,
    mut sector: DivBufMut,
    logical: u64,
    expected: u64,
    orig: MirrorT,
    num_mirrors: MirrorT,
    io_failed: bool,
) -> Result<()>
{
    let mut saw_corruption = false;
    if !io_failed {
        // Valid I/O status but bad contents.
        saw_corruption = true;
        if let Ok(stripe) = inner.mapper
            .resolve_mirror(logical, BYTES_PER_SECTOR as u64, orig)
        {
            inner.stats.record(stripe.device, StatKind::CorruptionErrors);
        }
    }
    let mut mirror = orig;
    loop {
        mirror = next_mirror(mirror, num_mirrors);
        if mirror == orig {
            // Ring exhausted; no copy verified.
            warn!(logical, "uncorrectable sector");
            return if saw_corruption {
                Err(Error::EINTEGRITY)
            } else {
                Err(Error::EIO)
            };
        }
        debug!(logical, mirror, "retrying sector on another mirror");
        match fetch_good_copy(&inner, logical, expected, mirror).await {
            Ok(gdbs) => {
                let good = gdbs.try_const().unwrap();
                sector[..].copy_from_slice(&good[..]);
                // Release the caller's view before completion can observe
                // the buffer.
                drop(sector);
                let mut back = prev_mirror(mirror, num_mirrors);
                loop {
                    write_back(&inner, logical, good.clone(), back).await;
                    if back == orig {
                        break;
                    }
                    back = prev_mirror(back, num_mirrors);
                }
                drop(good);
                return Ok(());
            },
            Err(Error::EINTEGRITY) => saw_corruption = true,
            Err(_) => (),
        }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use std::collections::BTreeMap;

    use futures::{FutureExt, future};

    use crate::{
        checksum::{ChecksumEngine, MetroChecksumTable},
        device::{BlockDevice, DeviceStats, MockBlockDevice, RamDevice,
                 StatsLedger},
        io_unit::{IoUnit, UnitBuf},
        mapping::UniformMapper,
        offload::DefaultDeferPolicy,
        parity::NoParity,
        util::basic_runtime,
        workq::WorkerPool,
    };
    use super::*;

    mod ring {
        use pretty_assertions::assert_eq;
        use super::*;

        #[test]
        fn next_wraps() {
            assert_eq!(next_mirror(1, 3), 2);
            assert_eq!(next_mirror(2, 3), 3);
            assert_eq!(next_mirror(3, 3), 1);
            assert_eq!(next_mirror(1, 1), 1);
        }

        #[test]
        fn prev_wraps() {
            assert_eq!(prev_mirror(3, 3), 2);
            assert_eq!(prev_mirror(2, 3), 1);
            assert_eq!(prev_mirror(1, 3), 3);
            assert_eq!(prev_mirror(1, 1), 1);
        }

        /// Starting anywhere, following `next_mirror` visits every mirror
        /// exactly once before returning to the start.
        #[test]
        fn full_cycle() {
            for start in 1..=4u8 {
                let mut seen = vec![start];
                let mut m = start;
                loop {
                    m = next_mirror(m, 4);
                    if m == start {
                        break;
                    }
                    seen.push(m);
                }
                seen.sort_unstable();
                assert_eq!(seen, vec![1, 2, 3, 4]);
            }
        }
    }

    /// Must be called from within a tokio runtime.
    fn make_inner(
        devices: Vec<Arc<dyn BlockDevice>>,
        csum: Arc<dyn ChecksumEngine>,
        stats: Arc<dyn DeviceStats>,
    ) -> Arc<Inner>
    {
        let ids = (0..devices.len() as DeviceId).collect::<Vec<_>>();
        Arc::new(Inner {
            mapper: Arc::new(UniformMapper::new(ids, 1 << 30, 0)),
            csum,
            parity: Arc::new(NoParity),
            devices: devices.into_iter().enumerate()
                .map(|(i, d)| (i as DeviceId, d))
                .collect::<BTreeMap<_, _>>(),
            stats,
            pool: WorkerPool::new(),
            policy: Arc::new(DefaultDeferPolicy),
        })
    }

    /// Simulate a completed read of `content` at `logical`, returning the
    /// pieces needed to run verification on it.
    fn completed_read(logical: u64, content: &[u8])
        -> (DivBufShared, DivBufInaccessible, Arc<UnitState>,
            futures::channel::oneshot::Receiver<Result<()>>)
    {
        let dbs = DivBufShared::from(vec![0u8; content.len()]);
        let mut dbm = dbs.try_mut().unwrap();
        dbm[..].copy_from_slice(content);
        let dbi = dbm.clone_inaccessible();
        let (unit, rx) = IoUnit::new(logical, Direction::Read, false, false,
            false, 0, UnitBuf::Read(dbm));
        let state = unit.state.clone();
        // Drop the unit's view; the device would have by completion time.
        drop(unit);
        (dbs, dbi, state, rx)
    }

    mod repair {
        use pretty_assertions::assert_eq;
        use super::*;

        const BPS: usize = BYTES_PER_SECTOR;

        fn ram_with(content: &[u8], off: u64, size: usize) -> Arc<RamDevice>
        {
            let dev = RamDevice::new(size);
            let dbs = DivBufShared::from(content.to_vec());
            dev.write_at(dbs.try_const().unwrap(), off)
                .now_or_never().unwrap().unwrap();
            Arc::new(dev)
        }

        /// A sector that fails its checksum is re-read from the next
        /// mirror, the caller's buffer is healed, and the bad copy is
        /// rewritten.
        #[test]
        fn heals_from_next_mirror() {
            let rt = basic_runtime();
            rt.block_on(async {
                let logical = 8192u64;
                let good = vec![0x5au8; BPS];
                let csum = Arc::new(MetroChecksumTable::new());
                let expected = csum.compute(logical, &good).unwrap();

                let mut bad = good.clone();
                bad[100] ^= 0xff;
                let dev0 = ram_with(&bad, logical, 65536);
                let dev1 = ram_with(&good, logical, 65536);
                let stats = Arc::new(StatsLedger::new());
                let inner = make_inner(
                    vec![dev0.clone(), dev1],
                    csum,
                    stats.clone());

                let (dbs, dbi, state, rx) = completed_read(logical, &bad);
                let verify = ReadVerify {
                    dbi,
                    logical,
                    len: BPS as u64,
                    mirror: 1,
                    num_mirrors: 2,
                    expected,
                    state,
                };
                verify.run(inner, false).await;
                assert_eq!(rx.await.unwrap(), Ok(()));
                assert_eq!(&dbs.try_const().unwrap()[..], &good[..]);
                // The bad copy was rewritten in place
                assert_eq!(dev0.snapshot(logical, BPS), good);
                assert_eq!(stats.get(0, StatKind::CorruptionErrors), 1);
            });
        }

        /// With every copy bad, the read fails with a checksum error and
        /// every copy's device is charged.
        #[test]
        fn uncorrectable() {
            let rt = basic_runtime();
            rt.block_on(async {
                let logical = 0u64;
                let good = vec![0x11u8; BPS];
                let csum = Arc::new(MetroChecksumTable::new());
                let expected = csum.compute(logical, &good).unwrap();

                let mut bad = good.clone();
                bad[0] ^= 0xff;
                let dev0 = ram_with(&bad, logical, 65536);
                let dev1 = ram_with(&bad, logical, 65536);
                let stats = Arc::new(StatsLedger::new());
                let inner = make_inner(
                    vec![dev0.clone(), dev1],
                    csum,
                    stats.clone());

                let (_dbs, dbi, state, rx) = completed_read(logical, &bad);
                let verify = ReadVerify {
                    dbi,
                    logical,
                    len: BPS as u64,
                    mirror: 1,
                    num_mirrors: 2,
                    expected,
                    state,
                };
                verify.run(inner, false).await;
                assert_eq!(rx.await.unwrap(), Err(Error::EINTEGRITY));
                assert_eq!(stats.get(0, StatKind::CorruptionErrors), 1);
                assert_eq!(stats.get(1, StatKind::CorruptionErrors), 1);
                // The bad copy must not be "healed" from another bad copy
                assert_eq!(dev0.snapshot(logical, BPS), bad);
            });
        }

        /// With a single mirror there is nowhere to retry.
        #[test]
        fn single_mirror_uncorrectable() {
            let rt = basic_runtime();
            rt.block_on(async {
                let logical = 0u64;
                let good = vec![0x22u8; BPS];
                let csum = Arc::new(MetroChecksumTable::new());
                let expected = csum.compute(logical, &good).unwrap();

                let mut bad = good.clone();
                bad[5] ^= 0xff;
                let dev0 = ram_with(&bad, logical, 65536);
                let stats = Arc::new(StatsLedger::new());
                let inner = make_inner(vec![dev0], csum, stats.clone());

                let (_dbs, dbi, state, rx) = completed_read(logical, &bad);
                let verify = ReadVerify {
                    dbi,
                    logical,
                    len: BPS as u64,
                    mirror: 1,
                    num_mirrors: 1,
                    expected,
                    state,
                };
                verify.run(inner, false).await;
                assert_eq!(rx.await.unwrap(), Err(Error::EINTEGRITY));
                assert_eq!(stats.get(0, StatKind::CorruptionErrors), 1);
            });
        }

        /// Write-back walks backward from the good copy over every mirror
        /// that was tried, original inclusive.
        #[test]
        fn write_back_covers_all_tried_mirrors() {
            let rt = basic_runtime();
            rt.block_on(async {
                let logical = 4096u64;
                let good = vec![0x33u8; BPS];
                let csum = Arc::new(MetroChecksumTable::new());
                let expected = csum.compute(logical, &good).unwrap();

                let mut bad = good.clone();
                bad[1] ^= 0xff;
                // Mirror 1: bad contents.  Mirror 2: read error, but the
                // write-back must still reach it.  Mirror 3: good.
                let dev0 = ram_with(&bad, logical, 65536);
                let mut dev1 = MockBlockDevice::new();
                dev1.expect_read_at()
                    .once()
                    .returning(|_, _| Box::pin(future::err(Error::EIO)));
                let good2 = good.clone();
                dev1.expect_write_at()
                    .once()
                    .withf(move |buf, off|
                        *off == 4096 && buf[..] == good2[..])
                    .returning(|_, _| Box::pin(future::ok(())));
                let dev2 = ram_with(&good, logical, 65536);
                let stats = Arc::new(StatsLedger::new());
                let inner = make_inner(
                    vec![dev0.clone(), Arc::new(dev1), dev2],
                    csum,
                    stats.clone());

                let (dbs, dbi, state, rx) = completed_read(logical, &bad);
                let verify = ReadVerify {
                    dbi,
                    logical,
                    len: BPS as u64,
                    mirror: 1,
                    num_mirrors: 3,
                    expected,
                    state,
                };
                verify.run(inner, false).await;
                assert_eq!(rx.await.unwrap(), Ok(()));
                assert_eq!(&dbs.try_const().unwrap()[..], &good[..]);
                assert_eq!(dev0.snapshot(logical, BPS), good);
                assert_eq!(stats.get(0, StatKind::CorruptionErrors), 1);
                assert_eq!(stats.get(1, StatKind::ReadErrors), 1);
            });
        }

        /// After a failed read every sector is suspect, even ones whose
        /// stale buffer contents happen to verify.
        #[test]
        fn io_failure_repairs_every_sector() {
            let rt = basic_runtime();
            rt.block_on(async {
                let logical = 0u64;
                let mut good = vec![0x44u8; BPS];
                good.extend(vec![0x55u8; BPS]);
                let csum = Arc::new(MetroChecksumTable::new());
                let expected = csum.compute(logical, &good).unwrap();

                let dev0 = ram_with(&vec![0u8; 2 * BPS], logical, 65536);
                let dev1 = ram_with(&good, logical, 65536);
                let stats = Arc::new(StatsLedger::new());
                let inner = make_inner(
                    vec![dev0.clone(), dev1],
                    csum,
                    stats.clone());

                // Buffer contents are whatever the failed read left behind
                let (dbs, dbi, state, rx) =
                    completed_read(logical, &vec![0u8; 2 * BPS]);
                let verify = ReadVerify {
                    dbi,
                    logical,
                    len: 2 * BPS as u64,
                    mirror: 1,
                    num_mirrors: 2,
                    expected,
                    state,
                };
                verify.run(inner, true).await;
                assert_eq!(rx.await.unwrap(), Ok(()));
                assert_eq!(&dbs.try_const().unwrap()[..], &good[..]);
                // Both sectors were written back to the failing mirror
                assert_eq!(dev0.snapshot(logical, 2 * BPS), good);
                // An I/O failure is not a corruption
                assert_eq!(stats.get(0, StatKind::CorruptionErrors), 0);
            });
        }

        /// In a multi-sector read only the failing sector is repaired;
        /// clean neighbors are left alone.
        #[test]
        fn partial_corruption_repairs_only_bad_sector() {
            let rt = basic_runtime();
            rt.block_on(async {
                let logical = 0u64;
                let mut good = vec![0x66u8; BPS];
                good.extend(vec![0x77u8; BPS]);
                let csum = Arc::new(MetroChecksumTable::new());
                let expected = csum.compute(logical, &good).unwrap();

                // Sector 1 bad on mirror 1
                let mut m1 = good.clone();
                m1[BPS + 9] ^= 0xff;
                let dev0 = ram_with(&m1, logical, 65536);
                // Mirror 2 must only be read for the bad sector
                let good2 = good.clone();
                let mut dev1 = MockBlockDevice::new();
                dev1.expect_read_at()
                    .once()
                    .withf(|buf, off| *off == BPS as u64 && buf.len() == BPS)
                    .returning(move |mut buf, _| {
                        buf[..].copy_from_slice(&good2[BPS..]);
                        Box::pin(future::ok(()))
                    });
                let stats = Arc::new(StatsLedger::new());
                let inner = make_inner(
                    vec![dev0.clone(), Arc::new(dev1)],
                    csum,
                    stats.clone());

                let (dbs, dbi, state, rx) = completed_read(logical, &m1);
                let verify = ReadVerify {
                    dbi,
                    logical,
                    len: 2 * BPS as u64,
                    mirror: 1,
                    num_mirrors: 2,
                    expected,
                    state,
                };
                verify.run(inner, false).await;
                assert_eq!(rx.await.unwrap(), Ok(()));
                assert_eq!(&dbs.try_const().unwrap()[..], &good[..]);
                assert_eq!(dev0.snapshot(logical, 2 * BPS), good);
                assert_eq!(stats.get(0, StatKind::CorruptionErrors), 1);
            });
        }
    }
}
// LCOV_EXCL_STOP
