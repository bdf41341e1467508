// vim: tw=80
//! I/O submission and completion aggregation
//!
//! The `Dispatcher` turns one logical I/O into the correct number of
//! physical submissions: a single stripe on the fast path, a fan-out to
//! every mirror for redundant writes, or a hand-off to the parity engine.
//! Completion is reported exactly once per logical request, after every
//! split child and mirror clone has reported in.

use std::{
    collections::BTreeMap,
    sync::Arc
};

use futures::{Future, TryFutureExt};
use tracing::instrument;
use tracing_futures::Instrument;

use crate::{
    checksum::ChecksumEngine,
    device::{BlockDevice, DeviceStats, StatKind},
    io_unit::{IoUnit, UnitBuf, WriteContext},
    mapping::{ChunkMapper, Mapping, Stripe, Target},
    offload::{DeferPolicy, WriteProfile},
    parity::ParityEngine,
    repair::ReadVerify,
    types::*,
    util::*,
    workq::{Priority, WorkerPool}
};

/// Per-request flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IoOptions {
    /// Filesystem metadata: integrity is checked by the caller, not here.
    pub metadata: bool,
    /// The caller wants synchronous durability (fsync-class).
    pub sync: bool,
    /// Skip checksum coverage entirely for this range.
    pub nocsum: bool,
    /// Preferred mirror for reads; 0 lets the mapper choose.
    pub mirror_hint: MirrorT,
}

/// The block I/O submission layer.
///
/// Must be used from within a tokio runtime; physical completions and
/// deferred work run as tasks on it.
pub struct Dispatcher {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub mapper: Arc<dyn ChunkMapper>,
    pub csum: Arc<dyn ChecksumEngine>,
    pub parity: Arc<dyn ParityEngine>,
    pub devices: BTreeMap<DeviceId, Arc<dyn BlockDevice>>,
    pub stats: Arc<dyn DeviceStats>,
    pub pool: WorkerPool,
    pub policy: Arc<dyn DeferPolicy>,
}

impl Inner {
    pub fn device(&self, id: DeviceId) -> Result<Arc<dyn BlockDevice>> {
        self.devices.get(&id).cloned().ok_or(Error::ENXIO)
    }

    /// Resolve and dispatch `unit`, splitting it wherever a mapping
    /// decision covers less than the remainder.
    fn submit(self: Arc<Self>, mut unit: IoUnit) {
        loop {
            let mapping = match self.mapper.resolve(unit.logical, unit.len,
                unit.dir, unit.mirror_hint)
            {
                Ok(m) => m,
                Err(e) => return unit.fail(e),
            };
            let rlen = mapping.resolved_len;
            if rlen == 0 || rlen > unit.len
                || rlen % BYTES_PER_SECTOR as u64 != 0
            {
                // Device layout inconsistency
                return unit.fail(Error::EINVAL);
            }
            if rlen < unit.len {
                let child = unit.split(rlen);
                self.clone().dispatch(child, mapping);
            } else {
                self.dispatch(unit, mapping);
                return;
            }
        }
    }

    /// Dispatch one fully resolved chunk.
    fn dispatch(self: Arc<Self>, unit: IoUnit, mapping: Mapping) {
        match unit.dir {
            Direction::Read => self.dispatch_read(unit, mapping),
            Direction::Write | Direction::ZoneAppend =>
                self.dispatch_write(unit, mapping),
        }
    }

    fn dispatch_read(self: Arc<Self>, unit: IoUnit, mapping: Mapping) {
        // Fetch the expected checksums before any physical I/O.  A lookup
        // failure is a local error; storage is never touched.
        let expected = if unit.metadata || unit.nocsum {
            Vec::new()
        } else {
            match self.csum.lookup(unit.file_offset, unit.len) {
                Ok(v) => v,
                Err(e) => return unit.fail(e),
            }
        };
        let stripe = match &mapping.target {
            Target::Single(s) => *s,
            Target::Mirror(set) => {
                let idx = set.chosen.max(1) as usize - 1;
                match set.stripes.get(idx) {
                    Some(s) => *s,
                    None => return unit.fail(Error::EINVAL),
                }
            },
            Target::Parity(group) => {
                return self.dispatch_parity_read(unit, *group,
                    mapping.mirror);
            }
        };
        let dev = match self.device(stripe.device) {
            Ok(d) => d,
            Err(e) => return unit.fail(e),
        };
        let IoUnit { logical, len, metadata, buf, state, .. } = unit;
        let dbm = match buf {
            UnitBuf::Read(dbm) => dbm,
            UnitBuf::Write(_) => {
                state.fold_error(Error::EINVAL);
                return state.complete_one();
            }
        };
        let verifiable = !metadata && !expected.is_empty();
        // Snapshot the range for post-I/O verification before the buffer
        // is handed to the device.
        let verify = ReadVerify {
            dbi: dbm.clone_inaccessible(),
            logical,
            len,
            mirror: mapping.mirror,
            num_mirrors: mapping.num_mirrors,
            expected,
            state: state.clone(),
        };
        let inner = self;
        let fut = async move {
            let r = dev.read_at(dbm, stripe.offset).await;
            if let Err(e) = r {
                inner.stats.record(stripe.device, StatKind::ReadErrors);
                if verifiable && verify.num_mirrors > 1 {
                    // Every sector is suspect; let the repair path try the
                    // other mirrors sector by sector.
                    inner.enqueue_verify(verify, true);
                } else {
                    state.fold_error(e);
                    state.complete_one();
                }
                return;
            }
            if verifiable {
                // Never verify on the completion context; it may not block.
                inner.enqueue_verify(verify, false);
            } else {
                // Metadata is checked by a higher-level caller; fold the
                // completion through unchanged.
                state.complete_one();
            }
        };
        tokio::spawn(fut.in_current_span());
    }

    fn dispatch_parity_read(self: Arc<Self>, unit: IoUnit,
                            group: crate::mapping::ParityGroup,
                            mirror: MirrorT)
    {
        let IoUnit { logical, buf, state, .. } = unit;
        let dbm = match buf {
            UnitBuf::Read(dbm) => dbm,
            UnitBuf::Write(_) => {
                state.fold_error(Error::EINVAL);
                return state.complete_one();
            }
        };
        let fut = self.parity.read_with_recovery(dbm, logical, &group,
            mirror);
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                state.fold_error(e);
            }
            state.complete_one();
        });
    }

    fn enqueue_verify(self: Arc<Self>, verify: ReadVerify, io_failed: bool)
    {
        self.pool.enqueue(Priority::Normal,
            verify.run(self.clone(), io_failed));
    }

    fn dispatch_write(self: Arc<Self>, unit: IoUnit, mapping: Mapping) {
        if unit.metadata || unit.nocsum {
            return self.dispatch_write_target(unit, mapping);
        }
        let profile = WriteProfile {
            sync: unit.sync,
            metadata: unit.metadata,
            ordered: unit.dir.is_ordered(),
        };
        if self.policy.should_defer(&profile, self.csum.is_fast()) {
            let prio = if unit.sync {
                Priority::High
            } else {
                Priority::Normal
            };
            let inner = self.clone();
            self.pool.enqueue(prio, async move {
                inner.checksum_and_dispatch(unit, mapping);
            });
        } else {
            self.checksum_and_dispatch(unit, mapping);
        }
    }

    fn checksum_and_dispatch(self: Arc<Self>, unit: IoUnit,
                             mapping: Mapping)
    {
        let r = match &unit.buf {
            UnitBuf::Write(db) => self.csum.compute(unit.file_offset, &db[..])
                .map(drop),
            UnitBuf::Read(_) => Err(Error::EINVAL),
        };
        match r {
            // Checksum failure fails the unit without any physical I/O.
            Err(e) => unit.fail(e),
            Ok(()) => self.dispatch_write_target(unit, mapping),
        }
    }

    fn dispatch_write_target(self: Arc<Self>, unit: IoUnit,
                             mapping: Mapping)
    {
        let IoUnit { logical, buf, state, .. } = unit;
        let db = match buf {
            UnitBuf::Write(db) => db,
            UnitBuf::Read(_) => {
                state.fold_error(Error::EINVAL);
                return state.complete_one();
            }
        };
        match mapping.target {
            Target::Single(stripe) => {
                let dev = match self.device(stripe.device) {
                    Ok(d) => d,
                    Err(e) => {
                        state.fold_error(e);
                        return state.complete_one();
                    }
                };
                let inner = self;
                let fut = async move {
                    if let Err(e) = dev.write_at(db, stripe.offset).await {
                        inner.stats.record(stripe.device,
                            StatKind::WriteErrors);
                        state.fold_error(e);
                    }
                    state.complete_one();
                };
                tokio::spawn(fut.in_current_span());
            },
            Target::Mirror(set) => {
                let wctx = Arc::new(WriteContext::new(set.max_errors));
                state.set_write_ctx(wctx.clone());
                debug_assert!(!set.stripes.is_empty());
                state.add_pending(set.stripes.len() as u32 - 1);
                for stripe in set.stripes {
                    self.clone()
                        .submit_mirror_write(&db, stripe, &wctx, &state);
                }
            },
            Target::Parity(group) => {
                let fut = self.parity.write(db, logical, &group);
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        state.fold_error(e);
                    }
                    state.complete_one();
                });
            },
        }
    }

    fn submit_mirror_write(self: Arc<Self>, db: &IoVec, stripe: Stripe,
                           wctx: &Arc<WriteContext>,
                           state: &Arc<crate::io_unit::UnitState>)
    {
        let wctx = wctx.clone();
        let state = state.clone();
        let dev = match self.device(stripe.device) {
            Ok(d) => d,
            Err(_) => {
                // A missing device is one failed mirror, not a failed write.
                wctx.record_error();
                return state.complete_one();
            }
        };
        let db = db.clone();
        let inner = self;
        let fut = async move {
            if dev.write_at(db, stripe.offset).await.is_err() {
                inner.stats.record(stripe.device, StatKind::WriteErrors);
                wctx.record_error();
            }
            state.complete_one();
        };
        tokio::spawn(fut.in_current_span());
    }
}

impl Dispatcher {
    pub fn new(
        mapper: Arc<dyn ChunkMapper>,
        csum: Arc<dyn ChecksumEngine>,
        parity: Arc<dyn ParityEngine>,
        devices: BTreeMap<DeviceId, Arc<dyn BlockDevice>>,
        stats: Arc<dyn DeviceStats>,
        policy: Arc<dyn DeferPolicy>,
    ) -> Self {
        let inner = Arc::new(Inner {
            mapper,
            csum,
            parity,
            devices,
            stats,
            pool: WorkerPool::new(),
            policy,
        });
        Dispatcher { inner }
    }

    /// Read `buf.len()` bytes at `logical`.
    ///
    /// Data reads are verified sector by sector against their stored
    /// checksums; failing sectors are transparently re-read from other
    /// mirrors and the bad copies healed.
    #[instrument(skip(self, buf))]
    pub fn read_at(&self, buf: IoVecMut, logical: u64, opts: IoOptions)
        -> impl Future<Output=Result<()>> + Send
    {
        self.submit(logical, Direction::Read, UnitBuf::Read(buf), opts)
    }

    /// Write the contents of `buf` at `logical`, fanning out to every
    /// mirror of the resolved target.
    #[instrument(skip(self, buf))]
    pub fn write_at(&self, buf: IoVec, logical: u64, opts: IoOptions)
        -> impl Future<Output=Result<()>> + Send
    {
        self.submit(logical, Direction::Write, UnitBuf::Write(buf), opts)
    }

    /// Like [`write_at`](Self::write_at), but for sequential-write-only
    /// regions.  Physical fragments of the append keep a single
    /// logical-offset identity for checksum addressing.
    #[instrument(skip(self, buf))]
    pub fn zone_append(&self, buf: IoVec, logical: u64, opts: IoOptions)
        -> impl Future<Output=Result<()>> + Send
    {
        self.submit(logical, Direction::ZoneAppend, UnitBuf::Write(buf),
            opts)
    }

    fn submit(&self, logical: u64, dir: Direction, buf: UnitBuf,
              opts: IoOptions)
        -> impl Future<Output=Result<()>> + Send
    {
        let (unit, rx) = IoUnit::new(logical, dir, opts.metadata, opts.sync,
            opts.nocsum, opts.mirror_hint, buf);
        let bps = BYTES_PER_SECTOR as u64;
        if unit.len == 0 || unit.len % bps != 0 || logical % bps != 0 {
            unit.fail(Error::EINVAL);
        } else {
            self.inner.clone().submit(unit);
        }
        rx.unwrap_or_else(|_cancel| Err(Error::ECANCELED))
    }
}

// LCOV_EXCL_STOP
