// vim: tw=80
//! The fundamental transfer descriptor of the bio layer
//!
//! An `IoUnit` is one logical I/O request.  Mapping decisions may carve it
//! into children (splitting), and mirrored writes may fan one unit out to
//! several physical submissions; in every case the pending-sub-I/O counter
//! guarantees that completion is observed exactly once, after every child
//! and clone has reported in.

use std::sync::{
    Mutex,
    Arc,
    atomic::{AtomicI32, AtomicU32, Ordering}
};

use futures::channel::oneshot;
use num_traits::FromPrimitive;

use crate::{
    types::*,
    util::*
};

/// Error accounting shared by all physical writes of one mirrored fan-out.
///
/// Only incremented on I/O completion, never preemptively.  The write is
/// reported failed only once the count exceeds `max_errors`, so partial
/// mirror loss below the redundancy level's tolerance stays invisible.
pub(crate) struct WriteContext {
    errors: AtomicU32,
    max_errors: u32,
}

impl WriteContext {
    pub fn new(max_errors: u32) -> Self {
        WriteContext { errors: AtomicU32::new(0), max_errors }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    fn failed(&self) -> bool {
        self.errors() > self.max_errors
    }
}

/// Completion state of one `IoUnit`.
///
/// `pending` starts at 1 for the submission itself.  Each split child and
/// each extra mirror clone adds one.  The drop that takes it to zero decides
/// the final status and fires completion, folding into the parent if this
/// unit was itself a split child.
pub(crate) struct UnitState {
    pending: AtomicU32,
    /// First error observed, as an errno; 0 means none.
    status: AtomicI32,
    /// Set before a mirrored fan-out is submitted.
    wctx: Mutex<Option<Arc<WriteContext>>>,
    /// Back-reference only; the parent never owns its children.
    parent: Option<Arc<UnitState>>,
    tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl UnitState {
    fn new(tx: oneshot::Sender<Result<()>>) -> Arc<Self> {
        Arc::new(UnitState {
            pending: AtomicU32::new(1),
            status: AtomicI32::new(0),
            wctx: Mutex::new(None),
            parent: None,
            tx: Mutex::new(Some(tx)),
        })
    }

    fn new_child(parent: &Arc<UnitState>) -> Arc<Self> {
        parent.pending.fetch_add(1, Ordering::AcqRel);
        Arc::new(UnitState {
            pending: AtomicU32::new(1),
            status: AtomicI32::new(0),
            wctx: Mutex::new(None),
            parent: Some(parent.clone()),
            tx: Mutex::new(None),
        })
    }

    /// Record an error.  The first one wins; later errors are redundant for
    /// status purposes.
    pub fn fold_error(&self, e: Error) {
        let _ = self.status.compare_exchange(0, i32::from(e),
            Ordering::AcqRel, Ordering::Relaxed);
    }

    pub fn set_write_ctx(&self, wctx: Arc<WriteContext>) {
        let mut guard = self.wctx.lock().unwrap();
        debug_assert!(guard.is_none());
        *guard = Some(wctx);
    }

    pub fn write_ctx(&self) -> Option<Arc<WriteContext>> {
        self.wctx.lock().unwrap().clone()
    }

    pub fn add_pending(&self, n: u32) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    /// One sub-I/O finished.  The final drop fires completion.
    pub fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn final_status(&self) -> Result<()> {
        let code = self.status.load(Ordering::Acquire);
        if code != 0 {
            return Err(Error::from_i32(code).unwrap_or(Error::EUNKNOWN));
        }
        // No concurrent writer can remain once pending hit zero, so the
        // tolerance comparison here is race-free.
        if let Some(w) = self.write_ctx() {
            if w.failed() {
                return Err(Error::EIO);
            }
        }
        Ok(())
    }

    fn fire(&self) {
        let status = self.final_status();
        if let Some(parent) = &self.parent {
            if let Err(e) = status {
                // A failed child of a mirrored write counts against the
                // parent's tolerance instead of failing it outright.
                match parent.write_ctx() {
                    Some(w) => w.record_error(),
                    None => parent.fold_error(e),
                }
            }
            parent.complete_one();
        } else if let Some(tx) = self.tx.lock().unwrap().take() {
            // The caller may have dropped the completion future.
            let _ = tx.send(status);
        }
    }
}

/// Buffer of one `IoUnit`: uniquely owned for reads, shared for writes so
/// mirror fan-out can clone it per copy.
pub(crate) enum UnitBuf {
    Read(IoVecMut),
    Write(IoVec),
}

impl UnitBuf {
    fn split_to(&mut self, at: usize) -> UnitBuf {
        match self {
            UnitBuf::Read(dbm) => UnitBuf::Read(dbm.split_to(at)),
            UnitBuf::Write(db) => UnitBuf::Write(db.split_to(at)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UnitBuf::Read(dbm) => dbm.len(),
            UnitBuf::Write(db) => db.len(),
        }
    }
}

/// One logical I/O request, possibly a split child of a larger one.
pub(crate) struct IoUnit {
    /// Current logical start of the unresolved remainder.
    pub logical: u64,
    /// Offset used for checksum addressing.  Advanced in lockstep with
    /// `logical`, except across splits of an ordered write.
    pub file_offset: u64,
    pub len: u64,
    pub dir: Direction,
    pub metadata: bool,
    pub sync: bool,
    pub nocsum: bool,
    pub mirror_hint: MirrorT,
    pub buf: UnitBuf,
    pub state: Arc<UnitState>,
}

impl IoUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(logical: u64, dir: Direction, metadata: bool, sync: bool,
               nocsum: bool, mirror_hint: MirrorT, buf: UnitBuf)
        -> (Self, oneshot::Receiver<Result<()>>)
    {
        let (tx, rx) = oneshot::channel();
        let len = buf.len() as u64;
        let unit = IoUnit {
            logical,
            file_offset: logical,
            len,
            dir,
            metadata,
            sync,
            nocsum,
            mirror_hint,
            buf,
            state: UnitState::new(tx),
        };
        (unit, rx)
    }

    /// Carve off a child covering the first `at` bytes, leaving `self` as
    /// the remainder.  The parent's pending counter is incremented before
    /// the child can possibly complete.
    pub fn split(&mut self, at: u64) -> IoUnit {
        debug_assert!(at > 0 && at < self.len);
        debug_assert_eq!(at % BYTES_PER_SECTOR as u64, 0);
        let child = IoUnit {
            logical: self.logical,
            file_offset: self.file_offset,
            len: at,
            dir: self.dir,
            metadata: self.metadata,
            sync: self.sync,
            nocsum: self.nocsum,
            mirror_hint: self.mirror_hint,
            buf: self.buf.split_to(at as usize),
            state: UnitState::new_child(&self.state),
        };
        self.logical += at;
        self.len -= at;
        if !self.dir.is_ordered() {
            // An ordered write keeps a single logical-offset identity for
            // checksum addressing even when physically fragmented.
            self.file_offset += at;
        }
        child
    }

    /// Fail this unit with a local error, releasing its base reference.
    pub fn fail(self, e: Error) {
        self.state.fold_error(e);
        self.state.complete_one();
    }
}

// LCOV_EXCL_STOP
