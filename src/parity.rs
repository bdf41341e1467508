// vim: tw=80
//! Parity (erasure-coded) engine boundary
//!
//! The bio layer only routes to the parity engine and relays its status;
//! stripe reconstruction math lives entirely behind this trait.

use futures::future;
#[cfg(test)] use mockall::automock;

use crate::{
    mapping::ParityGroup,
    types::*
};

#[cfg_attr(test, automock)]
pub trait ParityEngine: Send + Sync {
    /// Write `buf` through the parity path for the given stripe group.
    fn write(&self, buf: IoVec, logical: u64, group: &ParityGroup)
        -> BoxIoFut;

    /// Read through the parity path.  `mirror` selects which parity
    /// rotation the engine reconstructs from, if reconstruction is needed.
    fn read_with_recovery(&self, buf: IoVecMut, logical: u64,
                          group: &ParityGroup, mirror: MirrorT) -> BoxIoFut;
}

/// Stand-in for pools with no parity-backed regions.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoParity;

impl ParityEngine for NoParity {
    fn write(&self, _buf: IoVec, _logical: u64, _group: &ParityGroup)
        -> BoxIoFut
    {
        Box::pin(future::err(Error::EOPNOTSUPP))
    }

    fn read_with_recovery(&self, _buf: IoVecMut, _logical: u64,
                          _group: &ParityGroup, _mirror: MirrorT) -> BoxIoFut
    {
        Box::pin(future::err(Error::EOPNOTSUPP))
    }
}
