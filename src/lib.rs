// vim: tw=80
//! FerroFS's block I/O layer
//!
//! This crate sits between the filesystem proper and its block devices.  It
//! resolves logical byte ranges to physical targets, splits requests at
//! stripe boundaries, fans writes out to every mirror, and verifies reads
//! sector by sector against their stored checksums, transparently healing
//! bad copies from good ones.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

pub mod checksum;
pub mod device;
pub mod dispatch;
pub mod io_unit;
pub mod mapping;
pub mod offload;
pub mod parity;
pub mod repair;
pub mod types;
pub mod util;
pub mod workq;

pub use crate::types::*;
pub use crate::util::*;
