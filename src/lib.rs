//! Incremental virtual-disk backups over NBD using changed-block tracking.
//!
//! The pieces, bottom up: [`proto`] is the NBD wire codec, [`client`] the
//! synchronous NBD client (with handshake-time TLS upgrade), [`bitmap`]
//! turns changed-block bitmaps into byte extents, [`writer`] streams
//! extents into files, [`download`] composes those into full and
//! incremental VDI downloads, and [`backup`] orchestrates whole-VM backups
//! against the management API ([`xapi`]). [`restore`] is the matching
//! import path, and [`server`] is the in-process NBD peer the integration
//! tests run against.

pub mod backup;
pub mod bitmap;
pub mod checksum;
pub mod client;
pub mod download;
mod error;
pub mod proto;
pub mod restore;
pub mod server;
pub mod writer;
pub mod xapi;

pub use error::{Error, Result};
