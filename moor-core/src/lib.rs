//! # moor-core
//!
//! The lease-manager daemon: a unix-socket command server in front of the
//! delta-lease and Disk-Paxos engines, plus the client/token bookkeeping
//! that ties leases to supervised processes.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use anyhow;
pub use clap;
pub use delta_lease;
pub use ondisk;
pub use paxos_lease;
pub use sector_io;
pub use tokio;
pub use tokio_util;
pub use tracing;
pub use wdmd_client;

pub mod client;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod lockspaces;
pub mod ops;
pub mod protocol;
pub mod requests;
pub mod server;
pub mod tokens;

pub use crate::daemon::Daemon;
pub use crate::errors::{Error, Result};
pub use crate::server::Server;
