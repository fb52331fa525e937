//! # sector-io
//!
//! Direct, sector-aligned block I/O with per-operation deadlines.
//!
//! Every read and write is issued on a blocking worker with an explicit
//! deadline. A deadline miss is reported as [`Error::Timeout`], distinct from
//! a completed-with-error result: the kernel may still be using the buffer,
//! so the buffer stays owned by the abandoned worker task and is only freed
//! once the syscall returns. Callers must treat a timed-out operation as
//! poisoning the buffer, never the disk.

pub mod buf;
pub mod disk;
pub mod errors;

pub use buf::AlignedBuf;
pub use disk::{read_iobuf, read_sectors, write_iobuf, write_sector, SyncDisk};
pub use errors::{Error, Result};
