//! # ndspipe
//!
//! Distributed ingestion pipeline for MRO/MDT measurement archives that
//! vendors deposit on FTP/SFTP network data servers (NDS).
//!
//! Three cooperating roles built from one crate:
//!
//! - **gateway**: multiplexes callers onto bounded per-NDS connection
//!   pools and exposes scan, central-directory parse and ranged reads over
//!   HTTP and WebSocket
//! - **scanner**: one serialized loop per NDS: list, diff against the
//!   metadata store, parse central directories, submit member rows
//! - **worker**: pulls leased rows, streams exactly the member's
//!   compressed bytes, inflates, decodes and reports terminal row states
//!
//! The ZIP path never downloads an archive: the central directory is read
//! through offset-addressable reads and every member row records where its
//! compressed payload lives, so workers fetch only the bytes they need.

pub mod backend;
pub mod cli;
pub mod error;
pub mod gateway;
pub mod nds;
pub mod pool;
pub mod scanner;
pub mod signal;
pub mod worker;
pub mod zip;

pub use backend::BackendClient;
pub use cli::{Cli, Role};
pub use error::{ErrorKind, NdsError};
pub use nds::{NdsClient, NdsConfig};
pub use pool::{NdsPool, PoolMap};
pub use scanner::Scanner;
pub use worker::Worker;
pub use zip::{MemberInfo, RangeRead, ZipParser};
