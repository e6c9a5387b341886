//! Streaming ZIP central-directory parsing.
//!
//! The pipeline never downloads whole archives: the scanner reads an
//! archive's head, tail and central directory through offset-addressable
//! reads and records, per member, where its compressed payload lives. The
//! worker later fetches exactly that byte range and inflates it.
//!
//! - [`records`]: binary layouts of the consumed PKZIP APPNOTE 6.3 subset
//! - [`parser`]: the [`ZipParser`] walking those records over a [`RangeRead`]
//!
//! Out of scope by design: spanned archives, encryption, archive comments,
//! and extract versions above 6.3. All are rejected, never guessed at.

pub mod parser;
pub mod records;

pub use parser::{RangeRead, ZipParser, extract_enodebid};
pub use records::{CompressionMethod, MemberInfo};
