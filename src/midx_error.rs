//! Error types for multi-pack index parsing, lookup, and reading.
//!
//! Format violations carry the upstream detail strings and render as
//! `invalid multi-pack-index file - <detail>`. `NotFound` and `Ambiguous`
//! are ordinary lookup outcomes, not corruption.

use std::fmt;
use std::io;

/// A 4-byte MIDX chunk identifier with human-readable Display.
///
/// Prints as ASCII when all bytes are printable, otherwise as hex.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ChunkId(pub [u8; 4]);

impl ChunkId {
    /// Creates a ChunkId from a 4-byte array.
    #[inline]
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|&b| b.is_ascii_graphic()) {
            for &b in &self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(
                f,
                "[{:02x}, {:02x}, {:02x}, {:02x}]",
                self.0[0], self.0[1], self.0[2], self.0[3]
            )
        }
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

/// Errors from MIDX parsing, lookup, and file access.
#[derive(Debug)]
#[non_exhaustive]
pub enum MidxError {
    /// The file violates a format invariant.
    Corrupt { detail: &'static str },
    /// A chunk ID not defined by the format appeared in the chunk directory.
    UnknownChunk { chunk_id: ChunkId },
    /// The same chunk ID appeared twice in the chunk directory.
    DuplicateChunk { chunk_id: ChunkId },
    /// An OOFF entry pointed past the large-offsets table.
    LoffIndexOutOfBounds { index: u32, count: u32 },
    /// An OOFF entry named a pack past the packfile-names table.
    PackIndexOutOfBounds { pack_index: u32, pack_count: u32 },
    /// No entry matched the requested OID prefix.
    NotFound,
    /// More than one entry matched the requested OID prefix.
    Ambiguous,
    /// Opening, statting, or mapping the file failed.
    Io(io::Error),
}

impl MidxError {
    /// Constructs a format-violation error with a static detail string.
    #[inline]
    pub const fn corrupt(detail: &'static str) -> Self {
        Self::Corrupt { detail }
    }
}

impl fmt::Display for MidxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => {
                write!(f, "invalid multi-pack-index file - {detail}")
            }
            Self::UnknownChunk { chunk_id } => write!(
                f,
                "invalid multi-pack-index file - unrecognized chunk ID ({chunk_id})"
            ),
            Self::DuplicateChunk { chunk_id } => write!(
                f,
                "invalid multi-pack-index file - duplicate chunk ID ({chunk_id})"
            ),
            Self::LoffIndexOutOfBounds { index, count } => write!(
                f,
                "invalid multi-pack-index file - large offset index out of bounds: {index} >= {count}"
            ),
            Self::PackIndexOutOfBounds {
                pack_index,
                pack_count,
            } => write!(
                f,
                "invalid multi-pack-index file - pack index out of bounds: {pack_index} >= {pack_count}"
            ),
            Self::NotFound => write!(f, "no multi-pack index entry matched the given prefix"),
            Self::Ambiguous => write!(f, "found multiple offsets for multi-pack index entry"),
            Self::Io(err) => write!(f, "multi-pack-index I/O error: {err}"),
        }
    }
}

impl std::error::Error for MidxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for MidxError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_display_ascii() {
        assert_eq!(ChunkId::new(*b"PNAM").to_string(), "PNAM");
    }

    #[test]
    fn chunk_id_display_non_ascii() {
        assert_eq!(
            ChunkId::new([0x00, 0x01, 0x02, 0x03]).to_string(),
            "[00, 01, 02, 03]"
        );
    }

    #[test]
    fn corrupt_display_carries_prefix() {
        let err = MidxError::corrupt("index signature mismatch");
        assert_eq!(
            err.to_string(),
            "invalid multi-pack-index file - index signature mismatch"
        );
    }
}
