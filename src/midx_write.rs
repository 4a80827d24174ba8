//! Multi-pack index writer.
//!
//! Accumulates packs through the process-wide registry, merges their
//! `.idx` entry streams, and emits a checksummed `multi-pack-index` file
//! beside the packs.
//!
//! # Duplicate objects
//! The same object may live in several packs. Exact duplicates (same OID,
//! pack, and offset) collapse silently; entries that share an OID but
//! disagree on placement collapse to the first in sorted order, with a
//! warning, because the format stores at most one entry per OID.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::futils;
use crate::midx::{
    MidxEntry, CHUNK_ENTRY_SIZE, CHUNK_LOFF, CHUNK_OIDF, CHUNK_OIDL, CHUNK_OOFF, CHUNK_PNAM,
    FANOUT_SIZE, LOFF_FLAG, MIDX_HEADER_SIZE, MIDX_OID_VERSION, MIDX_SIGNATURE, MIDX_VERSION,
};
use crate::mwindow::MwindowCache;
use crate::pack::{PackError, PackFile};
use crate::pack_idx::IdxError;

/// File name of the merged index inside the pack directory.
pub const MIDX_FILE_NAME: &str = "multi-pack-index";
/// Mode of the written index file.
const MIDX_FILE_MODE: u32 = 0o444;

/// Errors from building or committing a multi-pack index.
#[derive(Debug)]
#[non_exhaustive]
pub enum MidxWriteError {
    /// Writing the output file failed.
    Io(io::Error),
    /// A pack could not be opened through the registry.
    Pack(PackError),
    /// Enumerating a pack's `.idx` entries failed.
    Idx { path: PathBuf, source: IdxError },
    /// A pack does not live under the writer's pack directory.
    PackOutsideDir { path: PathBuf },
    /// A pack path does not carry the `.pack` suffix.
    NotAPackName { path: PathBuf },
}

impl fmt::Display for MidxWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "multi-pack-index write failed: {err}"),
            Self::Pack(err) => write!(f, "{err}"),
            Self::Idx { path, source } => {
                write!(f, "failed to enumerate {}: {source}", path.display())
            }
            Self::PackOutsideDir { path } => write!(
                f,
                "pack {} is outside the multi-pack-index directory",
                path.display()
            ),
            Self::NotAPackName { path } => {
                write!(f, "{} is not a .pack path", path.display())
            }
        }
    }
}

impl std::error::Error for MidxWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Pack(err) => Some(err),
            Self::Idx { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for MidxWriteError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<PackError> for MidxWriteError {
    fn from(err: PackError) -> Self {
        Self::Pack(err)
    }
}

/// Builds a `multi-pack-index` for a pack directory.
///
/// Dropping the writer releases its pack references.
pub struct MidxWriter {
    runtime: Arc<MwindowCache>,
    pack_dir: PathBuf,
    packs: Vec<Arc<PackFile>>,
}

impl MidxWriter {
    /// Creates a writer bound to a pack directory, using an explicit
    /// runtime handle. The directory path is normalized lexically.
    #[must_use]
    pub fn new(runtime: Arc<MwindowCache>, pack_dir: impl AsRef<Path>) -> Self {
        Self {
            runtime,
            pack_dir: futils::normalize_lexical(pack_dir.as_ref()),
            packs: Vec::new(),
        }
    }

    /// Creates a writer backed by the process-wide runtime.
    #[must_use]
    pub fn with_global(pack_dir: impl AsRef<Path>) -> Self {
        Self::new(MwindowCache::global(), pack_dir)
    }

    /// Returns the normalized pack directory.
    #[must_use]
    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    /// Adds a pack by its `.idx` path, resolved relative to the pack
    /// directory.
    ///
    /// # Errors
    /// Fails when the pack cannot be opened through the registry.
    pub fn add(&mut self, idx_path: impl AsRef<Path>) -> Result<(), MidxWriteError> {
        let idx_path = idx_path.as_ref();
        let resolved = if idx_path.is_absolute() {
            idx_path.to_path_buf()
        } else {
            self.pack_dir.join(idx_path)
        };
        let pack = self.runtime.get_pack(&resolved)?;
        self.packs.push(pack);
        Ok(())
    }

    /// Produces the multi-pack-index bytes into `out`.
    ///
    /// `out` should be empty; the trailing checksum covers only the bytes
    /// this call appends. On failure `out` holds a partial buffer the
    /// caller should discard.
    ///
    /// # Errors
    /// Propagates the first enumeration or naming failure.
    pub fn dump(&self, out: &mut Vec<u8>) -> Result<(), MidxWriteError> {
        let start = out.len();

        let mut packs: Vec<&Arc<PackFile>> = self.packs.iter().collect();
        packs.sort_by(|a, b| a.name().cmp(b.name()));

        // PNAM names and the merged entry stream, in one pass per pack.
        let mut pnam = Vec::new();
        let mut entries: Vec<MidxEntry> = Vec::new();
        for (pack_index, pack) in packs.iter().enumerate() {
            let rel = futils::make_relative(pack.pack_path(), &self.pack_dir).ok_or_else(|| {
                MidxWriteError::PackOutsideDir {
                    path: pack.pack_path().to_path_buf(),
                }
            })?;
            let rel = rel.to_string_lossy();
            let stem = rel
                .strip_suffix(".pack")
                .ok_or_else(|| MidxWriteError::NotAPackName {
                    path: pack.pack_path().to_path_buf(),
                })?;
            pnam.extend_from_slice(stem.as_bytes());
            pnam.extend_from_slice(b".idx");
            pnam.push(0);

            let pack_index = pack_index as u32;
            pack.enumerate_entries(|oid, offset| {
                entries.push(MidxEntry {
                    oid,
                    pack_index,
                    offset,
                });
            })
            .map_err(|source| MidxWriteError::Idx {
                path: pack.idx_path().to_path_buf(),
                source,
            })?;
        }
        while pnam.len() % 4 != 0 {
            pnam.push(0);
        }

        entries.sort_unstable_by(|a, b| {
            (a.oid, a.pack_index, a.offset).cmp(&(b.oid, b.pack_index, b.offset))
        });
        entries.dedup_by(|next, kept| {
            if next.oid != kept.oid {
                return false;
            }
            if next.pack_index != kept.pack_index || next.offset != kept.offset {
                tracing::warn!(
                    oid = %next.oid,
                    kept_pack = kept.pack_index,
                    dropped_pack = next.pack_index,
                    "object listed with conflicting placements; keeping the first"
                );
            }
            true
        });

        let mut fanout = [0u32; 256];
        for entry in &entries {
            fanout[entry.oid.first_byte() as usize] += 1;
        }
        let mut running = 0u32;
        for slot in &mut fanout {
            running += *slot;
            *slot = running;
        }

        let mut oidl = Vec::with_capacity(entries.len() * 20);
        let mut ooff = Vec::with_capacity(entries.len() * 8);
        let mut loff = Vec::new();
        for entry in &entries {
            oidl.extend_from_slice(entry.oid.as_bytes());
            ooff.extend_from_slice(&entry.pack_index.to_be_bytes());
            if entry.offset >= u64::from(LOFF_FLAG) {
                let loff_idx = (loff.len() / 8) as u32;
                ooff.extend_from_slice(&(LOFF_FLAG | loff_idx).to_be_bytes());
                loff.extend_from_slice(&entry.offset.to_be_bytes());
            } else {
                ooff.extend_from_slice(&(entry.offset as u32).to_be_bytes());
            }
        }

        let chunk_count: u8 = if loff.is_empty() { 4 } else { 5 };
        out.extend_from_slice(&MIDX_SIGNATURE);
        out.push(MIDX_VERSION);
        out.push(MIDX_OID_VERSION);
        out.push(chunk_count);
        out.push(0); // base_midx_files
        out.extend_from_slice(&(packs.len() as u32).to_be_bytes());

        let mut offset = (MIDX_HEADER_SIZE + (chunk_count as usize + 1) * CHUNK_ENTRY_SIZE) as u64;
        let mut push_chunk = |out: &mut Vec<u8>, id: [u8; 4], len: u64| {
            out.extend_from_slice(&id);
            out.extend_from_slice(&offset.to_be_bytes());
            offset += len;
        };
        push_chunk(out, CHUNK_PNAM, pnam.len() as u64);
        push_chunk(out, CHUNK_OIDF, FANOUT_SIZE as u64);
        push_chunk(out, CHUNK_OIDL, oidl.len() as u64);
        push_chunk(out, CHUNK_OOFF, ooff.len() as u64);
        if !loff.is_empty() {
            push_chunk(out, CHUNK_LOFF, loff.len() as u64);
        }
        push_chunk(out, [0; 4], 0);

        out.extend_from_slice(&pnam);
        for count in fanout {
            out.extend_from_slice(&count.to_be_bytes());
        }
        out.extend_from_slice(&oidl);
        out.extend_from_slice(&ooff);
        out.extend_from_slice(&loff);

        let digest: [u8; 20] = Sha1::digest(&out[start..]).into();
        out.extend_from_slice(&digest);
        Ok(())
    }

    /// Writes the index atomically to `<pack_dir>/multi-pack-index` with
    /// mode 0444. Either the previous index or the new one is visible;
    /// never a partial file.
    ///
    /// # Errors
    /// Propagates `dump` failures and write errors.
    pub fn commit(&self) -> Result<(), MidxWriteError> {
        let mut buf = Vec::new();
        self.dump(&mut buf)?;
        let path = self.pack_dir.join(MIDX_FILE_NAME);
        futils::write_atomic(&path, &buf, MIDX_FILE_MODE)?;
        Ok(())
    }
}

impl Drop for MidxWriter {
    fn drop(&mut self) {
        for pack in self.packs.drain(..) {
            let _ = self.runtime.put_pack(&pack);
        }
    }
}

impl fmt::Debug for MidxWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidxWriter")
            .field("pack_dir", &self.pack_dir)
            .field("packs", &self.packs.len())
            .finish()
    }
}
