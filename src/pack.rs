//! Shared pack handles and the process-wide pack registry.
//!
//! Packs are opened once per process and shared by reference count: the
//! registry maps a canonical pack path to its handle, so every writer or
//! reader touching the same pack gets the same `PackFile`. The registry
//! lives inside the window cache's mutex, which keeps the locking story a
//! single lock with no ordering questions.
//!
//! A `PackFile` owns its `.idx` mapping (enumeration is a straight walk of
//! the index) and reads `.pack` bytes through cache windows on demand.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use memmap2::Mmap;

use crate::futils;
use crate::mwindow::{MwindowCache, MwindowError, WindowCursor};
use crate::object_id::ObjectId;
use crate::pack_idx::{IdxError, IdxView};

/// Errors from opening packs through the registry.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackError {
    /// Opening or mapping the `.idx` file failed.
    Io(io::Error),
    /// The `.idx` file is malformed.
    Idx { path: PathBuf, source: IdxError },
    /// A window-cache operation failed.
    Mwindow(MwindowError),
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "pack I/O error: {err}"),
            Self::Idx { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            Self::Mwindow(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Idx { source, .. } => Some(source),
            Self::Mwindow(err) => Some(err),
        }
    }
}

impl From<io::Error> for PackError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<MwindowError> for PackError {
    fn from(err: MwindowError) -> Self {
        Self::Mwindow(err)
    }
}

/// Registry slot: the shared handle plus its reference count.
///
/// The count is a plain integer because it is only touched under the
/// cache mutex.
pub(crate) struct PackEntry {
    pub(crate) refs: u32,
    pub(crate) pack: Arc<PackFile>,
}

/// A shared, opened pack.
///
/// # Invariants
/// - `pack_path` ends in `.pack`, `idx_path` in `.idx`; both share the
///   canonical extension-less base used as the registry key.
/// - `idx_map` parsed successfully at open; `object_count` matches it.
pub struct PackFile {
    cache: Weak<MwindowCache>,
    file_id: u64,
    name: String,
    pack_path: PathBuf,
    idx_path: PathBuf,
    idx_map: Mmap,
    object_count: u32,
}

impl PackFile {
    /// Returns the canonical pack name (the `.pack` path), the writer's
    /// sort key.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the `.pack` path.
    #[must_use]
    pub fn pack_path(&self) -> &Path {
        &self.pack_path
    }

    /// Returns the `.idx` path.
    #[must_use]
    pub fn idx_path(&self) -> &Path {
        &self.idx_path
    }

    /// Returns the number of objects in this pack.
    #[inline]
    #[must_use]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Invokes `cb(oid, offset)` once per object, in `.idx` (sorted OID)
    /// order.
    ///
    /// # Errors
    /// Propagates the first `.idx` decoding failure immediately.
    pub fn enumerate_entries(&self, mut cb: impl FnMut(ObjectId, u64)) -> Result<(), IdxError> {
        let view = IdxView::parse(&self.idx_map)?;
        for (oid, idx) in view.iter_oids() {
            cb(ObjectId::from_slice(oid), view.offset_at(idx)?);
        }
        Ok(())
    }

    /// Returns pack bytes at `offset` through a cache window.
    ///
    /// `extra` bytes past `offset` are guaranteed addressable in the
    /// returned slice for ordinary values (below half the window size).
    /// The cursor pins the window; see [`WindowCursor`].
    ///
    /// # Errors
    /// Fails when the range is outside the pack or the mapping cannot be
    /// established.
    pub fn window<'c>(
        &self,
        cursor: &'c mut WindowCursor,
        offset: u64,
        extra: u64,
    ) -> Result<&'c [u8], MwindowError> {
        let cache = self.cache.upgrade().ok_or(MwindowError::CacheShutDown)?;
        cache.window_open(self.file_id, &self.pack_path, cursor, offset, extra)
    }
}

impl fmt::Debug for PackFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackFile")
            .field("name", &self.name)
            .field("object_count", &self.object_count)
            .finish_non_exhaustive()
    }
}

/// Strips a `.idx`/`.pack` extension down to the canonical base path.
fn canonical_base(path: &Path) -> PathBuf {
    let norm = futils::normalize_lexical(path);
    match norm.extension().and_then(|e| e.to_str()) {
        Some("idx" | "pack") => norm.with_extension(""),
        _ => norm,
    }
}

impl MwindowCache {
    /// Opens a pack (by its `.idx` or `.pack` path) or bumps the reference
    /// count of the already-open handle for the same canonical path.
    ///
    /// Every successful `get_pack` must be balanced by one `put_pack`.
    ///
    /// # Errors
    /// Fails when the `.idx` cannot be opened, mapped, or parsed.
    pub fn get_pack(self: &Arc<Self>, path: &Path) -> Result<Arc<PackFile>, PackError> {
        let base = canonical_base(path);
        let pack_path = base.with_extension("pack");
        let idx_path = base.with_extension("idx");

        let mut st = self.lock_state()?;
        if let Some(entry) = st.packs.get_mut(&pack_path) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.pack));
        }

        // Opening under the lock keeps the one-lock story; pack opens are
        // rare next to lookups.
        let idx_file = File::open(&idx_path)?;
        let idx_map = futils::map_file_ro(&idx_file)?;
        let object_count = IdxView::parse(&idx_map)
            .map_err(|source| PackError::Idx {
                path: idx_path.clone(),
                source,
            })?
            .object_count();

        let file_id = st.next_file_id;
        st.next_file_id += 1;

        let pack = Arc::new(PackFile {
            cache: Arc::downgrade(self),
            file_id,
            name: pack_path.to_string_lossy().into_owned(),
            pack_path: pack_path.clone(),
            idx_path,
            idx_map,
            object_count,
        });
        st.packs.insert(
            pack_path,
            PackEntry {
                refs: 1,
                pack: Arc::clone(&pack),
            },
        );
        Ok(pack)
    }

    /// Releases one reference to a pack. The last release drops the
    /// registry entry and unmaps the pack's windows.
    ///
    /// # Errors
    /// Fails only when the cache mutex is poisoned.
    pub fn put_pack(&self, pack: &Arc<PackFile>) -> Result<(), MwindowError> {
        let mut st = self.lock_state()?;
        let Some(entry) = st.packs.get_mut(&pack.pack_path) else {
            debug_assert!(false, "pack put without a matching get");
            return Ok(());
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            st.packs.remove(&pack.pack_path);
            Self::free_file_locked(&mut st, pack.file_id);
        }
        Ok(())
    }
}
