//! Process-wide LRU cache of memory-mapped windows over pack files.
//!
//! Packs are read through fixed-size mapped windows so that a repository
//! with many large packs never maps more than `mapped_limit` bytes at a
//! time. Windows are shared: any number of cursors may pin the same window
//! concurrently, and a pinned window (`inuse > 0`) is never unmapped.
//!
//! A single mutex guards every structural mutation of the cache, including
//! the pack registry that lives alongside it (see `pack`). Reads through a
//! pinned cursor are lock-free: the pin guarantees the mapping outlives
//! the borrow.
//!
//! `mapped_limit` is a soft cap. When nothing is evictable the cache maps
//! past the limit rather than failing, and a failed `mmap` triggers one
//! evict-everything retry before the error is surfaced.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use memmap2::{Mmap, MmapOptions};

use crate::pack::PackEntry;

/// Tuning knobs for the window cache.
///
/// `window_size` should stay a multiple of twice the system page size:
/// windows are aligned down to `window_size / 2`, and the mapping offset
/// must land on a page boundary.
#[derive(Debug, Clone, Copy)]
pub struct MwindowConfig {
    /// Maximum bytes mapped by a single window.
    pub window_size: u64,
    /// Soft cap on the total mapped bytes across all windows.
    pub mapped_limit: u64,
    /// Maximum number of open window files; 0 means unlimited.
    pub file_limit: usize,
}

impl Default for MwindowConfig {
    fn default() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self {
                window_size: 1024 * 1024 * 1024,
                mapped_limit: 8192 * 1024 * 1024,
                file_limit: 0,
            }
        } else {
            Self {
                window_size: 32 * 1024 * 1024,
                mapped_limit: 256 * 1024 * 1024,
                file_limit: 0,
            }
        }
    }
}

/// Errors from window-cache operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum MwindowError {
    /// Opening, statting, or mapping a window file failed.
    Io(io::Error),
    /// The cache mutex was poisoned by a panicking holder.
    LockPoisoned,
    /// The requested range does not lie within the file.
    OffsetOutOfBounds { offset: u64, size: u64 },
    /// The owning cache was dropped while a pack handle was still alive.
    CacheShutDown,
}

impl fmt::Display for MwindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "window file I/O error: {err}"),
            Self::LockPoisoned => write!(f, "failed to lock mwindow mutex"),
            Self::OffsetOutOfBounds { offset, size } => {
                write!(f, "window offset {offset} out of bounds (file size {size})")
            }
            Self::CacheShutDown => write!(f, "window cache was shut down"),
        }
    }
}

impl std::error::Error for MwindowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for MwindowError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Counter snapshot of the cache, for tests and monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MwindowStats {
    /// Bytes currently mapped across all windows.
    pub mapped: u64,
    /// Windows currently mapped.
    pub open_windows: usize,
    /// Window files currently open.
    pub open_files: usize,
    /// Packs currently held by the registry.
    pub open_packs: usize,
    /// Total `mmap` calls since creation.
    pub mmap_calls: u64,
    /// High-water mark of `mapped`.
    pub peak_mapped: u64,
    /// High-water mark of `open_windows`.
    pub peak_open_windows: usize,
}

/// A single mapped window. Boxed for a stable address; cursors hold raw
/// pointers to pinned windows.
struct Window {
    base: u64,
    map: Mmap,
    inuse: u32,
    last_used: u64,
}

impl Window {
    #[inline]
    fn contains(&self, offset: u64, extra: u64) -> bool {
        offset >= self.base && offset + extra <= self.base + self.map.len() as u64
    }
}

/// Per-file window list plus the open descriptor.
struct FileSlot {
    path: PathBuf,
    file: File,
    size: u64,
    windows: Vec<Box<Window>>,
}

/// Everything the cache mutex protects, pack registry included.
pub(crate) struct CacheState {
    files: HashMap<u64, FileSlot>,
    pub(crate) packs: HashMap<PathBuf, PackEntry>,
    pub(crate) next_file_id: u64,
    mapped: u64,
    open_windows: usize,
    used_ctr: u64,
    mmap_calls: u64,
    peak_mapped: u64,
    peak_open_windows: usize,
}

/// Process-wide window cache and pack registry.
///
/// # Invariants
/// - `mapped` equals the sum of all window lengths at all times.
/// - A window with `inuse > 0` is never unmapped.
/// - All structural mutation happens under `state`.
pub struct MwindowCache {
    config: MwindowConfig,
    pub(crate) state: Mutex<CacheState>,
}

impl MwindowCache {
    /// Creates a cache with the given configuration.
    ///
    /// Explicit handles keep tests hermetic; production code normally uses
    /// [`MwindowCache::global`].
    #[must_use]
    pub fn new(config: MwindowConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(CacheState {
                files: HashMap::new(),
                packs: HashMap::new(),
                next_file_id: 0,
                mapped: 0,
                open_windows: 0,
                used_ctr: 0,
                mmap_calls: 0,
                peak_mapped: 0,
                peak_open_windows: 0,
            }),
        })
    }

    /// Returns the process-wide cache, created on first use with default
    /// configuration.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<MwindowCache>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Self::new(MwindowConfig::default()))
            .clone()
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &MwindowConfig {
        &self.config
    }

    /// Drops all registry entries and unmaps every window.
    ///
    /// Safe to call repeatedly. Callers must have released all cursors;
    /// a still-pinned window at shutdown is a caller bug.
    pub fn shutdown(&self) {
        let mut st = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        st.packs.clear();
        let ids: Vec<u64> = st.files.keys().copied().collect();
        for id in ids {
            Self::free_file_locked(&mut st, id);
        }
    }

    /// Returns a snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> MwindowStats {
        let st = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        MwindowStats {
            mapped: st.mapped,
            open_windows: st.open_windows,
            open_files: st.files.len(),
            open_packs: st.packs.len(),
            mmap_calls: st.mmap_calls,
            peak_mapped: st.peak_mapped,
            peak_open_windows: st.peak_open_windows,
        }
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>, MwindowError> {
        self.state.lock().map_err(|_| MwindowError::LockPoisoned)
    }

    /// Returns a readable slice of `file_id` starting at `offset`, running
    /// to the end of the chosen window.
    ///
    /// `extra` is the number of bytes past `offset` the caller needs
    /// contiguous; it steers window selection and must not extend past the
    /// file. The cursor pins the window until it is released, re-targeted,
    /// or dropped; a cursor already covering the range is reused as-is.
    ///
    /// # Errors
    /// `OffsetOutOfBounds` for ranges outside the file, `Io` when the file
    /// cannot be opened or mapped even after eviction.
    pub(crate) fn window_open<'c>(
        self: &Arc<Self>,
        file_id: u64,
        path: &Path,
        cursor: &'c mut WindowCursor,
        offset: u64,
        extra: u64,
    ) -> Result<&'c [u8], MwindowError> {
        // A cursor pinned by a different cache must release through that
        // cache's own lock.
        if cursor.window.is_some()
            && !cursor.cache.as_ref().is_some_and(|c| Arc::ptr_eq(c, self))
        {
            cursor.release();
        }

        let mut st = self.lock_state()?;

        if let Some(win) = cursor.window {
            // SAFETY: the cursor's pin (inuse > 0) keeps the window alive,
            // and the cache lock serializes field access.
            let w = unsafe { win.as_ref() };
            if cursor.file_id == file_id && w.contains(offset, extra) {
                let delta = (offset - w.base) as usize;
                // SAFETY: the slice stays within the pinned mapping, and the
                // pin outlives the returned borrow (it is only dropped via
                // `&mut WindowCursor`).
                return Ok(unsafe {
                    std::slice::from_raw_parts(w.map.as_ptr().add(delta), w.map.len() - delta)
                });
            }
            cursor.window = None;
            // SAFETY: the pin is still held at this point; see above.
            unsafe { (*win.as_ptr()).inuse -= 1 };
        }

        // First use, or the slot was dropped by `close_lru_file`: (re)open.
        if !st.files.contains_key(&file_id) {
            let file = File::open(path)?;
            let size = file.metadata()?.len();
            if self.config.file_limit > 0 {
                while st.files.len() + 1 > self.config.file_limit
                    && Self::close_lru_file(&mut st)
                {}
            }
            st.files.insert(
                file_id,
                FileSlot {
                    path: path.to_path_buf(),
                    file,
                    size,
                    windows: Vec::new(),
                },
            );
        }

        let size = st.files[&file_id].size;
        if size == 0 || offset >= size || offset.saturating_add(extra) > size {
            return Err(MwindowError::OffsetOutOfBounds { offset, size });
        }

        let mut chosen: Option<NonNull<Window>> = None;
        let slot = st
            .files
            .get_mut(&file_id)
            .expect("window file slot just ensured");
        for w in &mut slot.windows {
            if w.contains(offset, extra) {
                chosen = Some(NonNull::from(&mut **w));
                break;
            }
        }
        let win = match chosen {
            Some(win) => win,
            None => self.new_window(&mut st, file_id, offset)?,
        };

        // SAFETY: `win` points into a live Box owned by the slot; the lock
        // is held for the field updates.
        unsafe {
            (*win.as_ptr()).last_used = st.used_ctr;
            (*win.as_ptr()).inuse += 1;
        }
        st.used_ctr += 1;
        cursor.cache = Some(Arc::clone(self));
        cursor.file_id = file_id;
        cursor.window = Some(win);

        // SAFETY: as in the fast path; the fresh pin keeps the mapping
        // valid for the returned borrow.
        let w = unsafe { win.as_ref() };
        let delta = (offset - w.base) as usize;
        Ok(unsafe { std::slice::from_raw_parts(w.map.as_ptr().add(delta), w.map.len() - delta) })
    }

    /// Maps a new window covering `offset`, evicting unused windows to stay
    /// under the soft limit.
    fn new_window(
        &self,
        st: &mut CacheState,
        file_id: u64,
        offset: u64,
    ) -> Result<NonNull<Window>, MwindowError> {
        let size = st.files[&file_id].size;
        let walign = (self.config.window_size / 2).max(1);
        let base = (offset / walign) * walign;
        let len = self.config.window_size.min(size - base);

        while st.mapped + len > self.config.mapped_limit && Self::close_lru_window(st) {}

        let map = match Self::map_range(&st.files[&file_id].file, base, len) {
            Ok(map) => map,
            Err(first_err) => {
                // The failure might be address-space fragmentation even
                // under the soft limit; evict everything and retry once.
                while Self::close_lru_window(st) {}
                match Self::map_range(&st.files[&file_id].file, base, len) {
                    Ok(map) => map,
                    Err(_) => return Err(MwindowError::Io(first_err)),
                }
            }
        };

        st.mapped += len;
        st.open_windows += 1;
        st.mmap_calls += 1;
        st.peak_mapped = st.peak_mapped.max(st.mapped);
        st.peak_open_windows = st.peak_open_windows.max(st.open_windows);

        let mut window = Box::new(Window {
            base,
            map,
            inuse: 0,
            last_used: 0,
        });
        let ptr = NonNull::from(&mut *window);
        st.files
            .get_mut(&file_id)
            .expect("window file slot present")
            .windows
            .push(window);
        Ok(ptr)
    }

    fn map_range(file: &File, base: u64, len: u64) -> io::Result<Mmap> {
        // SAFETY: window files are pack artifacts, immutable once written;
        // replacement happens via rename, which keeps old mappings intact.
        unsafe { MmapOptions::new().offset(base).len(len as usize).map(file) }
    }

    /// Unmaps the globally least-recently-used unused window. Returns false
    /// when every window is pinned.
    fn close_lru_window(st: &mut CacheState) -> bool {
        let mut lru: Option<(u64, usize, u64)> = None;
        for (&fid, slot) in &st.files {
            for (idx, w) in slot.windows.iter().enumerate() {
                if w.inuse != 0 {
                    continue;
                }
                if lru.is_none_or(|(_, _, last_used)| w.last_used < last_used) {
                    lru = Some((fid, idx, w.last_used));
                }
            }
        }
        let Some((fid, idx, _)) = lru else {
            return false;
        };

        let slot = st.files.get_mut(&fid).expect("LRU window's file present");
        let window = slot.windows.swap_remove(idx);
        st.mapped -= window.map.len() as u64;
        st.open_windows -= 1;
        tracing::debug!(
            base = window.base,
            len = window.map.len(),
            "evicted least-recently-used window"
        );
        true
    }

    /// Closes the file all of whose windows are unused and whose
    /// most-recently-used window is the oldest such MRU across candidates.
    /// Returns false when no file qualifies.
    fn close_lru_file(st: &mut CacheState) -> bool {
        let mut lru: Option<(u64, u64)> = None;
        for (&fid, slot) in &st.files {
            if slot.windows.is_empty() || slot.windows.iter().any(|w| w.inuse != 0) {
                continue;
            }
            let mru = slot
                .windows
                .iter()
                .map(|w| w.last_used)
                .max()
                .expect("non-empty window list");
            if lru.is_none_or(|(_, best)| mru < best) {
                lru = Some((fid, mru));
            }
        }
        let Some((fid, _)) = lru else {
            return false;
        };

        let slot = st.files.remove(&fid).expect("LRU file present");
        for w in &slot.windows {
            st.mapped -= w.map.len() as u64;
            st.open_windows -= 1;
        }
        tracing::debug!(path = %slot.path.display(), "closed least-recently-used window file");
        true
    }

    /// Unmaps all windows of a file being closed and drops its descriptor.
    ///
    /// # Panics
    /// Panics if any window is still pinned; a live borrow at this point is
    /// a caller bug.
    pub(crate) fn free_file(&self, file_id: u64) {
        let mut st = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::free_file_locked(&mut st, file_id);
    }

    pub(crate) fn free_file_locked(st: &mut CacheState, file_id: u64) {
        if let Some(slot) = st.files.remove(&file_id) {
            for w in &slot.windows {
                assert_eq!(w.inuse, 0, "window still borrowed while freeing its file");
                st.mapped -= w.map.len() as u64;
                st.open_windows -= 1;
            }
        }
    }
}

impl fmt::Debug for MwindowCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MwindowCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Cursor over a pinned window.
///
/// While the cursor points at a window, that window's `inuse` count is
/// positive and the mapping cannot be evicted. Dropping or releasing the
/// cursor returns the window to the evictable pool.
pub struct WindowCursor {
    cache: Option<Arc<MwindowCache>>,
    file_id: u64,
    window: Option<NonNull<Window>>,
}

// SAFETY: the raw window pointer is only dereferenced under the cache
// mutex (or through the pin guarantee for mapped bytes), so moving the
// cursor across threads is sound.
unsafe impl Send for WindowCursor {}

impl WindowCursor {
    /// Creates an empty cursor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cache: None,
            file_id: 0,
            window: None,
        }
    }

    /// Returns true if the cursor currently pins a window.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.window.is_some()
    }

    /// Unpins the current window, if any.
    pub fn release(&mut self) {
        let Some(win) = self.window.take() else {
            return;
        };
        let Some(cache) = self.cache.take() else {
            return;
        };
        let lock_result = cache.state.lock();
        if let Ok(guard) = lock_result {
            // SAFETY: the pin was held until this point, so the window is
            // still alive; the lock serializes the count update.
            unsafe { (*win.as_ptr()).inuse -= 1 };
            drop(guard);
        }
    }
}

impl Default for WindowCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WindowCursor {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for WindowCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowCursor")
            .field("file_id", &self.file_id)
            .field("pinned", &self.window.is_some())
            .finish()
    }
}
