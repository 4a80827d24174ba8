//! Filesystem helpers: read-only mappings, atomic writes, lexical paths.
//!
//! Path manipulation here is purely lexical. Nothing in this module touches
//! symlinks or requires the target to exist, which keeps the pack registry's
//! canonical keys usable for packs that have an `.idx` but no `.pack` yet.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use memmap2::Mmap;

/// Memory-maps a file read-only.
///
/// # Errors
/// Returns the underlying `mmap` failure.
pub fn map_file_ro(file: &File) -> io::Result<Mmap> {
    // SAFETY: callers only map pack artifacts (.pack/.idx/multi-pack-index),
    // which are immutable once written; replacement happens via rename.
    let map = unsafe { Mmap::map(file)? };
    advise_sequential(file, &map);
    Ok(map)
}

#[cfg(unix)]
fn advise_sequential(file: &File, map: &Mmap) {
    #[cfg(target_os = "linux")]
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is valid for the duration of `fadvise`, and the
    // map pointer/length are valid for `madvise`. Both calls are advisory;
    // errors are silently ignored.
    unsafe {
        #[cfg(target_os = "linux")]
        let _ = libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
        #[cfg(not(target_os = "linux"))]
        let _ = file;
        let _ = libc::madvise(
            map.as_ptr() as *mut libc::c_void,
            map.len(),
            libc::MADV_SEQUENTIAL,
        );
    }
}

#[cfg(not(unix))]
fn advise_sequential(_file: &File, _map: &Mmap) {}

/// Writes `bytes` to `path` atomically: temp file in the same directory,
/// flushed to disk, then renamed over the destination.
///
/// `mode` is applied on Unix before the rename and ignored elsewhere.
///
/// # Errors
/// Returns the first I/O failure; the destination is either the previous
/// file or the new one, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Lexically normalizes a path: collapses `.`, resolves `..` against
/// preceding components, and squashes redundant separators.
///
/// Leading `..` components of a relative path are preserved; `..` never
/// escapes a root.
#[must_use]
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Returns `path` relative to `base`, or `None` when `path` does not sit
/// under `base`. Both inputs are normalized lexically first.
#[must_use]
pub fn make_relative(path: &Path, base: &Path) -> Option<PathBuf> {
    let path = normalize_lexical(path);
    let base = normalize_lexical(base);
    path.strip_prefix(&base).ok().map(Path::to_path_buf)
}
