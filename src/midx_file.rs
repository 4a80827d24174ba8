//! Owning multi-pack index reader.
//!
//! `MidxFile` maps the `multi-pack-index` file, validates it once
//! (including the trailing checksum), and serves lookups from the mapping
//! for its whole lifetime. Because the on-disk file can be replaced by a
//! maintenance run at any time, `needs_refresh` tells callers when the
//! loaded image went stale.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::futils;
use crate::midx::{MidxEntry, MidxLayout, MidxView};
use crate::midx_error::MidxError;
use crate::object_id::ObjectId;

/// An opened, validated multi-pack index.
pub struct MidxFile {
    path: PathBuf,
    map: Mmap,
    layout: MidxLayout,
}

impl MidxFile {
    /// Opens and fully validates a multi-pack index file.
    ///
    /// On failure nothing is left behind: the descriptor and mapping are
    /// released before the error returns.
    ///
    /// # Errors
    /// `Io` when the file cannot be opened or mapped, or a format error
    /// from validation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MidxError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(MidxError::corrupt("not a regular file"));
        }

        let map = futils::map_file_ro(&file)?;
        let layout = MidxLayout::parse(&map)?;
        Ok(Self { path, map, layout })
    }

    /// Returns the path this index was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of objects indexed.
    #[inline]
    #[must_use]
    pub fn object_count(&self) -> u32 {
        self.layout.object_count()
    }

    /// Returns the number of packs referenced.
    #[inline]
    #[must_use]
    pub fn pack_count(&self) -> u32 {
        self.layout.pack_count()
    }

    /// Returns the trailer checksum.
    #[must_use]
    pub fn checksum(&self) -> &ObjectId {
        self.layout.checksum()
    }

    /// Returns a zero-copy view over the mapped index.
    #[must_use]
    pub fn view(&self) -> MidxView<'_> {
        MidxView::from_layout(&self.map, &self.layout)
    }

    /// Looks up an object by a (possibly abbreviated) OID.
    ///
    /// # Errors
    /// `NotFound` / `Ambiguous` as lookup outcomes, or a corrupt-entry
    /// error while resolving the matched position.
    pub fn find(&self, prefix: &ObjectId, hex_len: usize) -> Result<MidxEntry, MidxError> {
        self.view().find(prefix, hex_len)
    }

    /// Returns the pack name at a PNAM position.
    #[must_use]
    pub fn pack_name_at(&self, pack_index: u32) -> Option<&[u8]> {
        self.view().pack_name_at(pack_index)
    }

    /// Returns an iterator over all indexed OIDs, in sorted order.
    pub fn oids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let view = self.view();
        (0..view.object_count()).map(move |idx| ObjectId::from_slice(view.oid_at(idx)))
    }

    /// Returns an iterator over all entries, in OID order.
    pub fn entries(&self) -> impl Iterator<Item = Result<MidxEntry, MidxError>> + '_ {
        let view = self.view();
        (0..view.object_count()).map(move |idx| view.entry_at(idx))
    }

    /// Returns true when the on-disk file at `path` no longer matches the
    /// loaded image: it cannot be opened or statted, is not a regular
    /// file, has a different size, or carries a different trailing
    /// checksum.
    #[must_use]
    pub fn needs_refresh(&self, path: &Path) -> bool {
        let Ok(mut file) = File::open(path) else {
            return true;
        };
        let Ok(meta) = file.metadata() else {
            return true;
        };
        if !meta.is_file() || meta.len() != self.map.len() as u64 {
            return true;
        }

        let mut trailer = [0u8; ObjectId::RAW_LEN];
        if file
            .seek(SeekFrom::End(-(ObjectId::RAW_LEN as i64)))
            .is_err()
            || file.read_exact(&mut trailer).is_err()
        {
            return true;
        }
        trailer != *self.layout.checksum().as_bytes()
    }
}

impl std::fmt::Debug for MidxFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidxFile")
            .field("path", &self.path)
            .field("object_count", &self.object_count())
            .field("pack_count", &self.pack_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midx::tests::{test_oid, MidxBuilder};
    use std::fs;

    fn fixture(dir: &Path) -> PathBuf {
        let data = MidxBuilder::new()
            .add_pack(b"pack-aaaa.idx")
            .add_pack(b"pack-bbbb.idx")
            .add_object(test_oid(0x11, 0x01), 0, 100)
            .add_object(test_oid(0x22, 0x02), 1, 200)
            .add_object(test_oid(0xfe, 0x03), 1, 300)
            .build();
        let path = dir.join("multi-pack-index");
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn open_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());

        let midx = MidxFile::open(&path).unwrap();
        assert_eq!(midx.object_count(), 3);
        assert_eq!(midx.pack_count(), 2);

        let entry = midx
            .find(&ObjectId::from_bytes(test_oid(0x22, 0x02)), 40)
            .unwrap();
        assert_eq!(entry.pack_index, 1);
        assert_eq!(entry.offset, 200);
        assert_eq!(midx.pack_name_at(entry.pack_index), Some(&b"pack-bbbb.idx"[..]));
    }

    #[test]
    fn open_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MidxFile::open(dir.path().join("multi-pack-index")).unwrap_err();
        assert!(matches!(err, MidxError::Io(_)));
    }

    #[test]
    fn open_corrupt_trailer_fails_with_signature_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        let err = MidxFile::open(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid multi-pack-index file - index signature mismatch"
        );
    }

    #[test]
    fn iterators_walk_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let midx = MidxFile::open(&path).unwrap();

        let oids: Vec<_> = midx.oids().collect();
        assert_eq!(oids.len(), 3);
        assert!(oids.windows(2).all(|w| w[0] < w[1]));

        let entries: Vec<_> = midx.entries().map(Result::unwrap).collect();
        assert_eq!(entries[0].offset, 100);
        assert_eq!(entries[2].pack_index, 1);
    }

    #[test]
    fn needs_refresh_tracks_on_disk_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let midx = MidxFile::open(&path).unwrap();

        // Unchanged on disk.
        assert!(!midx.needs_refresh(&path));

        // Trailer byte flipped: stale.
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert!(midx.needs_refresh(&path));

        // Deleted: stale.
        fs::remove_file(&path).unwrap();
        assert!(midx.needs_refresh(&path));
    }

    #[test]
    fn needs_refresh_detects_size_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let midx = MidxFile::open(&path).unwrap();

        let mut data = fs::read(&path).unwrap();
        data.push(0);
        fs::write(&path, &data).unwrap();
        assert!(midx.needs_refresh(&path));
    }
}
