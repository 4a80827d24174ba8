//! Zero-copy multi-pack index (MIDX) parser and lookup.
//!
//! Parses and validates the MIDX structure: header, chunk directory, the
//! five known chunks, and the trailing SHA-1 checksum. The view is
//! zero-copy: all slices reference the original byte buffer, which must
//! outlive the `MidxView`.
//!
//! `MidxLayout` is the validated result of parsing expressed as offsets
//! rather than borrows, so an owning reader (`MidxFile`) can hold the
//! mapping and the layout side by side and rebuild views on demand.
//!
//! # Scope
//! - Supports MIDX version 1, object-ID version 1 (20-byte OIDs) only.
//! - Chained indexes (`base_midx_files > 0`) are rejected.
//!
//! # Complexity
//! - `find` is `O(log N)` via fanout-bucketed binary search.
//! - `entry_at` is `O(1)` and may follow a LOFF indirection.

use std::ops::Range;

use sha1::{Digest, Sha1};

use crate::midx_error::{ChunkId, MidxError};
use crate::object_id::ObjectId;

/// MIDX magic bytes.
pub(crate) const MIDX_SIGNATURE: [u8; 4] = *b"MIDX";
/// MIDX version 1 (only supported version).
pub(crate) const MIDX_VERSION: u8 = 1;
/// Object-ID version 1 (20-byte OIDs).
pub(crate) const MIDX_OID_VERSION: u8 = 1;
/// MIDX header size in bytes.
pub(crate) const MIDX_HEADER_SIZE: usize = 12;
/// Chunk directory entry size (4 ID + 8 offset).
pub(crate) const CHUNK_ENTRY_SIZE: usize = 12;
/// PNAM chunk ID (packfile names).
pub(crate) const CHUNK_PNAM: [u8; 4] = *b"PNAM";
/// OIDF chunk ID (OID fanout).
pub(crate) const CHUNK_OIDF: [u8; 4] = *b"OIDF";
/// OIDL chunk ID (OID lookup).
pub(crate) const CHUNK_OIDL: [u8; 4] = *b"OIDL";
/// OOFF chunk ID (object offsets).
pub(crate) const CHUNK_OOFF: [u8; 4] = *b"OOFF";
/// LOFF chunk ID (large offsets, optional).
pub(crate) const CHUNK_LOFF: [u8; 4] = *b"LOFF";
/// Fanout table size in bytes.
pub(crate) const FANOUT_SIZE: usize = 256 * 4;
/// MSB mask marking a LOFF indirection in OOFF entries.
pub(crate) const LOFF_FLAG: u32 = 0x8000_0000;

/// A single resolved MIDX entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidxEntry {
    /// The full object ID.
    pub oid: ObjectId,
    /// Index into the packfile-names table.
    pub pack_index: u32,
    /// Byte offset of the object inside that pack.
    pub offset: u64,
}

/// Validated chunk geometry of a parsed MIDX, expressed as offsets.
///
/// # Invariants
/// - Every range lies within the buffer the layout was parsed from and
///   before the 20-byte trailer.
/// - `object_count` equals `fanout[255]`; `pack_count` equals the number
///   of names in PNAM.
/// - `checksum` equals the SHA-1 of everything preceding the trailer.
#[derive(Debug, Clone)]
pub struct MidxLayout {
    pnam: Range<usize>,
    oidf: Range<usize>,
    oidl: Range<usize>,
    ooff: Range<usize>,
    loff: Option<Range<usize>>,
    pack_count: u32,
    object_count: u32,
    checksum: ObjectId,
}

impl MidxLayout {
    /// Parses and fully validates a MIDX buffer, including the trailing
    /// checksum.
    ///
    /// # Errors
    /// Returns `MidxError` with the violated invariant when the buffer is
    /// not a well-formed multi-pack index.
    pub fn parse(data: &[u8]) -> Result<Self, MidxError> {
        if data.len() < MIDX_HEADER_SIZE + ObjectId::RAW_LEN {
            return Err(MidxError::corrupt("multi-pack index is too short"));
        }

        if data[0..4] != MIDX_SIGNATURE
            || data[4] != MIDX_VERSION
            || data[5] != MIDX_OID_VERSION
        {
            return Err(MidxError::corrupt("unsupported multi-pack index version"));
        }

        let chunks = data[6];
        if chunks == 0 {
            return Err(MidxError::corrupt("no chunks in multi-pack index"));
        }
        if data[7] != 0 {
            return Err(MidxError::corrupt("chained multi-pack index not supported"));
        }
        let pack_count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        // The first chunk starts after the header, the chunk directory, and
        // the terminating zero entry.
        let dir_end = MIDX_HEADER_SIZE + (chunks as usize + 1) * CHUNK_ENTRY_SIZE;
        let trailer_offset = data.len() - ObjectId::RAW_LEN;
        if trailer_offset < dir_end {
            return Err(MidxError::corrupt("wrong index size"));
        }

        let checksum = ObjectId::from_slice(&data[trailer_offset..]);
        let computed: [u8; 20] = Sha1::digest(&data[..trailer_offset]).into();
        if computed != *checksum.as_bytes() {
            return Err(MidxError::corrupt("index signature mismatch"));
        }

        let entries = Self::walk_chunk_directory(data, chunks, dir_end, trailer_offset)?;

        let mut pnam = None;
        let mut oidf = None;
        let mut oidl = None;
        let mut ooff = None;
        let mut loff = None;
        for (id, range) in entries {
            let slot = match id {
                CHUNK_PNAM => &mut pnam,
                CHUNK_OIDF => &mut oidf,
                CHUNK_OIDL => &mut oidl,
                CHUNK_OOFF => &mut ooff,
                CHUNK_LOFF => &mut loff,
                other => {
                    return Err(MidxError::UnknownChunk {
                        chunk_id: ChunkId::new(other),
                    })
                }
            };
            if slot.is_some() {
                return Err(MidxError::DuplicateChunk {
                    chunk_id: ChunkId::new(id),
                });
            }
            *slot = Some(range);
        }

        let pnam = pnam.ok_or_else(|| MidxError::corrupt("missing Packfile Names chunk"))?;
        let oidf = oidf.ok_or_else(|| MidxError::corrupt("missing OID Fanout chunk"))?;
        let oidl = oidl.ok_or_else(|| MidxError::corrupt("missing OID Lookup chunk"))?;
        let ooff = ooff.ok_or_else(|| MidxError::corrupt("missing Object Offsets chunk"))?;
        // A zero-length LOFF chunk is treated as absent.
        let loff = loff.filter(|r| !r.is_empty());

        validate_pnam(&data[pnam.clone()], pack_count)?;
        let object_count = validate_fanout(&data[oidf.clone()])?;
        validate_oidl(&data[oidl.clone()], object_count)?;

        if ooff.is_empty() {
            return Err(MidxError::corrupt("empty Object Offsets chunk"));
        }
        if ooff.len() as u64 != u64::from(object_count) * 8 {
            return Err(MidxError::corrupt("Object Offsets chunk has wrong length"));
        }
        if let Some(loff) = &loff {
            if loff.len() % 8 != 0 {
                return Err(MidxError::corrupt("malformed Object Large Offsets chunk"));
            }
        }

        Ok(Self {
            pnam,
            oidf,
            oidl,
            ooff,
            loff,
            pack_count,
            object_count,
            checksum,
        })
    }

    /// Returns the number of packs referenced.
    #[inline]
    pub fn pack_count(&self) -> u32 {
        self.pack_count
    }

    /// Returns the number of objects indexed.
    #[inline]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Returns the trailer checksum.
    #[inline]
    pub fn checksum(&self) -> &ObjectId {
        &self.checksum
    }

    /// Walks the chunk directory, enforcing monotonic offsets and deriving
    /// chunk lengths from the following entry (the last chunk runs to the
    /// trailer).
    fn walk_chunk_directory(
        data: &[u8],
        chunks: u8,
        dir_end: usize,
        trailer_offset: usize,
    ) -> Result<Vec<([u8; 4], Range<usize>)>, MidxError> {
        let mut offsets = Vec::with_capacity(chunks as usize);
        let mut prev = dir_end as u64;

        for i in 0..chunks as usize {
            let entry = &data[MIDX_HEADER_SIZE + i * CHUNK_ENTRY_SIZE..][..CHUNK_ENTRY_SIZE];
            let id: [u8; 4] = [entry[0], entry[1], entry[2], entry[3]];
            let hi = u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]);
            let lo = u32::from_be_bytes([entry[8], entry[9], entry[10], entry[11]]);
            let offset = (u64::from(hi) << 32) | u64::from(lo);

            if offset < prev {
                return Err(MidxError::corrupt("chunks are non-monotonic"));
            }
            if offset >= trailer_offset as u64 {
                return Err(MidxError::corrupt("chunks extend beyond the trailer"));
            }
            offsets.push((id, offset as usize));
            prev = offset;
        }

        let mut out = Vec::with_capacity(offsets.len());
        for (i, (id, start)) in offsets.iter().enumerate() {
            let end = offsets
                .get(i + 1)
                .map_or(trailer_offset, |(_, next)| *next);
            out.push((*id, *start..end));
        }
        Ok(out)
    }
}

/// Validates PNAM: `pack_count` non-empty, NUL-terminated, strictly
/// increasing names, each ending in `.idx` and free of path separators.
fn validate_pnam(pnam: &[u8], pack_count: u32) -> Result<(), MidxError> {
    if pnam.is_empty() {
        return Err(MidxError::corrupt("empty Packfile Names chunk"));
    }

    let mut rest = pnam;
    let mut prev: Option<&[u8]> = None;
    for _ in 0..pack_count {
        let len = rest.iter().position(|&b| b == 0);
        let Some(len) = len else {
            return Err(MidxError::corrupt("unterminated packfile name"));
        };
        if len == 0 {
            return Err(MidxError::corrupt("empty packfile name"));
        }
        let name = &rest[..len];
        if let Some(prev) = prev {
            if prev >= name {
                return Err(MidxError::corrupt("packfile names are not sorted"));
            }
        }
        if len <= 4 || !name.ends_with(b".idx") {
            return Err(MidxError::corrupt("non-.idx packfile name"));
        }
        if name.contains(&b'/') || name.contains(&b'\\') {
            return Err(MidxError::corrupt("non-local packfile"));
        }
        prev = Some(name);
        rest = &rest[len + 1..];
    }
    Ok(())
}

/// Validates OIDF and returns the total object count (`fanout[255]`).
fn validate_fanout(oidf: &[u8]) -> Result<u32, MidxError> {
    if oidf.is_empty() {
        return Err(MidxError::corrupt("empty OID Fanout chunk"));
    }
    if oidf.len() != FANOUT_SIZE {
        return Err(MidxError::corrupt("OID Fanout chunk has wrong length"));
    }
    let mut prev = 0u32;
    for chunk in oidf.chunks_exact(4) {
        let val = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if val < prev {
            return Err(MidxError::corrupt("index is non-monotonic"));
        }
        prev = val;
    }
    Ok(prev)
}

/// Validates OIDL: exact length and strictly increasing OIDs.
fn validate_oidl(oidl: &[u8], object_count: u32) -> Result<(), MidxError> {
    if oidl.is_empty() {
        return Err(MidxError::corrupt("empty OID Lookup chunk"));
    }
    if oidl.len() as u64 != u64::from(object_count) * ObjectId::RAW_LEN as u64 {
        return Err(MidxError::corrupt("OID Lookup chunk has wrong length"));
    }
    let mut prev: Option<&[u8]> = None;
    for oid in oidl.chunks_exact(ObjectId::RAW_LEN) {
        if let Some(prev) = prev {
            if prev >= oid {
                return Err(MidxError::corrupt("OID Lookup index is non-monotonic"));
            }
        }
        prev = Some(oid);
    }
    Ok(())
}

/// Zero-copy view over a parsed multi-pack index.
#[derive(Debug, Clone, Copy)]
pub struct MidxView<'a> {
    pnam: &'a [u8],
    oidf: &'a [u8],
    oidl: &'a [u8],
    ooff: &'a [u8],
    loff: Option<&'a [u8]>,
    pack_count: u32,
    object_count: u32,
}

impl<'a> MidxView<'a> {
    /// Parses and validates a MIDX buffer, returning the view and its
    /// layout.
    ///
    /// # Errors
    /// Returns `MidxError` when the buffer is malformed or its trailing
    /// checksum does not match.
    pub fn parse(data: &'a [u8]) -> Result<(Self, MidxLayout), MidxError> {
        let layout = MidxLayout::parse(data)?;
        Ok((Self::from_layout(data, &layout), layout))
    }

    /// Rebuilds a view from a buffer and a layout previously parsed from
    /// the same bytes. No validation is repeated.
    #[must_use]
    pub fn from_layout(data: &'a [u8], layout: &MidxLayout) -> Self {
        Self {
            pnam: &data[layout.pnam.clone()],
            oidf: &data[layout.oidf.clone()],
            oidl: &data[layout.oidl.clone()],
            ooff: &data[layout.ooff.clone()],
            loff: layout.loff.clone().map(|r| &data[r]),
            pack_count: layout.pack_count,
            object_count: layout.object_count,
        }
    }

    /// Returns the number of packs referenced.
    #[inline]
    pub fn pack_count(&self) -> u32 {
        self.pack_count
    }

    /// Returns the number of objects indexed.
    #[inline]
    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Returns the fanout value for a first-byte value: the exclusive upper
    /// bound of that byte's bucket in the OID list.
    #[inline]
    pub fn fanout(&self, first_byte: u8) -> u32 {
        let off = first_byte as usize * 4;
        u32::from_be_bytes([
            self.oidf[off],
            self.oidf[off + 1],
            self.oidf[off + 2],
            self.oidf[off + 3],
        ])
    }

    /// Returns the OID bytes at the given lookup index.
    ///
    /// # Panics
    /// Panics in debug builds if `idx` is out of range.
    #[inline]
    pub fn oid_at(&self, idx: u32) -> &'a [u8] {
        debug_assert!(idx < self.object_count, "OID index out of bounds");
        let start = idx as usize * ObjectId::RAW_LEN;
        &self.oidl[start..start + ObjectId::RAW_LEN]
    }

    /// Returns an iterator over pack names from PNAM, excluding NUL
    /// terminators and trailing padding.
    pub fn pack_names(&self) -> impl Iterator<Item = &'a [u8]> {
        self.pnam.split(|&b| b == 0).filter(|s| !s.is_empty())
    }

    /// Returns the pack name at a PNAM position.
    #[must_use]
    pub fn pack_name_at(&self, pack_index: u32) -> Option<&'a [u8]> {
        self.pack_names().nth(pack_index as usize)
    }

    /// Resolves the entry at a lookup index, following LOFF indirections.
    ///
    /// # Errors
    /// Returns `LoffIndexOutOfBounds` or `PackIndexOutOfBounds` for
    /// malformed OOFF entries.
    pub fn entry_at(&self, idx: u32) -> Result<MidxEntry, MidxError> {
        debug_assert!(idx < self.object_count, "entry index out of bounds");
        let entry = &self.ooff[idx as usize * 8..][..8];
        let pack_index = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let word = u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]);

        let offset = if word & LOFF_FLAG == 0 {
            u64::from(word)
        } else {
            self.resolve_loff(word & !LOFF_FLAG)?
        };

        if pack_index >= self.pack_count {
            return Err(MidxError::PackIndexOutOfBounds {
                pack_index,
                pack_count: self.pack_count,
            });
        }

        Ok(MidxEntry {
            oid: ObjectId::from_slice(self.oid_at(idx)),
            pack_index,
            offset,
        })
    }

    /// Looks up an object by a (possibly abbreviated) OID.
    ///
    /// `prefix` carries the raw candidate bytes; `hex_len` is the number of
    /// significant leading nibbles (at most 40). An abbreviation that
    /// matches more than one entry yields `Ambiguous`.
    ///
    /// # Errors
    /// `NotFound` / `Ambiguous` as lookup outcomes, or a corrupt-entry
    /// error while resolving the matched position.
    pub fn find(&self, prefix: &ObjectId, hex_len: usize) -> Result<MidxEntry, MidxError> {
        let hex_len = hex_len.min(ObjectId::HEX_LEN);
        let first = prefix.first_byte();
        let hi = self.fanout(first);
        let lo = if first == 0 { 0 } else { self.fanout(first - 1) };

        let target = prefix.as_bytes().as_slice();
        let mut left = lo;
        let mut right = hi;
        let mut exact = None;
        while left < right {
            let mid = left + (right - left) / 2;
            match target.cmp(self.oid_at(mid)) {
                std::cmp::Ordering::Less => right = mid,
                std::cmp::Ordering::Greater => left = mid + 1,
                std::cmp::Ordering::Equal => {
                    exact = Some(mid);
                    break;
                }
            }
        }

        // On a miss, `left` is the insertion point: the first OID >= prefix.
        let pos = exact.unwrap_or(left);
        let found = exact.is_some()
            || (pos < self.object_count && prefix.prefix_matches(self.oid_at(pos), hex_len));
        if !found {
            return Err(MidxError::NotFound);
        }

        if hex_len < ObjectId::HEX_LEN
            && pos + 1 < self.object_count
            && prefix.prefix_matches(self.oid_at(pos + 1), hex_len)
        {
            return Err(MidxError::Ambiguous);
        }

        self.entry_at(pos)
    }

    /// Resolves a LOFF indirection to a 64-bit pack offset.
    fn resolve_loff(&self, idx: u32) -> Result<u64, MidxError> {
        let loff = self
            .loff
            .ok_or_else(|| MidxError::corrupt("LOFF indirection but no LOFF chunk"))?;
        let count = (loff.len() / 8) as u32;
        if idx >= count {
            return Err(MidxError::LoffIndexOutOfBounds { index: idx, count });
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&loff[idx as usize * 8..][..8]);
        Ok(u64::from_be_bytes(bytes))
    }
}
