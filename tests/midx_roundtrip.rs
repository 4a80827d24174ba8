//! End-to-end write/read flows over a real pack directory.
//!
//! Fixtures are synthesized pack index (`.idx`) files; the writer merges
//! them into a `multi-pack-index`, and the reader is exercised against the
//! on-disk result: full and abbreviated lookups, ambiguity detection,
//! corruption rejection, and staleness tracking.

use std::fs;
use std::path::Path;

use multipack::{
    MidxError, MidxFile, MidxWriter, MwindowCache, MwindowConfig, ObjectId, MIDX_FILE_NAME,
};

/// Builds pack index v2 bytes for the given `(oid, offset)` pairs.
fn idx_bytes(objects: &[([u8; 20], u64)]) -> Vec<u8> {
    let mut objects = objects.to_vec();
    objects.sort_by(|a, b| a.0.cmp(&b.0));

    let mut fanout = vec![0u8; 1024];
    let mut counts = [0u32; 256];
    for (oid, _) in &objects {
        counts[oid[0] as usize] += 1;
    }
    let mut running = 0u32;
    for (i, count) in counts.iter().enumerate() {
        running += count;
        fanout[i * 4..i * 4 + 4].copy_from_slice(&running.to_be_bytes());
    }

    let mut offsets = Vec::new();
    let mut large = Vec::new();
    for (_, offset) in &objects {
        if *offset >= 0x8000_0000 {
            let idx = (large.len() / 8) as u32;
            offsets.extend_from_slice(&(0x8000_0000u32 | idx).to_be_bytes());
            large.extend_from_slice(&offset.to_be_bytes());
        } else {
            offsets.extend_from_slice(&(*offset as u32).to_be_bytes());
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&[0xff, b't', b'O', b'c']);
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&fanout);
    for (oid, _) in &objects {
        out.extend_from_slice(oid);
    }
    out.extend_from_slice(&vec![0u8; objects.len() * 4]); // CRC table
    out.extend_from_slice(&offsets);
    out.extend_from_slice(&large);
    out.extend_from_slice(&[0u8; 40]);
    out
}

fn write_pack(dir: &Path, stem: &str, objects: &[([u8; 20], u64)]) {
    fs::write(dir.join(format!("{stem}.idx")), idx_bytes(objects)).unwrap();
    fs::write(dir.join(format!("{stem}.pack")), b"PACK\0\0\0\x02").unwrap();
}

fn oid_from(hex: &str) -> ObjectId {
    ObjectId::from_hex(hex).unwrap()
}

/// Three packs, overlapping objects, one large offset: commit, reopen,
/// verify every lookup against the expected merged view.
#[test]
fn commit_then_lookup_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let a = oid_from("5001298e0c09ad9c34e4249bc5801c75e9754fa5");
    let b = oid_from("5001299900000000000000000000000000000000");
    let c = oid_from("a81e489679b7d3418f9ab594bda8ceb37dd4c695");
    let d = oid_from("d85f5d69a6e9c16a727380b1644b3c25f2f3f610");

    write_pack(dir.path(), "pack-d7c6adf9", &[(*a.as_bytes(), 1204)]);
    write_pack(
        dir.path(),
        "pack-a81e4897",
        &[(*c.as_bytes(), 12), (*b.as_bytes(), 0x8000_0001)],
    );
    // `a` also lives in a later pack; the first placement must win.
    write_pack(
        dir.path(),
        "pack-d85f5d69",
        &[(*d.as_bytes(), 900), (*a.as_bytes(), 7777)],
    );

    let cache = MwindowCache::new(MwindowConfig::default());
    let mut writer = MidxWriter::new(cache.clone(), dir.path());
    writer.add("pack-d7c6adf9.idx").unwrap();
    writer.add("pack-a81e4897.idx").unwrap();
    writer.add("pack-d85f5d69.idx").unwrap();
    writer.commit().unwrap();
    drop(writer);
    assert_eq!(cache.stats().open_packs, 0);

    let midx = MidxFile::open(dir.path().join(MIDX_FILE_NAME)).unwrap();
    assert_eq!(midx.pack_count(), 3);
    assert_eq!(midx.object_count(), 4);

    // Pack order is name order: a81e, d7c6, d85f.
    assert_eq!(midx.pack_name_at(0), Some(&b"pack-a81e4897.idx"[..]));
    assert_eq!(midx.pack_name_at(1), Some(&b"pack-d7c6adf9.idx"[..]));
    assert_eq!(midx.pack_name_at(2), Some(&b"pack-d85f5d69.idx"[..]));

    let entry = midx.find(&a, 40).unwrap();
    assert_eq!((entry.pack_index, entry.offset), (1, 1204));
    assert_eq!(entry.oid, a);

    let entry = midx.find(&b, 40).unwrap();
    assert_eq!((entry.pack_index, entry.offset), (0, 0x8000_0001));

    let entry = midx.find(&c, 40).unwrap();
    assert_eq!((entry.pack_index, entry.offset), (0, 12));

    let entry = midx.find(&d, 40).unwrap();
    assert_eq!((entry.pack_index, entry.offset), (2, 900));

    // Entry iteration covers the deduplicated sorted union.
    let all: Vec<_> = midx.entries().map(Result::unwrap).collect();
    assert_eq!(all.len(), 4);
    assert!(all.windows(2).all(|w| w[0].oid < w[1].oid));
}

/// Abbreviated lookups: a 7-nibble prefix resolves like the full OID, and
/// a prefix shared by two entries is ambiguous.
#[test]
fn prefix_lookup_and_ambiguity() {
    let dir = tempfile::tempdir().unwrap();
    let a = oid_from("5001298e0c09ad9c34e4249bc5801c75e9754fa5");
    let b = oid_from("5001299900000000000000000000000000000000");
    write_pack(
        dir.path(),
        "pack-aaaa",
        &[(*a.as_bytes(), 1204), (*b.as_bytes(), 64)],
    );

    let cache = MwindowCache::new(MwindowConfig::default());
    let mut writer = MidxWriter::new(cache, dir.path());
    writer.add("pack-aaaa.idx").unwrap();
    writer.commit().unwrap();

    let midx = MidxFile::open(dir.path().join(MIDX_FILE_NAME)).unwrap();

    // "5001298" is unique to `a`.
    let entry = midx.find(&a, 7).unwrap();
    assert_eq!(entry, midx.find(&a, 40).unwrap());

    // "500129" matches both.
    assert!(matches!(midx.find(&a, 6), Err(MidxError::Ambiguous)));

    // No entry starts with "51".
    let missing = oid_from("5100000000000000000000000000000000000000");
    assert!(matches!(midx.find(&missing, 2), Err(MidxError::NotFound)));
}

/// Flipping the last trailer byte must fail `open` with the signature
/// mismatch detail, and flag the loaded image as stale.
#[test]
fn corrupt_trailer_is_rejected_and_detected() {
    let dir = tempfile::tempdir().unwrap();
    let a = oid_from("1111111111111111111111111111111111111111");
    write_pack(dir.path(), "pack-aaaa", &[(*a.as_bytes(), 10)]);

    let cache = MwindowCache::new(MwindowConfig::default());
    let mut writer = MidxWriter::new(cache, dir.path());
    writer.add("pack-aaaa.idx").unwrap();
    writer.commit().unwrap();

    let path = dir.path().join(MIDX_FILE_NAME);
    let midx = MidxFile::open(&path).unwrap();
    assert!(!midx.needs_refresh(&path));

    let mut data = fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&path, &data).unwrap();

    assert!(midx.needs_refresh(&path));
    let err = MidxFile::open(&path).unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid multi-pack-index file - index signature mismatch"
    );
}

/// Re-committing after adding a pack atomically replaces the read-only
/// index, and the old reader notices.
#[test]
fn recommit_replaces_and_stales_old_reader() {
    let dir = tempfile::tempdir().unwrap();
    let a = oid_from("1111111111111111111111111111111111111111");
    let b = oid_from("2222222222222222222222222222222222222222");
    write_pack(dir.path(), "pack-aaaa", &[(*a.as_bytes(), 10)]);

    let cache = MwindowCache::new(MwindowConfig::default());
    let mut writer = MidxWriter::new(cache, dir.path());
    writer.add("pack-aaaa.idx").unwrap();
    writer.commit().unwrap();

    let path = dir.path().join(MIDX_FILE_NAME);
    let old = MidxFile::open(&path).unwrap();
    assert!(!old.needs_refresh(&path));

    write_pack(dir.path(), "pack-bbbb", &[(*b.as_bytes(), 20)]);
    writer.add("pack-bbbb.idx").unwrap();
    writer.commit().unwrap();

    assert!(old.needs_refresh(&path));
    let new = MidxFile::open(&path).unwrap();
    assert_eq!(new.object_count(), 2);
    assert!(new.find(&b, 40).is_ok());
}

/// The boundary offsets around 2^31: the largest inline value and the
/// smallest out-of-line value round-trip exactly.
#[test]
fn large_offset_boundary_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let a = oid_from("1111111111111111111111111111111111111111");
    let b = oid_from("2222222222222222222222222222222222222222");
    write_pack(
        dir.path(),
        "pack-aaaa",
        &[(*a.as_bytes(), 0x7fff_ffff), (*b.as_bytes(), 0x8000_0000)],
    );

    let cache = MwindowCache::new(MwindowConfig::default());
    let mut writer = MidxWriter::new(cache, dir.path());
    writer.add("pack-aaaa.idx").unwrap();

    let mut buf = Vec::new();
    writer.dump(&mut buf).unwrap();
    assert_eq!(buf[6], 5, "one large offset forces the LOFF chunk");

    writer.commit().unwrap();
    let midx = MidxFile::open(dir.path().join(MIDX_FILE_NAME)).unwrap();
    assert_eq!(midx.find(&a, 40).unwrap().offset, 0x7fff_ffff);
    assert_eq!(midx.find(&b, 40).unwrap().offset, 0x8000_0000);
}
