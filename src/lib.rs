//! Multi-pack-index (MIDX) reader/writer with a memory-window cache.
//!
//! A multi-pack index merges the indices of many independent pack files
//! into one file, so locating an object means one lookup instead of one
//! per pack. This crate provides:
//!
//! - [`MidxFile`]: an owning, checksum-verified reader with abbreviated
//!   OID lookup ([`MidxFile::find`]) and staleness detection
//!   ([`MidxFile::needs_refresh`]).
//! - [`MidxWriter`]: accumulates packs and atomically writes
//!   `multi-pack-index` beside them.
//! - [`MwindowCache`]: a process-wide LRU cache of memory-mapped windows
//!   over pack files, with soft byte/file limits and pinned-window
//!   reference counting, plus the shared pack registry
//!   ([`MwindowCache::get_pack`] / [`MwindowCache::put_pack`]).
//!
//! # Example
//!
//! ```no_run
//! use multipack::{MidxFile, MidxWriter, ObjectId};
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut writer = MidxWriter::with_global("objects/pack");
//! writer.add("pack-d7c6adf9f61318f041845b01440d09aa7a91e1b5.idx")?;
//! writer.commit()?;
//!
//! let midx = MidxFile::open("objects/pack/multi-pack-index")?;
//! let oid = ObjectId::from_hex("5001298e0c09ad9c34e4249bc5801c75e9754fa5").unwrap();
//! let entry = midx.find(&oid, 40)?;
//! println!("pack {} offset {}", entry.pack_index, entry.offset);
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! One mutex guards the window cache and the pack registry together.
//! Bytes read through a pinned [`WindowCursor`] are lock-free: the pin
//! keeps the mapping alive until the cursor is released or dropped.

pub mod futils;
pub mod midx;
pub mod midx_error;
pub mod midx_file;
pub mod midx_write;
pub mod mwindow;
pub mod object_id;
pub mod pack;
pub mod pack_idx;

pub use midx::{MidxEntry, MidxLayout, MidxView};
pub use midx_error::{ChunkId, MidxError};
pub use midx_file::MidxFile;
pub use midx_write::{MidxWriteError, MidxWriter, MIDX_FILE_NAME};
pub use mwindow::{MwindowCache, MwindowConfig, MwindowError, MwindowStats, WindowCursor};
pub use object_id::ObjectId;
pub use pack::{PackError, PackFile};
pub use pack_idx::{IdxError, IdxOidIter, IdxView};
