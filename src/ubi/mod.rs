//! This module implements extraction of UBI volumes from a raw flash dump.
//!
//! UBI splits the flash into physical eraseblocks ("PEBs"), each of which looks like:
//!
//! ```text
//! +- EC header (64 B) -+--- ... ---+- VID header (64 B) -+--- ... ---+- payload ---------------+
//! | "UBI#", erase cnt, |           | "UBI!", vol_id,     |           | one LEB of the volume,  |
//! | vid_hdr_offset,    |           | lnum, vol_type,     |           | or the volume table for |
//! | data_offset        |           | data_size           |           | the layout volume       |
//! +--------------------+-----------+---------------------+-----------+-------------------------+
//!                      ^ vid_hdr_offset                              ^ data_offset
//! ```
//!
//! The logical eraseblocks ("LEBs") of a volume are spread over PEBs in no particular order, and
//! a dump may not even be PEB-aligned, so extraction happens in two passes:
//! 1. [scan_image] walks the whole dump once, locating every EC header by its magic and parsing
//!    the eraseblock behind it. Eraseblocks that fail to parse are noted and skipped.
//! 2. [extract_volumes] takes the first volume table found, and for every named volume in it,
//!    concatenates that volume's LEB payloads in `lnum` order into a [VolumeSink].

mod block;
mod error;
mod extract;
mod headers;
mod scan;
mod sink;
mod stream;

#[cfg(test)]
mod testimage;

pub use block::{parse_block, BlockContent, ParsedEraseBlock};
pub use error::{Error, Result};
pub use extract::{extract_volumes, plan_volumes, ExtractSummary, LogicalVolume, VolumeReport};
pub use headers::{Ec, Vid, VolTableRecord, VolType, UBI_CRC, UBI_VERSION};
pub use scan::{scan_image, BlockFailure, ScanResult};
pub use sink::{DirSink, MemorySink, VolumeSink};
pub use stream::EbStream;

pub const UBI_EC_HDR_MAGIC: &[u8; 4] = b"UBI#";
pub const UBI_VID_HDR_MAGIC: &[u8; 4] = b"UBI!";

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;

/// The volume ID of the layout volume, which holds the volume table
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFFEFFF;

/// The number of records in a volume table, and thus the maximum number of volumes
pub const UBI_MAX_VOLUMES: usize = 128;

/// The size of the name field of a volume table record
pub const UBI_VOL_NAME_MAX: usize = 128;
