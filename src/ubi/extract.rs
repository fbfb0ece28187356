//! This module reassembles volumes out of scanned eraseblocks.
//!
//! A volume's size is inferred from the highest `lnum` seen for it: `1 + max(lnum)` LEBs. Its LEBs
//! are then written out in `lnum` order. A LEB that was never found (or didn't parse) is simply
//! left out, so the output is *shorter* than the volume rather than zero-filled; the
//! [LogicalVolume] keeps track of what was missing so that this can be reported.

use super::block::ParsedEraseBlock;
use super::headers::VolTableRecord;
use super::sink::VolumeSink;

use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::RangeInclusive;

/// A named volume from the volume table, and which of its LEBs were found
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogicalVolume {
    /// The volume ID, which is also its slot in the volume table
    pub vol_id: u32,

    /// The volume table record describing this volume
    pub record: VolTableRecord,

    /// How many LEBs the volume is assumed to have: one more than the highest `lnum` found, or 1
    /// if none were found at all
    pub block_count: u64,

    /// The `lnum`s actually found, ascending
    pub present: Vec<u32>,
}

impl LogicalVolume {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// The `lnum`s in `0..block_count` that weren't found, as ranges.
    ///
    /// There is at most one more range than there are LEBs present, no matter how large a corrupt
    /// `lnum` has made `block_count`.
    pub fn missing_ranges(&self) -> Vec<RangeInclusive<u64>> {
        let mut ranges = Vec::new();
        let mut next = 0;
        let ends = self.present.iter().map(|&x| u64::from(x));
        for lnum in ends.chain([self.block_count]) {
            if lnum > next {
                ranges.push(next..=lnum - 1);
            }
            next = lnum + 1;
        }
        ranges
    }

    pub fn missing_count(&self) -> u64 {
        self.block_count - self.present.len() as u64
    }
}

/// How one volume was written
#[derive(Debug)]
pub struct VolumeReport {
    pub volume: LogicalVolume,

    /// How many LEB payloads were written
    pub fragments: usize,

    pub bytes_written: u64,
}

/// The outcome of [extract_volumes]
#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub written: Vec<VolumeReport>,

    /// Volumes that could not be written, because the sink refused or failed
    pub failed: Vec<(LogicalVolume, anyhow::Error)>,
}

/// The payload of every data LEB, keyed by `(vol_id, lnum)`
struct LebIndex<'a>(BTreeMap<(u32, u32), &'a Bytes>);

impl<'a> LebIndex<'a> {
    fn new(blocks: &'a [ParsedEraseBlock]) -> Self {
        let mut map = BTreeMap::new();
        for block in blocks {
            if let Some(data) = block.data() {
                // Should a `vol_id:lnum` turn up twice, the first one found wins
                map.entry((block.vid.vol_id, block.vid.lnum))
                    .or_insert(data);
            }
        }
        Self(map)
    }

    /// All LEBs of the given volume, in `lnum` order
    fn volume(&self, vol_id: u32) -> impl Iterator<Item = (u32, &'a Bytes)> + '_ {
        self.0
            .range((vol_id, 0)..=(vol_id, u32::MAX))
            .map(|(&(_, lnum), &data)| (lnum, data))
    }

    fn plan(&self, table: &[VolTableRecord]) -> Vec<LogicalVolume> {
        table
            .iter()
            .zip(0u32..)
            .filter(|(record, _)| record.is_used())
            .map(|(record, vol_id)| {
                let present: Vec<u32> = self.volume(vol_id).map(|(lnum, _)| lnum).collect();
                let block_count = present.last().map_or(1, |&max| u64::from(max) + 1);

                LogicalVolume {
                    vol_id,
                    record: record.clone(),
                    block_count,
                    present,
                }
            })
            .collect()
    }
}

/// Work out, for every named volume in `table`, which LEBs are available in `blocks`.
///
/// Slots with an empty name are unused, and don't produce a volume.
pub fn plan_volumes(blocks: &[ParsedEraseBlock], table: &[VolTableRecord]) -> Vec<LogicalVolume> {
    LebIndex::new(blocks).plan(table)
}

fn write_volume<W: Write>(
    index: &LebIndex,
    volume: &LogicalVolume,
    out: &mut W,
) -> anyhow::Result<(usize, u64)> {
    let rpt = howudoin::new()
        .label(format!("Extracting {}", volume.name()))
        .set_len(volume.present.len() as u64);

    let mut fragments = 0;
    let mut bytes_written = 0;
    for (_, data) in index.volume(volume.vol_id) {
        out.write_all(data)?;
        fragments += 1;
        bytes_written += data.len() as u64;
        rpt.inc();
    }

    rpt.add_info(format!(
        "Volume {} ({}): {fragments} of {} blocks, {bytes_written} bytes",
        volume.vol_id,
        volume.name(),
        volume.block_count
    ));
    if volume.missing_count() > 0 {
        rpt.add_warn(format!(
            "Volume {}: {} blocks missing, output will be short",
            volume.name(),
            volume.missing_count()
        ));
    }
    rpt.finish();

    Ok((fragments, bytes_written))
}

/// Write every named volume in `table` to `sink`, by concatenating its LEB payloads from `blocks`
/// in `lnum` order.
///
/// Missing LEBs are skipped over (not zero-filled). Layout volume eraseblocks never end up in any
/// output. A volume that the sink fails on is recorded in [ExtractSummary::failed], and the rest
/// are still attempted.
pub fn extract_volumes<S: VolumeSink>(
    blocks: &[ParsedEraseBlock],
    table: &[VolTableRecord],
    sink: &mut S,
) -> ExtractSummary {
    let index = LebIndex::new(blocks);
    let mut summary = ExtractSummary::default();

    for volume in index.plan(table) {
        let result = sink.open(&volume).and_then(|mut out| {
            let counts = write_volume(&index, &volume, &mut out)?;
            sink.close(&volume, out)?;
            Ok(counts)
        });

        match result {
            Ok((fragments, bytes_written)) => summary.written.push(VolumeReport {
                volume,
                fragments,
                bytes_written,
            }),
            Err(error) => summary.failed.push((volume, error)),
        }
    }

    summary
}

#[cfg(test)]
fn scan(image: super::testimage::TestImage) -> super::scan::ScanResult {
    super::scan::scan_image(std::io::Cursor::new(image.into_bytes()))
}

#[test]
fn test_extract_with_gap() -> anyhow::Result<()> {
    use super::sink::MemorySink;
    use super::testimage::TestImage;

    let mut image = TestImage::new(64, 128).peb_size(128 + 4096);
    image.layout_leb(0, &[(1, "rootfs")])?;
    image.layout_leb(1, &[(1, "rootfs")])?;
    for lnum in [3, 0, 2] {
        image.static_leb(1, lnum, &[lnum as u8 + 1; 4096])?;
    }

    let result = scan(image);
    let table = result.volume_table().unwrap();
    let mut sink = MemorySink::default();
    let summary = extract_volumes(&result.blocks, table, &mut sink);

    assert!(summary.failed.is_empty());
    assert_eq!(summary.written.len(), 1);
    let report = &summary.written[0];
    assert_eq!(report.volume.vol_id, 1);
    assert_eq!(report.volume.block_count, 4);
    assert_eq!(report.volume.present, [0, 2, 3]);
    assert_eq!(report.volume.missing_ranges(), [1..=1]);
    assert_eq!(report.fragments, 3);

    // The gap is skipped, not zero-filled
    let out = &sink.volumes["rootfs"];
    assert_eq!(out.len(), 3 * 4096);
    assert_eq!(report.bytes_written, 3 * 4096);
    assert!(out[..4096].iter().all(|&x| x == 1));
    assert!(out[4096..8192].iter().all(|&x| x == 3));
    assert!(out[8192..].iter().all(|&x| x == 4));

    Ok(())
}

#[test]
fn test_extract_dynamic() -> anyhow::Result<()> {
    use super::sink::MemorySink;
    use super::testimage::TestImage;

    let mut image = TestImage::new(64, 128).peb_size(256);
    image.layout_leb(0, &[(0, "config"), (4, "empty")])?;
    image.dynamic_leb(0, 1, b"second")?;
    image.dynamic_leb(0, 0, b"first")?;

    let result = scan(image);
    let mut sink = MemorySink::default();
    let summary = extract_volumes(&result.blocks, result.volume_table().unwrap(), &mut sink);
    assert_eq!(summary.written.len(), 2);

    // Dynamic LEBs are whole: the erased tail of each PEB comes along
    let out = &sink.volumes["config"];
    assert_eq!(out.len(), 2 * 128);
    assert_eq!(&out[..5], b"first");
    assert_eq!(&out[128..134], b"second");

    // A named volume with no LEBs at all still gets (empty) output
    let empty = &summary.written[1];
    assert_eq!(empty.volume.name(), "empty");
    assert_eq!(empty.volume.block_count, 1);
    assert_eq!(empty.volume.missing_count(), 1);
    assert_eq!(empty.volume.missing_ranges(), [0..=0]);
    assert_eq!(sink.volumes["empty"], b"");

    Ok(())
}

#[test]
fn test_only_first_table_used() -> anyhow::Result<()> {
    use super::sink::MemorySink;
    use super::testimage::TestImage;

    let mut image = TestImage::new(64, 128);
    image.dynamic_leb(0, 0, b"a")?;
    image.layout_leb(0, &[(0, "first")])?;
    image.layout_leb(1, &[(0, "second"), (1, "other")])?;
    image.dynamic_leb(1, 0, b"b")?;

    let result = scan(image);
    let table = result.volume_table().unwrap();
    let mut sink = MemorySink::default();
    extract_volumes(&result.blocks, table, &mut sink);

    assert_eq!(sink.volumes.keys().collect::<Vec<_>>(), ["first"]);

    Ok(())
}

#[test]
fn test_unused_slots_and_duplicates() -> anyhow::Result<()> {
    use super::headers::VolType;
    use super::testimage::TestImage;

    let mut image = TestImage::new(64, 128);
    image.layout_leb(0, &[(3, "data")])?;
    image.static_leb(3, 0, b"original")?;
    image.static_leb(3, 0, b"duplicate")?;
    image.static_leb(2, 0, b"orphan")?;

    let result = scan(image);
    let table = result.volume_table().unwrap();

    // Only slot 3 has a name, so volume 2's LEB is never used
    let plan = plan_volumes(&result.blocks, table);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].vol_id, 3);
    assert_eq!(plan[0].record.volume_type(), Some(VolType::Dynamic));
    assert_eq!(plan[0].present, [0]);

    let mut sink = super::sink::MemorySink::default();
    extract_volumes(&result.blocks, table, &mut sink);
    assert_eq!(sink.volumes.len(), 1);
    assert_eq!(sink.volumes["data"], b"original");

    Ok(())
}

#[test]
fn test_huge_lnum() -> anyhow::Result<()> {
    use super::testimage::TestImage;

    let mut image = TestImage::new(64, 128);
    image.layout_leb(0, &[(0, "rootfs")])?;
    image.static_leb(0, 0, b"a")?;
    image.static_leb(0, 5, b"b")?;
    image.static_leb(0, u32::MAX, b"c")?;

    let result = scan(image);
    let plan = plan_volumes(&result.blocks, result.volume_table().unwrap());
    let volume = &plan[0];
    assert_eq!(volume.block_count, 1 << 32);
    assert_eq!(volume.missing_count(), (1 << 32) - 3);
    assert_eq!(volume.missing_ranges(), [1..=4, 6..=0xFFFF_FFFE]);

    // Only the LEBs actually present are written
    let mut sink = super::sink::MemorySink::default();
    let summary = extract_volumes(&result.blocks, result.volume_table().unwrap(), &mut sink);
    assert_eq!(summary.written[0].fragments, 3);
    assert_eq!(sink.volumes["rootfs"], b"abc");

    Ok(())
}

#[test]
fn test_truncated_dump() -> anyhow::Result<()> {
    use super::UBI_VID_HDR_SIZE;
    use super::sink::MemorySink;
    use super::testimage::TestImage;

    let mut image = TestImage::new(64, 128);
    image.layout_leb(0, &[(0, "rootfs"), (1, "odd")])?;
    let odd = image.len();
    image.dynamic_leb(1, 0, b"untyped")?;
    image.static_leb(0, 0, &[7; 1000])?;

    // Give the second PEB a volume type that is neither static nor dynamic
    let vid_start = odd + 64;
    let mut vid = super::headers::Vid::decode(&image.bytes_mut()[vid_start..])?;
    vid.vol_type = 0;
    vid.with_crc()?
        .encode(&mut image.bytes_mut()[vid_start..][..UBI_VID_HDR_SIZE])?;

    // Lose the end of the last PEB
    let mut bytes = image.into_bytes();
    bytes.truncate(bytes.len() - 500);

    let result = super::scan::scan_image(std::io::Cursor::new(bytes));
    assert!(result.is_complete());
    assert!(result.failures.is_empty());
    assert!(result.blocks[2].is_short());

    let mut sink = MemorySink::default();
    let summary = extract_volumes(&result.blocks, result.volume_table().unwrap(), &mut sink);
    assert!(summary.failed.is_empty());
    assert_eq!(sink.volumes["rootfs"], [7; 500]);
    assert_eq!(&sink.volumes["odd"][..7], b"untyped");

    Ok(())
}
