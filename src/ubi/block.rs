//! This module contains the code to parse one whole eraseblock, once its EC header has been found.

use super::error::{Error, Result};
use super::headers::{Ec, Vid, VolTableRecord, VolType};
use super::stream::EbStream;
use super::{
    UBI_EC_HDR_SIZE, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES, UBI_VID_HDR_SIZE, UBI_VTBL_RECORD_SIZE,
};

use bytes::Bytes;
use std::io::{Read, Seek};

/// What an eraseblock carries after its headers
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum BlockContent {
    /// The eraseblock belongs to the layout volume: a full volume table
    VolumeTable(Vec<VolTableRecord>),

    /// The eraseblock holds one LEB of an ordinary volume
    Data(Bytes),
}

/// A fully parsed eraseblock
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct ParsedEraseBlock {
    /// Where the EC header was found in the dump
    pub offset: u64,
    pub ec: Ec,
    pub vid: Vid,
    pub content: BlockContent,
}

impl ParsedEraseBlock {
    /// The LEB payload, or `None` for a layout volume eraseblock
    pub fn data(&self) -> Option<&Bytes> {
        match &self.content {
            BlockContent::Data(data) => Some(data),
            BlockContent::VolumeTable(_) => None,
        }
    }

    /// Whether this is a static LEB whose payload ended before its `data_size` did
    pub fn is_short(&self) -> bool {
        match (self.vid.volume_type(), self.data()) {
            (VolType::Static, Some(data)) => data.len() < self.vid.data_size as usize,
            _ => false,
        }
    }

    /// The volume table, or `None` for an ordinary eraseblock
    pub fn volume_table(&self) -> Option<&[VolTableRecord]> {
        match &self.content {
            BlockContent::VolumeTable(records) => Some(records),
            BlockContent::Data(_) => None,
        }
    }
}

/// Work out how far to skip after a header ends to reach the next structure
fn gap_after(what: &'static str, offset: u32, header_end: u64) -> Result<u64> {
    u64::from(offset)
        .checked_sub(header_end)
        .ok_or(Error::Offset {
            what,
            offset,
            minimum: header_end,
        })
}

fn read_volume_table<R: Read + Seek>(stream: &mut EbStream<R>) -> Result<Vec<VolTableRecord>> {
    let table = stream.read_record(UBI_VTBL_RECORD_SIZE * UBI_MAX_VOLUMES, "volume table")?;
    table
        .chunks_exact(UBI_VTBL_RECORD_SIZE)
        .map(VolTableRecord::decode)
        .collect()
}

/// Parse the eraseblock whose EC header is under the cursor.
///
/// On success, the cursor is left just past the payload. For a dynamic volume, that's the next EC
/// header magic (or the end of the dump); in all other cases, it's wherever the payload ended, and
/// the next EC header still has to be searched for.
///
/// On failure, the cursor is left wherever the failure happened.
pub fn parse_block<R: Read + Seek>(stream: &mut EbStream<R>) -> Result<ParsedEraseBlock> {
    let offset = stream.position();

    let ec = Ec::decode(&stream.read_record(UBI_EC_HDR_SIZE, "EC header")?)?;
    stream.skip(gap_after(
        "VID header offset",
        ec.vid_hdr_offset,
        UBI_EC_HDR_SIZE as u64,
    )?)?;

    let vid = Vid::decode(&stream.read_record(UBI_VID_HDR_SIZE, "VID header")?)?;
    stream.skip(gap_after(
        "data offset",
        ec.data_offset,
        u64::from(ec.vid_hdr_offset) + UBI_VID_HDR_SIZE as u64,
    )?)?;

    let content = if vid.vol_id == UBI_LAYOUT_VOLUME_ID {
        BlockContent::VolumeTable(read_volume_table(stream)?)
    } else {
        let data = match vid.volume_type() {
            // A dump that ends early still yields what it has; see [ParsedEraseBlock::is_short]
            VolType::Static => stream.read_up_to(vid.data_size as usize)?,
            VolType::Dynamic => stream.read_until_magic()?,
        };
        BlockContent::Data(data.into())
    };

    Ok(ParsedEraseBlock {
        offset,
        ec,
        vid,
        content,
    })
}

#[test]
fn test_parse_static() -> anyhow::Result<()> {
    use super::testimage::TestImage;
    use std::io::Cursor;

    // The payload is exactly `data_size`, even when it contains a magic
    let mut payload = vec![0x42; 50];
    payload.extend_from_slice(b"UBI#");
    payload.resize(100, 0x42);

    let mut image = TestImage::new(256, 512);
    image.static_leb(3, 0, &payload)?;
    image.raw(b"UBI#");
    let mut stream = EbStream::new(Cursor::new(image.into_bytes()));

    let block = parse_block(&mut stream)?;
    assert_eq!(block.offset, 0);
    assert_eq!(block.vid.vol_id, 3);
    assert_eq!(block.vid.volume_type(), VolType::Static);
    assert!(!block.is_short());
    assert_eq!(block.data().map(|x| &x[..]), Some(&payload[..]));
    assert_eq!(stream.position(), 512 + 100);

    Ok(())
}

#[test]
fn test_parse_dynamic() -> anyhow::Result<()> {
    use super::testimage::TestImage;
    use std::io::Cursor;

    let mut image = TestImage::new(256, 512);
    image.dynamic_leb(1, 7, b"hello")?;
    image.raw(&[0xFF; 10]);
    let second = image.len() as u64;
    image.dynamic_leb(1, 8, b"world")?;
    let mut stream = EbStream::new(Cursor::new(image.into_bytes()));

    // The payload runs up to the next magic, including the unused rest of the PEB
    let block = parse_block(&mut stream)?;
    assert_eq!(block.vid.lnum, 7);
    let data = block.data().unwrap();
    assert_eq!(data.len(), TestImage::DEFAULT_PEB_SIZE - 512 + 10);
    assert_eq!(&data[..5], b"hello");
    assert!(data[5..].iter().all(|&x| x == 0xFF));
    assert_eq!(stream.position(), second);

    // The last payload runs to the end of the dump
    let block = parse_block(&mut stream)?;
    assert_eq!(block.offset, second);
    assert_eq!(block.vid.lnum, 8);
    assert_eq!(block.data().unwrap().len(), TestImage::DEFAULT_PEB_SIZE - 512);

    Ok(())
}

#[test]
fn test_parse_volume_table() -> anyhow::Result<()> {
    use super::testimage::TestImage;
    use std::io::Cursor;

    let mut image = TestImage::new(64, 128);
    image.layout_leb(0, &[(0, "rootfs"), (5, "data")])?;
    let mut stream = EbStream::new(Cursor::new(image.into_bytes()));

    let block = parse_block(&mut stream)?;
    assert_eq!(block.vid.vol_id, UBI_LAYOUT_VOLUME_ID);
    let table = block.volume_table().unwrap();
    assert_eq!(table.len(), UBI_MAX_VOLUMES);
    assert_eq!(table[0].name, "rootfs");
    assert_eq!(table[5].name, "data");
    assert_eq!(table.iter().filter(|x| x.is_used()).count(), 2);
    assert_eq!(block.data(), None);

    Ok(())
}

#[test]
fn test_parse_errors() -> anyhow::Result<()> {
    use super::headers::UBI_VERSION;
    use std::io::Cursor;

    let parse = |bytes: Vec<u8>| parse_block(&mut EbStream::new(Cursor::new(bytes)));

    // Truncated EC header
    assert!(matches!(
        parse(b"UBI#\x01\x00".to_vec()),
        Err(Error::Truncated { .. })
    ));

    // VID header offset pointing back into the EC header
    let mut bytes = vec![0u8; 256];
    Ec {
        version: UBI_VERSION,
        vid_hdr_offset: 32,
        data_offset: 128,
        ..Default::default()
    }
    .encode(&mut bytes)?;
    assert!(matches!(
        parse(bytes.clone()),
        Err(Error::Offset { minimum: 64, .. })
    ));

    // Data offset pointing back into the VID header
    Ec {
        version: UBI_VERSION,
        vid_hdr_offset: 64,
        data_offset: 100,
        ..Default::default()
    }
    .encode(&mut bytes)?;
    Vid::default().encode(&mut bytes[64..])?;
    assert!(matches!(
        parse(bytes.clone()),
        Err(Error::Offset {
            offset: 100,
            minimum: 128,
            ..
        })
    ));

    Ok(())
}

#[test]
fn test_parse_short_static() -> anyhow::Result<()> {
    use super::testimage::TestImage;
    use std::io::Cursor;

    let mut image = TestImage::new(64, 128);
    image.static_leb(0, 0, &[7; 1000])?;
    let mut bytes = image.into_bytes();
    bytes.truncate(128 + 500);
    let mut stream = EbStream::new(Cursor::new(bytes));

    // The dump ends partway through the payload: what's there is kept
    let block = parse_block(&mut stream)?;
    assert_eq!(block.vid.data_size, 1000);
    assert_eq!(block.data().map(|x| x.len()), Some(500));
    assert!(block.is_short());
    assert_eq!(stream.position(), 628);

    Ok(())
}

#[test]
fn test_parse_unknown_vol_type() -> anyhow::Result<()> {
    use super::headers::UBI_VERSION;
    use std::io::Cursor;

    let mut bytes = vec![0xFF; 300];
    Ec {
        version: UBI_VERSION,
        vid_hdr_offset: 64,
        data_offset: 128,
        ..Default::default()
    }
    .encode(&mut bytes)?;
    Vid {
        vol_type: 0,
        data_size: 4,
        ..Default::default()
    }
    .encode(&mut bytes[64..])?;
    bytes.extend_from_slice(b"UBI#");

    // Neither static nor dynamic: delimited by the next magic, ignoring `data_size`
    let block = parse_block(&mut EbStream::new(Cursor::new(bytes)))?;
    assert_eq!(block.vid.vol_type, 0);
    assert_eq!(block.data().map(|x| x.len()), Some(300 - 128));
    assert!(!block.is_short());

    Ok(())
}
