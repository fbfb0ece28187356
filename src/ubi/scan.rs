//! This module contains the code to scan a whole dump and collect its eraseblocks (per UBI).

use super::block::{parse_block, ParsedEraseBlock};
use super::error::Error;
use super::headers::VolTableRecord;
use super::stream::EbStream;

use std::io::{Read, Seek};

/// An eraseblock that was found, but could not be parsed
#[derive(Debug)]
pub struct BlockFailure {
    /// Where its EC header magic was found
    pub offset: u64,
    pub error: Error,
}

/// Everything [scan_image] found
#[derive(Debug, Default)]
pub struct ScanResult {
    /// The eraseblocks that parsed successfully, in the order they appear in the dump
    pub blocks: Vec<ParsedEraseBlock>,

    /// The eraseblocks that didn't
    pub failures: Vec<BlockFailure>,

    /// Set if reading the dump failed, cutting the scan short. Everything before that point is
    /// still in `blocks`.
    pub fatal: Option<Error>,
}

impl ScanResult {
    /// The first volume table in the dump.
    ///
    /// The layout volume normally holds two identical copies of the table; only the first one
    /// found is used, and any others are ignored, even if they differ.
    pub fn volume_table(&self) -> Option<&[VolTableRecord]> {
        self.blocks.iter().find_map(ParsedEraseBlock::volume_table)
    }

    /// Did the scan reach the end of the dump?
    pub fn is_complete(&self) -> bool {
        self.fatal.is_none()
    }
}

/// Walk the whole dump, locating and parsing every eraseblock in it.
///
/// An eraseblock that fails to parse is recorded in [ScanResult::failures], and the search for
/// the next EC header resumes one byte after the failed one's magic, so a corrupt header never
/// costs more than its own eraseblock. A failure to read `input` ends the scan.
pub fn scan_image<R: Read + Seek>(input: R) -> ScanResult {
    let rpt = howudoin::new().label("Scanning eraseblocks");

    let mut stream = EbStream::new(input);
    let mut result = ScanResult::default();
    loop {
        let offset = match stream.find_magic() {
            Ok(Some(offset)) => offset,
            Ok(None) => break,
            Err(e) => {
                result.fatal = Some(e.into());
                break;
            }
        };
        rpt.inc();

        match parse_block(&mut stream) {
            Ok(block) => {
                if block.is_short() {
                    rpt.add_warn(format!(
                        "Eraseblock at {offset:#x} ends early: {} of {} bytes",
                        block.data().map_or(0, |x| x.len()),
                        block.vid.data_size
                    ));
                }
                result.blocks.push(block);
            }
            Err(error) if error.is_fatal() => {
                result.fatal = Some(error);
                break;
            }
            Err(error) => {
                rpt.add_warn(format!("Skipping eraseblock at {offset:#x}: {error}"));
                result.failures.push(BlockFailure { offset, error });

                if let Err(e) = stream.seek_to(offset + 1) {
                    result.fatal = Some(e.into());
                    break;
                }
            }
        }
    }

    if let Some(ref error) = result.fatal {
        rpt.add_err(format!("Scan stopped at {:#x}: {error}", stream.position()));
    }
    rpt.add_info(format!(
        "{} eraseblocks found, {} unreadable",
        result.blocks.len() + result.failures.len(),
        result.failures.len()
    ));
    rpt.close();

    result
}

#[test]
fn test_scan_with_filler() -> anyhow::Result<()> {
    use super::testimage::TestImage;
    use std::io::Cursor;

    let mut image = TestImage::new(64, 128).peb_size(512);
    let mut offsets = Vec::new();
    image.raw(&[0x00; 7]);
    for lnum in 0..5 {
        offsets.push(image.len() as u64);
        image.static_leb(2, lnum, &[lnum as u8; 200])?;
        // Filler that almost, but doesn't quite, look like a magic
        image.raw(&b"UBI\0UB"[..lnum as usize]);
    }

    let result = scan_image(Cursor::new(image.into_bytes()));
    assert!(result.is_complete());
    assert!(result.failures.is_empty());
    assert_eq!(
        result.blocks.iter().map(|x| x.offset).collect::<Vec<_>>(),
        offsets
    );
    assert_eq!(
        result.blocks.iter().map(|x| x.vid.lnum).collect::<Vec<_>>(),
        [0, 1, 2, 3, 4]
    );
    assert_eq!(result.volume_table(), None);

    Ok(())
}

#[test]
fn test_scan_skips_bad_block() -> anyhow::Result<()> {
    use super::testimage::TestImage;
    use std::io::Cursor;

    let mut image = TestImage::new(64, 128);
    image.layout_leb(0, &[(0, "rootfs")])?;
    let bad = image.len();
    image.dynamic_leb(0, 0, b"lost")?;
    image.dynamic_leb(0, 1, b"kept")?;

    // Corrupt the VID header magic of the second PEB
    image.bytes_mut()[bad + 64 + 3] = b'?';

    let result = scan_image(Cursor::new(image.into_bytes()));
    assert!(result.is_complete());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].offset, bad as u64);
    assert!(matches!(result.failures[0].error, Error::Decode { .. }));

    assert_eq!(result.blocks.len(), 2);
    assert_eq!(result.blocks[1].vid.lnum, 1);
    assert_eq!(&result.blocks[1].data().unwrap()[..4], b"kept");
    assert_eq!(result.volume_table().map(|x| x[0].name.as_str()), Some("rootfs"));

    Ok(())
}

#[test]
fn test_scan_read_error() {
    use std::io::{self, Cursor, SeekFrom};

    /// Fails every read after the first `limit` bytes
    struct Flaky {
        inner: Cursor<Vec<u8>>,
        limit: u64,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inner.position() >= self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "device went away"));
            }
            let len = std::cmp::min(buf.len() as u64, self.limit - self.inner.position());
            self.inner.read(&mut buf[..len as usize])
        }
    }

    impl Seek for Flaky {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    let mut image = super::testimage::TestImage::new(64, 128);
    image.dynamic_leb(0, 0, b"first").unwrap();
    image.raw(&[0u8; 3000]);
    image.dynamic_leb(0, 1, b"second").unwrap();

    let result = scan_image(Flaky {
        inner: Cursor::new(image.into_bytes()),
        limit: 2000,
    });
    assert!(!result.is_complete());
    assert!(matches!(result.fatal, Some(Error::Io(_))));
    assert!(result.failures.is_empty());

    // The first PEB's payload was cut short by the error, so nothing made it
    assert!(result.blocks.is_empty());
}
