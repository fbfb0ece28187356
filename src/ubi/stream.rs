//! A buffered, seekable view of a UBI dump, which knows how to find eraseblocks in it.
//!
//! Dumps are frequently not a clean sequence of PEBs: they may come from a raw NAND read with OOB
//! data interleaved, from a partially-erased chip, or with unknown filler between blocks. So
//! rather than stepping in fixed PEB-sized increments, everything here is driven by looking for
//! the EC header magic with a 4-byte window that slides one byte at a time.

use super::error::{Error, Result};
use super::UBI_EC_HDR_MAGIC;
use crate::util::ReadExt;

use std::io::{self, BufRead, BufReader, Read, Seek};

const MAGIC_LEN: usize = UBI_EC_HDR_MAGIC.len();

/// A 4-byte window over the most recently read bytes
#[derive(Debug, Default)]
struct Window {
    bytes: [u8; MAGIC_LEN],
    filled: usize,
}

impl Window {
    /// Shift `byte` in from the right, returning whatever fell out of the left
    fn push(&mut self, byte: u8) -> Option<u8> {
        let evicted = (self.filled == MAGIC_LEN).then_some(self.bytes[0]);
        self.bytes.rotate_left(1);
        self.bytes[MAGIC_LEN - 1] = byte;
        self.filled = std::cmp::min(self.filled + 1, MAGIC_LEN);
        evicted
    }

    fn is_magic(&self) -> bool {
        self.filled == MAGIC_LEN && self.bytes == *UBI_EC_HDR_MAGIC
    }

    /// The bytes currently held, oldest first
    fn contents(&self) -> &[u8] {
        &self.bytes[MAGIC_LEN - self.filled..]
    }
}

/// The input side of an extraction: wraps any `Read + Seek` and tracks the cursor position.
pub struct EbStream<R> {
    inner: BufReader<R>,
    pos: u64,
}

impl<R: Read + Seek> EbStream<R> {
    /// Start reading at the current position of `inner`, which is treated as offset 0
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pos: 0,
        }
    }

    /// The cursor position, relative to where the stream started
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let byte = loop {
            match self.inner.fill_buf() {
                Ok(buf) => break buf.first().copied(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if byte.is_some() {
            self.inner.consume(1);
            self.pos += 1;
        }
        Ok(byte)
    }

    /// Move the cursor back by `len` bytes
    fn rewind(&mut self, len: usize) -> io::Result<()> {
        self.inner.seek_relative(-(len as i64))?;
        self.pos -= len as u64;
        Ok(())
    }

    /// Move the cursor to an absolute position (relative to where the stream started)
    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        let delta = i64::try_from(pos)
            .ok()
            .zip(i64::try_from(self.pos).ok())
            .map(|(to, from)| to - from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;
        self.inner.seek_relative(delta)?;
        self.pos = pos;
        Ok(())
    }

    /// Skip `len` bytes forward without reading them. Skipping past the end is not an error here;
    /// the next read will come up short instead.
    pub fn skip(&mut self, len: u64) -> io::Result<()> {
        self.seek_to(self.pos.saturating_add(len))
    }

    /// Advance until the cursor sits on the next EC header magic, and return its position.
    ///
    /// The magic itself is left unconsumed. A magic right under the cursor is found immediately.
    /// Returns `None` once fewer than 4 bytes remain without a match.
    pub fn find_magic(&mut self) -> io::Result<Option<u64>> {
        let mut window = Window::default();
        while let Some(byte) = self.next_byte()? {
            window.push(byte);
            if window.is_magic() {
                self.rewind(MAGIC_LEN)?;
                return Ok(Some(self.pos));
            }
        }

        Ok(None)
    }

    /// Read everything up to (but not including) the next EC header magic, or to the end of the
    /// stream if there is no further magic. The magic is left unconsumed.
    ///
    /// This is how a dynamic volume's payload is delimited, since nothing in its headers says
    /// how much of the LEB is in use.
    pub fn read_until_magic(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut window = Window::default();
        while let Some(byte) = self.next_byte()? {
            data.extend(window.push(byte));
            if window.is_magic() {
                self.rewind(MAGIC_LEN)?;
                return Ok(data);
            }
        }

        // End of stream: whatever is left in the window belongs to the payload too
        data.extend_from_slice(window.contents());
        Ok(data)
    }

    /// Read up to `len` bytes, coming up short only at the end of the stream
    pub fn read_up_to(&mut self, len: usize) -> io::Result<Vec<u8>> {
        // Not preallocated: `len` may come from a corrupt header
        let mut data = Vec::new();
        let result = self.inner.read_to_vec(&mut data, len);

        // Whatever arrived before an error was still consumed
        self.pos += data.len() as u64;
        result.map(|_| data)
    }

    /// Read exactly `len` bytes, failing with [Error::Truncated] if the stream ends first
    pub fn read_record(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>> {
        let data = self.read_up_to(len)?;
        if data.len() < len {
            return Err(Error::Truncated {
                what,
                needed: len,
                available: data.len(),
            });
        }

        Ok(data)
    }
}

#[test]
fn test_find_magic() -> io::Result<()> {
    use std::io::Cursor;

    let mut image = b"UBI#".to_vec();
    image.extend_from_slice(b"UBUBI#");
    image.extend_from_slice(&[0xFF; 1000]);
    image.extend_from_slice(b"UBI!UB#IUBI#");
    image.extend_from_slice(b"UBI");

    let mut stream = EbStream::new(Cursor::new(image));

    // At the very start, and not consumed by finding it
    assert_eq!(stream.find_magic()?, Some(0));
    assert_eq!(stream.find_magic()?, Some(0));

    // After a partial overlap
    stream.skip(1)?;
    assert_eq!(stream.find_magic()?, Some(6));

    stream.skip(1)?;
    assert_eq!(stream.find_magic()?, Some(1018));

    // A trailing partial magic doesn't match
    stream.skip(1)?;
    assert_eq!(stream.find_magic()?, None);

    Ok(())
}

#[test]
fn test_find_many() -> io::Result<()> {
    use std::io::Cursor;

    // Filler of every length from 0 to 40 between markers
    let mut image = Vec::new();
    let mut expected = Vec::new();
    for filler in 0..=40usize {
        image.extend((0..filler).map(|x| x as u8));
        expected.push(image.len() as u64);
        image.extend_from_slice(b"UBI#");
    }

    let mut stream = EbStream::new(Cursor::new(image));
    let mut found = Vec::new();
    while let Some(pos) = stream.find_magic()? {
        found.push(pos);
        stream.skip(1)?;
    }
    assert_eq!(found, expected);

    Ok(())
}

#[test]
fn test_read_until_magic() -> io::Result<()> {
    use std::io::Cursor;

    let mut stream = EbStream::new(Cursor::new(b"abcdeUBIUBI#fghUBI#xy".to_vec()));
    assert_eq!(stream.read_until_magic()?, b"abcdeUBI");
    assert_eq!(stream.position(), 8);

    stream.skip(4)?;
    assert_eq!(stream.read_until_magic()?, b"fgh");
    assert_eq!(stream.position(), 15);

    // No further magic: the rest of the stream, including a short tail, is the payload
    stream.skip(4)?;
    assert_eq!(stream.read_until_magic()?, b"xy");
    assert_eq!(stream.position(), 21);
    assert_eq!(stream.read_until_magic()?, b"");

    Ok(())
}

#[test]
fn test_read_record() -> Result<()> {
    use std::io::Cursor;

    let mut stream = EbStream::new(Cursor::new(vec![0xAA; 100]));
    assert_eq!(stream.read_record(64, "test")?, vec![0xAA; 64]);
    assert!(matches!(
        stream.read_record(64, "test"),
        Err(Error::Truncated {
            needed: 64,
            available: 36,
            ..
        })
    ));
    assert_eq!(stream.position(), 100);

    Ok(())
}

#[test]
fn test_read_error_position() -> io::Result<()> {
    use std::io::{Cursor, SeekFrom};

    /// Fails every read past offset 100
    struct Flaky(Cursor<Vec<u8>>);

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pos = self.0.position();
            if pos >= 100 {
                return Err(io::Error::new(io::ErrorKind::Other, "bad sector"));
            }
            let len = std::cmp::min(buf.len() as u64, 100 - pos) as usize;
            self.0.read(&mut buf[..len])
        }
    }

    impl Seek for Flaky {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.seek(pos)
        }
    }

    let mut stream = EbStream::new(Flaky(Cursor::new(vec![0xAA; 1000])));
    stream.skip(30)?;
    assert!(matches!(
        stream.read_record(200, "test"),
        Err(Error::Io(_))
    ));

    // The 70 bytes before the error were consumed
    assert_eq!(stream.position(), 100);
    assert!(stream.read_up_to(10).is_err());
    assert_eq!(stream.position(), 100);

    Ok(())
}
