//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Append up to `read_len` bytes from `self` to `vec`, stopping early only at EOF.
    ///
    /// Returns how many bytes were appended; anything short of `read_len` means EOF was hit. On
    /// error, `vec` still holds whatever was appended before it.
    /// Memory is grown as data actually arrives, so an absurd `read_len` (say, from a corrupt
    /// length field) only costs as much as the input really holds.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<usize> {
        const CHUNK_SIZE: usize = 65536;

        let start = vec.len();
        let end = start.saturating_add(read_len);
        let mut cursor = start;
        while cursor < end {
            vec.resize(std::cmp::min(end, cursor + CHUNK_SIZE), 0u8);

            match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => cursor += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    vec.truncate(cursor);
                    return Err(e);
                }
            }
        }

        vec.truncate(cursor);
        Ok(cursor - start)
    }
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    assert_eq!(io::repeat(0xAA).read_to_vec(&mut vec, 4)?, 4);
    assert_eq!(vec, [0xAA; 4]);

    // Short reads at EOF are not an error
    assert_eq!((&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?, 3);
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2, 3]);

    // A huge request against a small input only allocates what's there
    let mut vec = Vec::new();
    assert_eq!((&[7u8; 100][..]).read_to_vec(&mut vec, usize::MAX)?, 100);
    assert!(vec.capacity() < 1 << 20);

    // Larger than one chunk
    let mut vec = Vec::new();
    assert_eq!(io::repeat(0x55).read_to_vec(&mut vec, 200_000)?, 200_000);
    assert!(vec.iter().all(|&x| x == 0x55));

    // An error keeps what came before it
    struct Broken;
    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "read failed"))
        }
    }
    let mut vec = Vec::new();
    let mut failing = (&[9u8; 10][..]).chain(Broken);
    assert!(failing.read_to_vec(&mut vec, 100).is_err());
    assert_eq!(vec, [9; 10]);

    Ok(())
}
