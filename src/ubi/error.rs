//! Errors produced while locating and decoding eraseblocks.

use std::io;

/// Everything that can go wrong while pulling eraseblocks out of an image.
///
/// Only [Error::Io] is fatal to a scan; the others are local to the one eraseblock being parsed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fewer bytes remained in the image than a fixed-size record requires
    #[error("truncated {what}: needed {needed} bytes, only {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// The bytes were all there, but their content makes no sense
    #[error("could not decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    /// A header-declared offset points backwards, into a header that was already consumed
    #[error("bad {what} {offset:#x}: must be at least {minimum:#x}")]
    Offset {
        what: &'static str,
        offset: u32,
        minimum: u64,
    },

    /// The input source itself failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Should this error stop the scan, rather than just costing us one eraseblock?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    pub(crate) fn decode(what: &'static str, reason: impl ToString) -> Self {
        Self::Decode {
            what,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[test]
fn test_fatality() {
    let truncated = Error::Truncated {
        what: "EC header",
        needed: 64,
        available: 3,
    };
    assert!(!truncated.is_fatal());
    assert!(!Error::decode("VID header", "bad magic").is_fatal());
    assert!(Error::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_fatal());

    assert_eq!(
        truncated.to_string(),
        "truncated EC header: needed 64 bytes, only 3 available"
    );
}
