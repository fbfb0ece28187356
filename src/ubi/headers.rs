//! This module contains the code necessary to read and write EC/VID headers and volume table
//! records.
//!
//! Decoding is deliberately lax about checksums: the CRC fields are carried through so that they
//! can be inspected, but a dump pulled off a failing flash chip is still worth extracting, so
//! nothing here rejects a header for a CRC mismatch. Encoding, on the other hand, can produce
//! correct CRCs via `with_crc`.

use super::error::{Error, Result};
use super::{
    UBI_EC_HDR_MAGIC, UBI_EC_HDR_SIZE, UBI_VID_HDR_MAGIC, UBI_VID_HDR_SIZE, UBI_VOL_NAME_MAX,
    UBI_VTBL_RECORD_SIZE,
};

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
pub const UBI_VERSION: u8 = 1;

/// The on-flash layout of an erase counter header
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct EcHdr {
    magic: [u8; 4],
    version: u8,
    padding1: [u8; 3],
    ec: u64,
    vid_hdr_offset: u32,
    data_offset: u32,
    image_seq: u32,
    padding2: [u8; 32],
    hdr_crc: u32,
}

/// The on-flash layout of a volume identifier header
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct VidHdr {
    magic: [u8; 4],
    version: u8,
    vol_type: u8,
    copy_flag: u8,
    compat: u8,
    vol_id: u32,
    lnum: u32,
    leb_ver: u32,
    data_size: u32,
    used_ebs: u32,
    data_pad: u32,
    data_crc: u32,
    padding2: [u8; 4],
    sqnum: u64,
    padding3: [u8; 12],
    hdr_crc: u32,
}

/// The on-flash layout of one volume table record
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct VtblRecord {
    reserved_pebs: u32,
    alignment: u32,
    data_pad: u32,
    vol_type: u8,
    upd_marker: u8,
    name_len: u16,
    name: [u8; UBI_VOL_NAME_MAX],
    flags: u8,
    padding: [u8; 23],
    crc: u32,
}

/// Computes the UBI CRC of a record: every byte except the trailing CRC field itself.
trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> anyhow::Result<u32> {
        let bytes = self.to_bytes()?;
        let len = bytes.len() - std::mem::size_of::<u32>();
        Ok(UBI_CRC.checksum(&bytes[..len]))
    }
}

impl ComputeCrc for EcHdr {}
impl ComputeCrc for VidHdr {}
impl ComputeCrc for VtblRecord {}

/// Pull exactly `size` bytes off the front of `bytes` and hand them to deku.
fn parse_raw<'a, T: DekuContainerRead<'a>>(
    bytes: &'a [u8],
    size: usize,
    what: &'static str,
) -> Result<T> {
    let bytes = bytes.get(..size).ok_or(Error::Truncated {
        what,
        needed: size,
        available: bytes.len(),
    })?;
    let (_, raw) = T::from_bytes((bytes, 0)).map_err(|e| Error::decode(what, e))?;
    Ok(raw)
}

/// Copy an encoded record into the front of `out_bytes`
fn copy_out(bytes: &[u8], out_bytes: &mut [u8]) -> anyhow::Result<()> {
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or(anyhow::anyhow!("out_bytes too small"))?;
    out_bytes.copy_from_slice(bytes);
    Ok(())
}

/// An erase counter ("EC") header: the first thing in every eraseblock
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub version: u8,

    /// How many times this eraseblock has been erased
    pub ec: u64,

    /// Where the VID header starts, relative to the start of the eraseblock
    pub vid_hdr_offset: u32,

    /// Where the payload starts, relative to the start of the eraseblock
    pub data_offset: u32,

    pub image_seq: u32,

    /// Never verified
    pub hdr_crc: u32,
}

impl Ec {
    /// Decode the first 64 bytes of a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let hdr: EcHdr = parse_raw(bytes, UBI_EC_HDR_SIZE, "EC header")?;
        if hdr.magic != *UBI_EC_HDR_MAGIC {
            return Err(Error::decode(
                "EC header",
                format!("bad magic {:02x?}", hdr.magic),
            ));
        }

        Ok(hdr.into())
    }

    /// Write into a byte slice, exactly as-is (including `hdr_crc`)
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        copy_out(&EcHdr::from(self).to_bytes()?, out_bytes)
    }

    /// Replace `hdr_crc` with the correct CRC of the other fields
    pub fn with_crc(mut self) -> anyhow::Result<Self> {
        self.hdr_crc = EcHdr::from(self).compute_crc()?;
        Ok(self)
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            hdr_crc,
            ..
        } = value;

        Self {
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            hdr_crc,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            hdr_crc,
        } = value;

        Self {
            magic: *UBI_EC_HDR_MAGIC,
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            hdr_crc,

            padding1: Default::default(),
            padding2: Default::default(),
        }
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order; LEBs don't record how much of
    /// them is in use.
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written; every LEB records its data size.
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            x => Err(x),
        }
    }
}

/// A volume identifier ("VID") header, saying which LEB of which volume an eraseblock holds
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub version: u8,

    /// Raw volume type, as stored. See [Vid::volume_type].
    pub vol_type: u8,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: u8,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    pub leb_ver: u32,

    /// For `Static` volumes, the number of payload bytes in this LEB.
    pub data_size: u32,

    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub sqnum: u64,

    /// Never verified
    pub hdr_crc: u32,
}

impl Vid {
    /// Decode the first 64 bytes of a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let hdr: VidHdr = parse_raw(bytes, UBI_VID_HDR_SIZE, "VID header")?;
        if hdr.magic != *UBI_VID_HDR_MAGIC {
            return Err(Error::decode(
                "VID header",
                format!("bad magic {:02x?}", hdr.magic),
            ));
        }

        Ok(hdr.into())
    }

    /// The type of volume, which decides how the payload is delimited. Only LEBs marked static
    /// carry a usable `data_size`, so any other value is treated as dynamic.
    pub fn volume_type(&self) -> VolType {
        VolType::try_from(self.vol_type).unwrap_or_default()
    }

    /// Write into a byte slice, exactly as-is (including `hdr_crc`)
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        copy_out(&VidHdr::from(self).to_bytes()?, out_bytes)
    }

    /// Replace `hdr_crc` with the correct CRC of the other fields
    pub fn with_crc(mut self) -> anyhow::Result<Self> {
        self.hdr_crc = VidHdr::from(self).compute_crc()?;
        Ok(self)
    }
}

impl From<VidHdr> for Vid {
    fn from(value: VidHdr) -> Self {
        let VidHdr {
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            hdr_crc,
            ..
        } = value;

        Self {
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            hdr_crc,
        }
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            hdr_crc,
        } = value;

        Self {
            magic: *UBI_VID_HDR_MAGIC,
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            hdr_crc,

            padding2: Default::default(),
            padding3: Default::default(),
        }
    }
}

/// One slot of the volume table held by the layout volume
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// Raw volume type; unused slots hold 0, so this is not a [VolType].
    pub vol_type: u8,

    pub upd_marker: u8,

    /// The name of the volume; empty for an unused slot.
    pub name: String,

    pub flags: u8,

    /// Never verified
    pub crc: u32,
}

impl VolTableRecord {
    /// Decode the first 172 bytes of a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let rec: VtblRecord = parse_raw(bytes, UBI_VTBL_RECORD_SIZE, "volume table record")?;
        rec.try_into()
    }

    /// Does this slot describe a volume?
    pub fn is_used(&self) -> bool {
        !self.name.is_empty()
    }

    /// The volume type, if it's one we know
    pub fn volume_type(&self) -> Option<VolType> {
        self.vol_type.try_into().ok()
    }

    /// Write into a Vec<u8>, exactly as-is (including `crc`)
    pub fn into_bytes(self) -> anyhow::Result<Vec<u8>> {
        Ok(VtblRecord::try_from(self)?.to_bytes()?)
    }

    /// Replace `crc` with the correct CRC of the other fields
    pub fn with_crc(mut self) -> anyhow::Result<Self> {
        self.crc = VtblRecord::try_from(self.clone())?.compute_crc()?;
        Ok(self)
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = Error;

    fn try_from(value: VtblRecord) -> Result<Self> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            crc,
            ..
        } = value;

        let name = name.get(..name_len as usize).ok_or_else(|| {
            Error::decode(
                "volume table record",
                format!("name length {name_len} exceeds {UBI_VOL_NAME_MAX}"),
            )
        })?;
        let name = std::str::from_utf8(name)
            .map_err(|e| Error::decode("volume table record", format!("volume name: {e}")))?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
            crc,
        })
    }
}

impl TryFrom<VolTableRecord> for VtblRecord {
    type Error = anyhow::Error;

    fn try_from(value: VolTableRecord) -> anyhow::Result<VtblRecord> {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
            crc,
        } = value;

        let name_bytes = name.as_bytes();
        anyhow::ensure!(
            name_bytes.len() <= UBI_VOL_NAME_MAX,
            "volume name {name:?} is too long"
        );
        let name_len = name_bytes.len() as u16;
        let mut name = [0u8; UBI_VOL_NAME_MAX];
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name_len,
            name,
            flags,
            crc,

            padding: Default::default(),
        })
    }
}

#[test]
fn test_round_trip() -> anyhow::Result<()> {
    let ec = Ec {
        version: UBI_VERSION,
        ec: 0x0102_0304_0506_0708,
        vid_hdr_offset: 2048,
        data_offset: 4096,
        image_seq: 0x1234,
        hdr_crc: 0xDEADBEEF,
    };
    let vid = Vid {
        version: UBI_VERSION,
        vol_type: VolType::Static.into(),
        copy_flag: 1,
        compat: 5,
        vol_id: 3,
        lnum: 17,
        leb_ver: 9,
        data_size: 1000,
        used_ebs: 20,
        data_pad: 12,
        data_crc: 0xCAFEF00D,
        sqnum: 0xFFFF_0000_1111,
        hdr_crc: 0x0BADF00D,
    };
    let vtbl = VolTableRecord {
        reserved_pebs: 40,
        alignment: 1,
        data_pad: 0,
        vol_type: VolType::Dynamic.into(),
        upd_marker: 0,
        name: "rootfs".to_string(),
        flags: 0,
        crc: 0x5555_AAAA,
    };

    let mut buf = vec![0u8; 256];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf)?, ec);

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf)?, vid);

    let bytes = vtbl.clone().into_bytes()?;
    assert_eq!(bytes.len(), UBI_VTBL_RECORD_SIZE);
    assert_eq!(VolTableRecord::decode(&bytes)?, vtbl);

    Ok(())
}

#[test]
fn test_byte_layout() -> anyhow::Result<()> {
    let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
    Ec {
        version: 1,
        ec: 7,
        vid_hdr_offset: 0x800,
        data_offset: 0x1000,
        hdr_crc: 0x11223344,
        ..Default::default()
    }
    .encode(&mut buf)?;
    assert_eq!(&buf[0..4], b"UBI#");
    assert_eq!(buf[4], 1);
    assert_eq!(&buf[8..16], &[0, 0, 0, 0, 0, 0, 0, 7]);
    assert_eq!(&buf[16..20], &[0, 0, 0x08, 0]);
    assert_eq!(&buf[20..24], &[0, 0, 0x10, 0]);
    assert_eq!(&buf[60..64], &[0x11, 0x22, 0x33, 0x44]);

    let mut buf = vec![0u8; UBI_VID_HDR_SIZE];
    Vid {
        vol_type: VolType::Static.into(),
        vol_id: 0x7FFFEFFF,
        lnum: 2,
        leb_ver: 3,
        data_size: 4,
        used_ebs: 5,
        data_pad: 6,
        data_crc: 7,
        ..Default::default()
    }
    .encode(&mut buf)?;
    assert_eq!(&buf[0..4], b"UBI!");
    assert_eq!(buf[5], 2);
    assert_eq!(&buf[8..12], &[0x7F, 0xFF, 0xEF, 0xFF]);
    for (offset, value) in [(12, 2), (16, 3), (20, 4), (24, 5), (28, 6), (32, 7)] {
        assert_eq!(buf[offset..offset + 4], [0, 0, 0, value]);
    }

    let bytes = VolTableRecord {
        reserved_pebs: 1,
        alignment: 2,
        data_pad: 3,
        vol_type: 2,
        upd_marker: 1,
        name: "abc".to_string(),
        flags: 0x80,
        crc: 0x01020304,
    }
    .into_bytes()?;
    assert_eq!(&bytes[0..16], &[0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 2, 1, 0, 3]);
    assert_eq!(&bytes[16..20], b"abc\0");
    assert_eq!(bytes[144], 0x80);
    assert_eq!(&bytes[168..172], &[1, 2, 3, 4]);

    Ok(())
}

#[test]
fn test_decode_errors() -> anyhow::Result<()> {
    // Short input is a truncation, not a decode failure
    assert!(matches!(
        Ec::decode(b"UBI#\x01"),
        Err(Error::Truncated {
            needed: 64,
            available: 5,
            ..
        })
    ));

    let mut buf = vec![0u8; UBI_VID_HDR_SIZE];
    Vid::default().encode(&mut buf)?;
    buf[3] = b'?';
    assert!(matches!(Vid::decode(&buf), Err(Error::Decode { .. })));

    // Unknown volume types decode, and are delimited as dynamic
    Vid::default().encode(&mut buf)?;
    buf[5] = 9;
    let vid = Vid::decode(&buf)?;
    assert_eq!(vid.vol_type, 9);
    assert_eq!(vid.volume_type(), VolType::Dynamic);
    buf[5] = 2;
    assert_eq!(Vid::decode(&buf)?.volume_type(), VolType::Static);

    // Non-UTF-8 volume names fail distinctly
    let mut bytes = VolTableRecord {
        name: "ab".to_string(),
        ..Default::default()
    }
    .into_bytes()?;
    bytes[17] = 0xFF;
    assert!(matches!(
        VolTableRecord::decode(&bytes),
        Err(Error::Decode { .. })
    ));

    // So do names longer than the name field
    bytes[14..16].copy_from_slice(&200u16.to_be_bytes());
    assert!(matches!(
        VolTableRecord::decode(&bytes),
        Err(Error::Decode { .. })
    ));

    Ok(())
}

#[test]
fn test_crc_not_verified() -> anyhow::Result<()> {
    let ec = Ec {
        version: UBI_VERSION,
        vid_hdr_offset: 64,
        data_offset: 128,
        ..Default::default()
    };
    let good = ec.with_crc()?;
    assert_ne!(good.hdr_crc, 0);

    // A wrong CRC still decodes, and is reported as-is
    let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf)?, ec);

    Ok(())
}
