//! Builds synthetic UBI dumps for the unit tests.
//!
//! Every PEB is written with correct CRCs and padded out with erased (0xFF) bytes, like a real
//! ubinize'd image. Filler can be spliced in between PEBs with [TestImage::raw].

use super::headers::{Ec, Vid, VolTableRecord, VolType, UBI_VERSION};
use super::{UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES};

const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5;

pub struct TestImage {
    vid_hdr_offset: u32,
    data_offset: u32,
    peb_size: usize,
    sqnum: u64,
    bytes: Vec<u8>,
}

impl TestImage {
    pub const DEFAULT_PEB_SIZE: usize = 1024;

    /// Begin a new, empty image whose PEBs will use the given header offsets
    pub fn new(vid_hdr_offset: u32, data_offset: u32) -> Self {
        Self {
            vid_hdr_offset,
            data_offset,
            peb_size: Self::DEFAULT_PEB_SIZE,
            sqnum: 0,
            bytes: Vec::new(),
        }
    }

    /// Change the size that each PEB is padded out to
    pub fn peb_size(mut self, peb_size: usize) -> Self {
        self.peb_size = peb_size;
        self
    }

    /// Append one PEB; it grows past `peb_size` if the payload doesn't fit
    pub fn peb(&mut self, vid: Vid, payload: &[u8]) -> anyhow::Result<()> {
        let ec = Ec {
            version: UBI_VERSION,
            ec: 1,
            vid_hdr_offset: self.vid_hdr_offset,
            data_offset: self.data_offset,
            image_seq: 0x5EED,
            ..Default::default()
        };

        self.sqnum += 1;
        let vid = Vid {
            version: UBI_VERSION,
            sqnum: self.sqnum,
            ..vid
        };

        let data_offset = self.data_offset as usize;
        let mut peb = vec![0xFF; std::cmp::max(self.peb_size, data_offset + payload.len())];
        ec.with_crc()?.encode(&mut peb)?;
        vid.with_crc()?.encode(&mut peb[self.vid_hdr_offset as usize..])?;
        peb[data_offset..][..payload.len()].copy_from_slice(payload);

        self.bytes.extend(peb);
        Ok(())
    }

    pub fn static_leb(&mut self, vol_id: u32, lnum: u32, data: &[u8]) -> anyhow::Result<()> {
        let vid = Vid {
            vol_type: VolType::Static.into(),
            vol_id,
            lnum,
            data_size: data.len() as u32,
            data_crc: super::UBI_CRC.checksum(data),
            ..Default::default()
        };
        self.peb(vid, data)
    }

    pub fn dynamic_leb(&mut self, vol_id: u32, lnum: u32, data: &[u8]) -> anyhow::Result<()> {
        let vid = Vid {
            vol_type: VolType::Dynamic.into(),
            vol_id,
            lnum,
            ..Default::default()
        };
        self.peb(vid, data)
    }

    /// Append a layout volume LEB, naming the given volume table slots
    pub fn layout_leb(&mut self, lnum: u32, volumes: &[(usize, &str)]) -> anyhow::Result<()> {
        let mut records = vec![VolTableRecord::default(); UBI_MAX_VOLUMES];
        for &(slot, name) in volumes {
            records[slot] = VolTableRecord {
                reserved_pebs: 4,
                alignment: 1,
                vol_type: VolType::Dynamic.into(),
                name: name.to_string(),
                ..Default::default()
            };
        }
        self.layout_leb_from(lnum, records)
    }

    /// Append a layout volume LEB with a fully specified volume table
    pub fn layout_leb_from(
        &mut self,
        lnum: u32,
        records: Vec<VolTableRecord>,
    ) -> anyhow::Result<()> {
        let mut table = Vec::new();
        for record in records {
            table.extend(record.with_crc()?.into_bytes()?);
        }

        let vid = Vid {
            vol_type: VolType::Dynamic.into(),
            compat: UBI_LAYOUT_VOLUME_COMPAT,
            vol_id: UBI_LAYOUT_VOLUME_ID,
            lnum,
            ..Default::default()
        };
        self.peb(vid, &table)
    }

    /// Append arbitrary bytes
    pub fn raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Mutable access to everything written so far, for corrupting things
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
