//! erofs superblock

use std::io::{Read, Seek, SeekFrom};

use deku::prelude::*;
use tracing::trace;

use crate::error::PartimgError;

/// Absolute offset of the superblock
pub const EROFS_SUPER_OFFSET: u64 = 0x400;

pub const EROFS_MAGIC: u32 = 0xE0F5E1E2;

/// log2 of 4KiB, the only block size Android builds use
pub const EROFS_BLKSZBITS: u8 = 12;

/// On-disk size of [`ErofsSuperBlock`]
pub const EROFS_SUPER_SIZE: usize = 128;

/// Fixed 128 byte little-endian superblock at offset 0x400
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ErofsSuperBlock {
    /// Must be set to 0xE0F5E1E2
    pub magic: u32,
    /// crc32c of the superblock block when the checksum feature is enabled
    pub checksum: u32,
    /// Compatible feature flags
    pub features: u32,
    /// log2 of the block size
    pub blkszbits: u8,
    pub reserved: u8,
    /// nid of the root directory
    pub root_nid: u16,
    /// Total valid inode count
    pub inos: u64,
    /// Build time, seconds since the epoch
    pub build_time: u64,
    pub build_time_nsec: u32,
    /// Total block count
    pub blocks: u32,
    /// Start block address of the metadata area
    pub meta_blkaddr: u32,
    /// Start block address of the shared xattr area
    pub xattr_blkaddr: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub reserved2: [u8; 48],
}

impl ErofsSuperBlock {
    /// Parse from the bytes at [`EROFS_SUPER_OFFSET`], without validating
    pub fn parse(bytes: &[u8]) -> Result<Self, PartimgError> {
        let (_, sb) = Self::from_bytes((bytes, 0))?;
        Ok(sb)
    }

    /// Read and validate the superblock of an image
    pub fn from_reader<R: Read + Seek>(mut reader: R) -> Result<Self, PartimgError> {
        reader.seek(SeekFrom::Start(EROFS_SUPER_OFFSET))?;
        let mut buf = [0_u8; EROFS_SUPER_SIZE];
        reader.read_exact(&mut buf)?;
        let sb = Self::parse(&buf)?;
        trace!("{:02x?}", sb);
        if !sb.is_erofs() {
            return Err(PartimgError::Data(format!(
                "invalid erofs superblock: magic {:#x}, blkszbits {}",
                sb.magic, sb.blkszbits
            )));
        }
        Ok(sb)
    }

    /// Valid erofs magic with the expected 4KiB block size
    pub fn is_erofs(&self) -> bool {
        self.magic == EROFS_MAGIC && self.blkszbits == EROFS_BLKSZBITS
    }

    /// Zeroed magic and block size, which is how a logical partition table looks at this offset
    pub fn is_super(&self) -> bool {
        self.magic == 0 && self.blkszbits == 0
    }

    pub fn block_size(&self) -> u32 {
        1_u32 << self.blkszbits.min(31)
    }

    /// Volume name with trailing NULs removed
    pub fn volume_name(&self) -> String {
        let end = self.volume_name.iter().position(|b| *b == 0).unwrap_or(self.volume_name.len());
        String::from_utf8_lossy(&self.volume_name[..end]).into_owned()
    }
}
