use deku::prelude::*;

use crate::error::PartimgError;
use crate::mode::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

/// Size of the inode fields shared by every revision
pub const INODE_CORE_SIZE: usize = 128;

pub const EXTENTS_FL: u32 = 0x0008_0000;
pub const INLINE_DATA_FL: u32 = 0x1000_0000;

pub const EXTENT_MAGIC: u16 = 0xF30A;

/// Bytes of `i_block`, also the longest fast symlink target plus one
pub const I_BLOCK_SIZE: usize = 60;

#[derive(Debug, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct InodeCore {
    pub mode: u16,
    pub uid_lo: u16,
    pub size_lo: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid_lo: u16,
    pub links_count: u16,
    pub blocks_lo: u32,
    pub flags: u32,
    pub osd1: u32,
    /// Extent tree root, block map or fast symlink target
    pub block: [u8; I_BLOCK_SIZE],
    pub generation: u32,
    pub file_acl_lo: u32,
    pub size_high: u32,
    pub obso_faddr: u32,
    pub blocks_high: u16,
    pub file_acl_high: u16,
    pub uid_high: u16,
    pub gid_high: u16,
    pub checksum_lo: u16,
    pub reserved: u16,
}

/// One inode as read from the inode table
#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: u32,
    pub core: InodeCore,
    /// Full on-disk inode, `inode_size` bytes
    pub raw: Vec<u8>,
}

impl Inode {
    pub fn parse(ino: u32, raw: Vec<u8>) -> Result<Self, PartimgError> {
        if raw.len() < INODE_CORE_SIZE {
            return Err(PartimgError::Data(format!("inode {ino} is {} bytes", raw.len())));
        }
        let (_, core) = InodeCore::from_bytes((&raw, 0))?;
        Ok(Self { ino, core, raw })
    }

    pub fn uid(&self) -> u32 {
        u32::from(self.core.uid_high) << 16 | u32::from(self.core.uid_lo)
    }

    pub fn gid(&self) -> u32 {
        u32::from(self.core.gid_high) << 16 | u32::from(self.core.gid_lo)
    }

    pub fn size(&self) -> u64 {
        u64::from(self.core.size_high) << 32 | u64::from(self.core.size_lo)
    }

    pub fn file_acl(&self) -> u64 {
        u64::from(self.core.file_acl_high) << 32 | u64::from(self.core.file_acl_lo)
    }

    pub fn is_dir(&self) -> bool {
        self.core.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.core.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.core.mode & S_IFMT == S_IFLNK
    }

    pub fn has_extents(&self) -> bool {
        self.core.flags & EXTENTS_FL != 0
    }

    pub fn has_inline_data(&self) -> bool {
        self.core.flags & INLINE_DATA_FL != 0
    }

    /// Target lives in `i_block` instead of a data block
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink() && self.size() > 0 && self.size() < I_BLOCK_SIZE as u64
    }

    /// `i_extra_isize`, the bytes in use past the 128 byte core
    pub fn extra_isize(&self) -> usize {
        match self.raw.get(INODE_CORE_SIZE..INODE_CORE_SIZE + 2) {
            Some(b) => usize::from(u16::from_le_bytes([b[0], b[1]])),
            None => 0,
        }
    }

    /// Bytes after the extra fields, holding in-inode extended attributes
    pub fn xattr_region(&self) -> &[u8] {
        let start = INODE_CORE_SIZE + self.extra_isize();
        self.raw.get(start..).unwrap_or(&[])
    }

    /// `i_block` read as 15 block pointers
    pub fn block_pointers(&self) -> [u32; 15] {
        let mut out = [0_u32; 15];
        for (i, ptr) in out.iter_mut().enumerate() {
            let b = &self.core.block[i * 4..i * 4 + 4];
            *ptr = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
        out
    }
}

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtentHeader {
    /// Must be set to 0xF30A
    pub magic: u16,
    pub entries: u16,
    pub max: u16,
    /// 0 for leaf nodes
    pub depth: u16,
    pub generation: u32,
}

/// Leaf entry mapping logical blocks to a physical run
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Extent {
    pub block: u32,
    /// Run length, above 32768 marks an uninitialized extent
    pub len: u16,
    pub start_hi: u16,
    pub start_lo: u32,
}

impl Extent {
    pub fn start(&self) -> u64 {
        u64::from(self.start_hi) << 32 | u64::from(self.start_lo)
    }

    pub fn is_uninit(&self) -> bool {
        self.len > 32768
    }

    pub fn blocks(&self) -> u32 {
        if self.is_uninit() {
            u32::from(self.len - 32768)
        } else {
            u32::from(self.len)
        }
    }
}

/// Interior entry pointing at the next level of the tree
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtentIndex {
    pub block: u32,
    pub leaf_lo: u32,
    pub leaf_hi: u16,
    pub unused: u16,
}

impl ExtentIndex {
    pub fn leaf(&self) -> u64 {
        u64::from(self.leaf_hi) << 32 | u64::from(self.leaf_lo)
    }
}

/// Group descriptor fields shared by the 32 and 64 byte layouts
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct GroupDesc {
    pub block_bitmap_lo: u32,
    pub inode_bitmap_lo: u32,
    pub inode_table_lo: u32,
    pub free_blocks_count_lo: u16,
    pub free_inodes_count_lo: u16,
    pub used_dirs_count_lo: u16,
    pub flags: u16,
    pub exclude_bitmap_lo: u32,
    pub block_bitmap_csum_lo: u16,
    pub inode_bitmap_csum_lo: u16,
    pub itable_unused_lo: u16,
    pub checksum: u16,
}

/// Offset of `bg_inode_table_hi` in a 64 byte descriptor
pub const GROUP_DESC_INODE_TABLE_HI: usize = 0x28;

/// On-disk size of [`GroupDesc`]
pub const GROUP_DESC_SIZE: usize = 32;
