use std::io::{Read, Seek, SeekFrom};

use deku::prelude::*;

use crate::error::PartimgError;

/// Absolute offset of the primary superblock
pub const EXT4_SUPER_OFFSET: u64 = 1024;

pub const EXT4_MAGIC: u16 = 0xEF53;

/// Bytes of the superblock covered by [`Ext4SuperBlock`]
pub const EXT4_SUPER_SIZE: usize = 0x160;

/// Offset of `magic` inside the superblock
pub const EXT4_MAGIC_OFFSET: usize = 0x38;

pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_INLINE_DATA: u32 = 0x8000;

/// Leading part of the ext2/3/4 superblock, up to `want_extra_isize`
#[derive(Debug, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Ext4SuperBlock {
    pub inodes_count: u32,
    pub blocks_count_lo: u32,
    /// Blocks only root may allocate
    pub r_blocks_count_lo: u32,
    pub free_blocks_count_lo: u32,
    pub free_inodes_count: u32,
    /// 1 for 1KiB block filesystems, 0 otherwise
    pub first_data_block: u32,
    /// Block size is `1024 << log_block_size`
    pub log_block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    /// Must be set to 0xEF53
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub first_ino: u32,
    /// 128 for revision 0 filesystems
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub algorithm_usage_bitmap: u32,
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,
    pub reserved_gdt_blocks: u16,
    pub journal_uuid: [u8; 16],
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub jnl_backup_type: u8,
    /// Group descriptor size when the 64bit feature is set
    pub desc_size: u16,
    pub default_mount_opts: u32,
    pub first_meta_bg: u32,
    /// Creation time, seconds since the epoch
    pub mkfs_time: u32,
    pub jnl_blocks: [u32; 17],
    pub blocks_count_hi: u32,
    pub r_blocks_count_hi: u32,
    pub free_blocks_count_hi: u32,
    pub min_extra_isize: u16,
    pub want_extra_isize: u16,
}

impl Ext4SuperBlock {
    /// Read and validate the primary superblock of an image
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, PartimgError> {
        reader.seek(SeekFrom::Start(EXT4_SUPER_OFFSET))?;
        let mut buf = vec![0_u8; EXT4_SUPER_SIZE];
        reader.read_exact(&mut buf)?;
        let (_, sb) = Self::from_bytes((&buf, 0))?;
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> Result<(), PartimgError> {
        if self.magic != EXT4_MAGIC {
            return Err(PartimgError::Data(format!("bad ext4 magic {:#x}", self.magic)));
        }
        if self.log_block_size > 6 {
            return Err(PartimgError::Data(format!(
                "unsupported ext4 log_block_size {}",
                self.log_block_size
            )));
        }
        if self.inodes_per_group == 0 || self.blocks_per_group == 0 {
            return Err(PartimgError::Data("ext4 group geometry is zero".to_string()));
        }
        if self.rev_level > 0 && self.inode_size < 128 {
            return Err(PartimgError::Data(format!("ext4 inode size {}", self.inode_size)));
        }
        Ok(())
    }

    pub fn block_size(&self) -> u64 {
        1024_u64 << self.log_block_size
    }

    pub fn inode_size(&self) -> u16 {
        if self.rev_level == 0 {
            128
        } else {
            self.inode_size
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & INCOMPAT_64BIT != 0
    }

    pub fn blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { u64::from(self.blocks_count_hi) << 32 } else { 0 };
        hi | u64::from(self.blocks_count_lo)
    }

    pub fn r_blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { u64::from(self.r_blocks_count_hi) << 32 } else { 0 };
        hi | u64::from(self.r_blocks_count_lo)
    }

    /// Reserved blocks as a whole percentage of all blocks, rounded down
    pub fn reserved_percent(&self) -> u64 {
        match self.blocks_count() {
            0 => 0,
            blocks => self.r_blocks_count() * 100 / blocks,
        }
    }

    /// Size of one on-disk group descriptor
    pub fn desc_size(&self) -> u64 {
        if self.is_64bit() && self.desc_size >= 64 {
            u64::from(self.desc_size)
        } else {
            32
        }
    }

    pub fn group_count(&self) -> u64 {
        let data_blocks = self.blocks_count().saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group))
    }

    pub fn volume_name(&self) -> String {
        c_string(&self.volume_name)
    }

    pub fn last_mounted(&self) -> String {
        c_string(&self.last_mounted)
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets() {
        let mut buf = vec![0_u8; EXT4_SUPER_SIZE];
        buf[0x00..0x04].copy_from_slice(&8192_u32.to_le_bytes());
        buf[0x04..0x08].copy_from_slice(&32768_u32.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&1638_u32.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&2_u32.to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&32768_u32.to_le_bytes());
        buf[0x28..0x2C].copy_from_slice(&8192_u32.to_le_bytes());
        buf[EXT4_MAGIC_OFFSET..EXT4_MAGIC_OFFSET + 2].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
        buf[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes());
        buf[0x58..0x5A].copy_from_slice(&256_u16.to_le_bytes());
        buf[0x68..0x78].copy_from_slice(&[0x11; 16]);
        buf[0x78..0x7E].copy_from_slice(b"system");
        buf[0x88..0x8A].copy_from_slice(b"/\0");
        buf[0x108..0x10C].copy_from_slice(&1_230_768_000_u32.to_le_bytes());

        let (_, sb) = Ext4SuperBlock::from_bytes((&buf, 0)).unwrap();
        sb.validate().unwrap();
        assert_eq!(sb.inodes_count, 8192);
        assert_eq!(sb.block_size(), 4096);
        assert_eq!(sb.blocks_count(), 32768);
        assert_eq!(sb.reserved_percent(), 4);
        assert_eq!(sb.inode_size(), 256);
        assert_eq!(sb.uuid, [0x11; 16]);
        assert_eq!(sb.volume_name(), "system");
        assert_eq!(sb.last_mounted(), "/");
        assert_eq!(sb.mkfs_time, 1_230_768_000);
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.desc_size(), 32);
    }
}
