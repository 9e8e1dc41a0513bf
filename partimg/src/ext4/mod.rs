//! ext2/3/4 read support: superblock, inodes, directories and extended attributes

mod dir;
mod inode;
mod superblock;
mod volume;
pub mod xattr;

pub use dir::{parse_dir_blocks, DirEntry, DirEntryHeader};
pub use inode::{Extent, ExtentHeader, ExtentIndex, GroupDesc, Inode, InodeCore};
pub use superblock::{Ext4SuperBlock, EXT4_MAGIC, EXT4_MAGIC_OFFSET, EXT4_SUPER_OFFSET};
pub use volume::{Ext4Volume, ROOT_INO};
