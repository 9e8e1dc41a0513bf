use std::io::{self, Read, Seek, SeekFrom, Write};

use deku::prelude::*;
use tracing::{debug, trace};

use super::dir::{parse_dir_blocks, DirEntry};
use super::inode::{
    Extent, ExtentHeader, ExtentIndex, GroupDesc, Inode, EXTENT_MAGIC, GROUP_DESC_INODE_TABLE_HI,
    GROUP_DESC_SIZE, I_BLOCK_SIZE,
};
use super::superblock::Ext4SuperBlock;
use super::xattr::{self, Xattr};
use crate::error::PartimgError;
use crate::introspect::{NodeInfo, NodeKind, TreeSource};

pub const ROOT_INO: u32 = 2;

/// Deepest extent tree the kernel creates
const MAX_EXTENT_DEPTH: u16 = 5;

/// Contiguous run of file blocks
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Run {
    logical: u64,
    physical: u64,
    blocks: u64,
    /// Allocated but never written, reads as zeros
    uninit: bool,
}

/// Read-only view of an ext2/3/4 image
pub struct Ext4Volume<R> {
    reader: R,
    sb: Ext4SuperBlock,
    block_size: u64,
    inode_tables: Vec<u64>,
}

impl<R: Read + Seek> Ext4Volume<R> {
    pub fn open(mut reader: R) -> Result<Self, PartimgError> {
        let sb = Ext4SuperBlock::from_reader(&mut reader)?;
        let block_size = sb.block_size();
        debug!(
            "ext4: block size {block_size}, {} blocks, {} inodes, {} groups",
            sb.blocks_count(),
            sb.inodes_count,
            sb.group_count()
        );

        let desc_size = sb.desc_size();
        let table_start = (u64::from(sb.first_data_block) + 1) * block_size;
        let mut inode_tables = Vec::with_capacity(sb.group_count() as usize);
        let mut buf = vec![0_u8; desc_size as usize];
        for group in 0..sb.group_count() {
            reader.seek(SeekFrom::Start(table_start + group * desc_size))?;
            reader.read_exact(&mut buf)?;
            let (_, desc) = GroupDesc::from_bytes((&buf[..GROUP_DESC_SIZE], 0))?;
            let mut table = u64::from(desc.inode_table_lo);
            if desc_size >= 64 {
                let hi = &buf[GROUP_DESC_INODE_TABLE_HI..GROUP_DESC_INODE_TABLE_HI + 4];
                table |= u64::from(u32::from_le_bytes([hi[0], hi[1], hi[2], hi[3]])) << 32;
            }
            trace!("group {group}: inode table at block {table}");
            inode_tables.push(table);
        }

        Ok(Self { reader, sb, block_size, inode_tables })
    }

    pub fn superblock(&self) -> &Ext4SuperBlock {
        &self.sb
    }

    pub fn read_block(&mut self, block: u64) -> Result<Vec<u8>, PartimgError> {
        let mut buf = vec![0_u8; self.block_size as usize];
        self.reader.seek(SeekFrom::Start(block * self.block_size))?;
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_inode(&mut self, ino: u32) -> Result<Inode, PartimgError> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(PartimgError::Data(format!("inode {ino} out of range")));
        }
        let index = u64::from(ino - 1);
        let group = index / u64::from(self.sb.inodes_per_group);
        let slot = index % u64::from(self.sb.inodes_per_group);
        let table = *self
            .inode_tables
            .get(group as usize)
            .ok_or_else(|| PartimgError::Data(format!("inode {ino} in missing group {group}")))?;
        let inode_size = u64::from(self.sb.inode_size());

        let mut raw = vec![0_u8; inode_size as usize];
        self.reader.seek(SeekFrom::Start(table * self.block_size + slot * inode_size))?;
        self.reader.read_exact(&mut raw)?;
        Inode::parse(ino, raw)
    }

    fn runs(&mut self, inode: &Inode) -> Result<Vec<Run>, PartimgError> {
        let mut runs = if inode.has_extents() {
            self.extent_runs(inode)?
        } else {
            self.block_map_runs(inode)?
        };
        runs.sort_by_key(|r| r.logical);
        Ok(runs)
    }

    fn extent_runs(&mut self, inode: &Inode) -> Result<Vec<Run>, PartimgError> {
        let mut runs = vec![];
        let mut nodes = vec![(inode.core.block.to_vec(), None)];
        while let Some((node, parent_depth)) = nodes.pop() {
            let (_, header) = ExtentHeader::from_bytes((&node, 0))?;
            if header.magic != EXTENT_MAGIC {
                return Err(PartimgError::Data(format!(
                    "inode {}: bad extent magic {:#x}",
                    inode.ino, header.magic
                )));
            }
            let valid_depth = match parent_depth {
                None => header.depth <= MAX_EXTENT_DEPTH,
                Some(parent) => header.depth.checked_add(1) == Some(parent),
            };
            if !valid_depth {
                return Err(PartimgError::Data(format!(
                    "inode {}: inconsistent extent depth {}",
                    inode.ino, header.depth
                )));
            }

            let entries = usize::from(header.entries);
            if 12 * (entries + 1) > node.len() {
                return Err(PartimgError::Data(format!(
                    "inode {}: {entries} extents overflow their node",
                    inode.ino
                )));
            }
            for i in 0..entries {
                let entry = &node[12 * (i + 1)..12 * (i + 2)];
                if header.depth == 0 {
                    let (_, extent) = Extent::from_bytes((entry, 0))?;
                    runs.push(Run {
                        logical: u64::from(extent.block),
                        physical: extent.start(),
                        blocks: u64::from(extent.blocks()),
                        uninit: extent.is_uninit(),
                    });
                } else {
                    let (_, index) = ExtentIndex::from_bytes((entry, 0))?;
                    nodes.push((self.read_block(index.leaf())?, Some(header.depth)));
                }
            }
        }
        Ok(runs)
    }

    fn block_map_runs(&mut self, inode: &Inode) -> Result<Vec<Run>, PartimgError> {
        let needed = inode.size().div_ceil(self.block_size);
        let pointers = inode.block_pointers();
        let mut runs = vec![];
        let mut logical = 0_u64;

        for ptr in &pointers[..12] {
            if logical >= needed {
                return Ok(runs);
            }
            if *ptr != 0 {
                runs.push(Run { logical, physical: u64::from(*ptr), blocks: 1, uninit: false });
            }
            logical += 1;
        }
        for (level, ptr) in [(1, pointers[12]), (2, pointers[13]), (3, pointers[14])] {
            self.map_indirect(ptr, level, &mut logical, needed, &mut runs)?;
        }
        Ok(runs)
    }

    fn map_indirect(
        &mut self,
        ptr: u32,
        level: u32,
        logical: &mut u64,
        needed: u64,
        runs: &mut Vec<Run>,
    ) -> Result<(), PartimgError> {
        if *logical >= needed {
            return Ok(());
        }
        let per_block = self.block_size / 4;
        if ptr == 0 {
            *logical += per_block.pow(level);
            return Ok(());
        }
        let block = self.read_block(u64::from(ptr))?;
        for entry in block.chunks_exact(4) {
            if *logical >= needed {
                break;
            }
            let entry = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            if level == 1 {
                if entry != 0 {
                    runs.push(Run {
                        logical: *logical,
                        physical: u64::from(entry),
                        blocks: 1,
                        uninit: false,
                    });
                }
                *logical += 1;
            } else {
                self.map_indirect(entry, level - 1, logical, needed, runs)?;
            }
        }
        Ok(())
    }

    /// Write the first `i_size` bytes of an inode's data, holes read as zeros
    pub fn copy_data<W: Write + ?Sized>(
        &mut self,
        inode: &Inode,
        writer: &mut W,
    ) -> Result<(), PartimgError> {
        let size = inode.size();
        if inode.has_inline_data() {
            if size > I_BLOCK_SIZE as u64 {
                return Err(PartimgError::Data(format!(
                    "inode {}: inline data past i_block is unsupported",
                    inode.ino
                )));
            }
            writer.write_all(&inode.core.block[..size as usize])?;
            return Ok(());
        }

        let mut written = 0_u64;
        for run in self.runs(inode)? {
            let start = run.logical * self.block_size;
            if start >= size {
                break;
            }
            if start < written {
                return Err(PartimgError::Data(format!("inode {}: overlapping extents", inode.ino)));
            }
            io::copy(&mut io::repeat(0).take(start - written), writer)?;
            let len = (run.blocks * self.block_size).min(size - start);
            if run.uninit {
                io::copy(&mut io::repeat(0).take(len), writer)?;
            } else {
                self.reader.seek(SeekFrom::Start(run.physical * self.block_size))?;
                let copied = io::copy(&mut (&mut self.reader).take(len), writer)?;
                if copied != len {
                    return Err(PartimgError::Data(format!(
                        "inode {}: data past the end of the image",
                        inode.ino
                    )));
                }
            }
            written = start + len;
        }
        io::copy(&mut io::repeat(0).take(size - written), writer)?;
        Ok(())
    }

    pub fn read_data(&mut self, inode: &Inode) -> Result<Vec<u8>, PartimgError> {
        let mut out = Vec::with_capacity(inode.size().min(1 << 20) as usize);
        self.copy_data(inode, &mut out)?;
        Ok(out)
    }

    pub fn read_dir(&mut self, inode: &Inode) -> Result<Vec<DirEntry>, PartimgError> {
        if !inode.is_dir() {
            return Err(PartimgError::Data(format!("inode {} is not a directory", inode.ino)));
        }
        let data = self.read_data(inode)?;
        parse_dir_blocks(&data, self.block_size as usize)
    }

    /// In-inode attributes followed by those of the attribute block
    pub fn xattrs(&mut self, inode: &Inode) -> Result<Vec<Xattr>, PartimgError> {
        let mut out = xattr::parse_inode_region(inode.xattr_region())?;
        let acl = inode.file_acl();
        if acl != 0 {
            let block = self.read_block(acl)?;
            out.extend(xattr::parse_block(&block)?);
        }
        Ok(out)
    }

    pub fn symlink_target(&mut self, inode: &Inode) -> Result<String, PartimgError> {
        let bytes = if inode.is_fast_symlink() {
            inode.core.block[..inode.size() as usize].to_vec()
        } else {
            self.read_data(inode)?
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<R: Read + Seek> TreeSource for Ext4Volume<R> {
    fn root(&self) -> u64 {
        u64::from(ROOT_INO)
    }

    fn children(&mut self, dir: u64) -> Result<Vec<(String, u64)>, PartimgError> {
        let inode = self.read_inode(ino32(dir)?)?;
        Ok(self.read_dir(&inode)?.into_iter().map(|e| (e.name, u64::from(e.inode))).collect())
    }

    fn node(&mut self, ino: u64) -> Result<NodeInfo, PartimgError> {
        let inode = self.read_inode(ino32(ino)?)?;
        let kind = if inode.is_dir() {
            Some(NodeKind::Directory)
        } else if inode.is_file() {
            Some(NodeKind::Regular)
        } else if inode.is_symlink() {
            Some(NodeKind::Symlink)
        } else {
            None
        };
        let symlink_target = match kind {
            Some(NodeKind::Symlink) => Some(self.symlink_target(&inode)?),
            _ => None,
        };
        let label = xattr::selinux_label(&self.xattrs(&inode)?);
        Ok(NodeInfo {
            kind,
            uid: inode.uid(),
            gid: inode.gid(),
            mode: inode.core.mode,
            label,
            symlink_target,
        })
    }

    fn copy_file(&mut self, ino: u64, writer: &mut dyn Write) -> Result<(), PartimgError> {
        let inode = self.read_inode(ino32(ino)?)?;
        self.copy_data(&inode, writer)
    }
}

fn ino32(ino: u64) -> Result<u32, PartimgError> {
    u32::try_from(ino).map_err(|_| PartimgError::Data(format!("inode {ino} out of range")))
}
