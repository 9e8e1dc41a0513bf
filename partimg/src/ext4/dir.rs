use deku::prelude::*;
use tracing::warn;

use crate::error::PartimgError;

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirEntryHeader {
    /// 0 for unused entries, htree nodes and checksum tails
    pub inode: u32,
    /// Distance to the next entry
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

pub const DIR_ENTRY_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
}

/// Parse linear directory blocks
///
/// htree directories keep their index inside entries with inode 0, so reading every block
/// linearly still yields each name exactly once.
pub fn parse_dir_blocks(data: &[u8], block_size: usize) -> Result<Vec<DirEntry>, PartimgError> {
    let mut out = vec![];
    for block in data.chunks(block_size) {
        let mut pos = 0;
        while pos + DIR_ENTRY_HEADER_SIZE <= block.len() {
            let (_, header) =
                DirEntryHeader::from_bytes((&block[pos..pos + DIR_ENTRY_HEADER_SIZE], 0))?;
            let rec_len = usize::from(header.rec_len);
            if rec_len < DIR_ENTRY_HEADER_SIZE || pos + rec_len > block.len() {
                return Err(PartimgError::Data(format!(
                    "directory entry at {pos} has rec_len {rec_len}"
                )));
            }
            let name_end = pos + DIR_ENTRY_HEADER_SIZE + usize::from(header.name_len);
            if header.inode != 0 && header.name_len > 0 && name_end <= pos + rec_len {
                let raw = &block[pos + DIR_ENTRY_HEADER_SIZE..name_end];
                let name = match String::from_utf8(raw.to_vec()) {
                    Ok(name) => name,
                    Err(_) => {
                        let name = String::from_utf8_lossy(raw).into_owned();
                        warn!("directory entry {name:?} is not valid utf-8");
                        name
                    }
                };
                out.push(DirEntry { inode: header.inode, name });
            }
            pos += rec_len;
        }
    }
    Ok(out)
}
