//! Extended attributes, stored after the inode's extra fields or in a dedicated block

use deku::prelude::*;
use tracing::warn;

use crate::error::PartimgError;

pub const XATTR_MAGIC: u32 = 0xEA02_0000;

/// Size of the header in front of the entries of an xattr block
pub const XATTR_BLOCK_HEADER_SIZE: usize = 32;

pub const XATTR_ENTRY_HEADER_SIZE: usize = 16;

/// Full name of the mandatory access control label
pub const SELINUX_XATTR: &str = "security.selinux";

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrEntryHeader {
    pub name_len: u8,
    /// Selects the name prefix, 6 is `security.`
    pub name_index: u8,
    pub value_offs: u16,
    /// Inode holding the value, 0 when stored inline
    pub value_inum: u32,
    pub value_size: u32,
    pub hash: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

#[rustfmt::skip]
fn prefix(name_index: u8) -> &'static str {
    match name_index {
        1 => "user.",
        2 => "system.posix_acl_access",
        3 => "system.posix_acl_default",
        4 => "trusted.",
        6 => "security.",
        7 => "system.",
        8 => "system.richacl",
        _ => "",
    }
}

/// Parse the in-inode region that follows `i_extra_isize`
///
/// Value offsets are relative to the first entry.
pub fn parse_inode_region(region: &[u8]) -> Result<Vec<Xattr>, PartimgError> {
    if region.len() < 4 || read_u32(region, 0) != XATTR_MAGIC {
        return Ok(vec![]);
    }
    parse_entries(&region[4..], 0)
}

/// Parse an xattr block, value offsets are relative to the block start
pub fn parse_block(block: &[u8]) -> Result<Vec<Xattr>, PartimgError> {
    if block.len() < XATTR_BLOCK_HEADER_SIZE || read_u32(block, 0) != XATTR_MAGIC {
        return Err(PartimgError::Data("xattr block has a bad magic".to_string()));
    }
    parse_entries(block, XATTR_BLOCK_HEADER_SIZE)
}

/// Entries from `start` up to the zero terminator, value offsets are relative to `bytes`
fn parse_entries(bytes: &[u8], start: usize) -> Result<Vec<Xattr>, PartimgError> {
    let mut out = vec![];
    let mut pos = start;
    while pos + 4 <= bytes.len() && read_u32(bytes, pos) != 0 {
        let Some(header_bytes) = bytes.get(pos..pos + XATTR_ENTRY_HEADER_SIZE) else {
            return Err(PartimgError::Data("xattr entry runs past its region".to_string()));
        };
        let (_, header) = XattrEntryHeader::from_bytes((header_bytes, 0))?;
        let name_start = pos + XATTR_ENTRY_HEADER_SIZE;
        let name_end = name_start + usize::from(header.name_len);
        let name = bytes
            .get(name_start..name_end)
            .ok_or_else(|| PartimgError::Data("xattr name runs past its region".to_string()))?;
        let name = format!("{}{}", prefix(header.name_index), String::from_utf8_lossy(name));

        if header.value_inum != 0 {
            warn!("xattr {name} is stored in inode {}, skipping", header.value_inum);
        } else {
            let value_start = usize::from(header.value_offs);
            let value_end = value_start + header.value_size as usize;
            let value = bytes.get(value_start..value_end).ok_or_else(|| {
                PartimgError::Data(format!("xattr {name} value runs past its region"))
            })?;
            out.push(Xattr { name, value: value.to_vec() });
        }

        pos = (name_end + 3) & !3;
    }
    Ok(out)
}

/// Security label from a set of attributes, trailing NULs removed
pub fn selinux_label(xattrs: &[Xattr]) -> Option<String> {
    xattrs.iter().find(|x| x.name == SELINUX_XATTR).map(|x| {
        let end = x.value.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        String::from_utf8_lossy(&x.value[..end]).into_owned()
    })
}

fn read_u32(bytes: &[u8], pos: usize) -> u32 {
    let b = &bytes[pos..pos + 4];
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
