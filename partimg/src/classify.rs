//! Container and filesystem detection
//!
//! The container is read from leading signature bytes or, for the multi-file encodings, from
//! file naming conventions. The filesystem is read from the superblock area of the decoded
//! bytes, looking through sparse, gzip and zstd containers when the header allows it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::Config;
use crate::erofs::{ErofsSuperBlock, EROFS_SUPER_OFFSET, EROFS_SUPER_SIZE};
use crate::error::PartimgError;
use crate::ext4::{EXT4_MAGIC, EXT4_MAGIC_OFFSET, EXT4_SUPER_OFFSET};
use crate::kinds::{ContainerKind, FilesystemKind};
use crate::partition::partition_name;
use crate::sparse;

/// Decoded bytes needed to see every superblock we look for
const FS_PROBE_LEN: usize = 0x1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Classification {
    pub container: ContainerKind,
    pub filesystem: FilesystemKind,
}

/// Classify an image from its leading bytes
///
/// Filesystem rules, in priority order:
/// 1. erofs magic with 4KiB blocks at 0x400
/// 2. zeroed magic and block size at 0x400, a logical partition table
/// 3. ext4 magic at 1024
///
/// A raw image matching none of them is a [`PartimgError::Format`]. Behind a container the
/// filesystem may stay [`FilesystemKind::Unknown`] until the container is decoded.
pub fn classify(header: &[u8]) -> Result<Classification, PartimgError> {
    let Some(container) = ContainerKind::from_signature(header) else {
        let filesystem = filesystem_of(header)
            .ok_or_else(|| PartimgError::Format("no container or filesystem signature".to_string()))?;
        return Ok(Classification { container: ContainerKind::Raw, filesystem });
    };

    let decoded = match container {
        ContainerKind::Sparse => sparse::peek(Cursor::new(header), FS_PROBE_LEN).ok(),
        ContainerKind::Gzip => gzip_prefix(header),
        ContainerKind::Zstd => zstd_prefix(header),
        _ => None,
    };
    let filesystem = decoded
        .filter(|d| ContainerKind::from_signature(d).is_none())
        .and_then(|d| filesystem_of(&d))
        .unwrap_or(FilesystemKind::Unknown);
    Ok(Classification { container, filesystem })
}

/// Filesystem visible in raw bytes
fn filesystem_of(bytes: &[u8]) -> Option<FilesystemKind> {
    let erofs_start = EROFS_SUPER_OFFSET as usize;
    if let Some(sb) = bytes.get(erofs_start..erofs_start + EROFS_SUPER_SIZE) {
        if let Ok(sb) = ErofsSuperBlock::parse(sb) {
            trace!("probe at 0x400: magic {:#x}, blkszbits {}", sb.magic, sb.blkszbits);
            if sb.is_erofs() {
                return Some(FilesystemKind::Erofs);
            }
            if sb.is_super() {
                return Some(FilesystemKind::Super);
            }
        }
    }

    let magic_at = EXT4_SUPER_OFFSET as usize + EXT4_MAGIC_OFFSET;
    match bytes.get(magic_at..magic_at + 2) {
        Some(m) if u16::from_le_bytes([m[0], m[1]]) == EXT4_MAGIC => Some(FilesystemKind::Ext4),
        _ => None,
    }
}

/// Read as much of a decoder's output as a truncated input allows
#[cfg(any(feature = "gzip", feature = "zstd"))]
fn read_prefix<R: Read>(mut decoder: R) -> Vec<u8> {
    let mut out = vec![0_u8; FS_PROBE_LEN];
    let mut filled = 0;
    while filled < out.len() {
        match decoder.read(&mut out[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    out.truncate(filled);
    out
}

#[cfg(feature = "gzip")]
fn gzip_prefix(header: &[u8]) -> Option<Vec<u8>> {
    Some(read_prefix(flate2::read::GzDecoder::new(header)))
}

#[cfg(not(feature = "gzip"))]
fn gzip_prefix(_header: &[u8]) -> Option<Vec<u8>> {
    None
}

#[cfg(feature = "zstd")]
fn zstd_prefix(header: &[u8]) -> Option<Vec<u8>> {
    zstd::stream::read::Decoder::new(header).ok().map(read_prefix)
}

#[cfg(not(feature = "zstd"))]
fn zstd_prefix(_header: &[u8]) -> Option<Vec<u8>> {
    None
}

/// Files making up one partition in a firmware directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLayout {
    /// One image file, possibly wrapped in sparse, gzip or zstd
    Single(PathBuf),
    /// `<name>.new.dat[.br]` replayed through `<name>.transfer.list`
    TransferList { data: PathBuf, list: PathBuf },
    /// `<name>_<N>.img` sparse pieces, in directory order
    Chunks(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSource {
    pub name: String,
    pub layout: SourceLayout,
}

impl PartitionSource {
    pub fn single(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), layout: SourceLayout::Single(path.into()) }
    }

    /// Every file this source reads
    pub fn inputs(&self) -> Vec<PathBuf> {
        match &self.layout {
            SourceLayout::Single(path) => vec![path.clone()],
            SourceLayout::TransferList { data, list } => vec![data.clone(), list.clone()],
            SourceLayout::Chunks(paths) => paths.clone(),
        }
    }
}

/// Classifies whole partition sources, reading only a bounded header of each file
#[derive(Debug, Clone)]
pub struct Classifier {
    probe_len: usize,
}

impl Classifier {
    pub fn new(config: &Config) -> Self {
        Self { probe_len: config.probe_len.max(EXT4_SUPER_OFFSET as usize * 2) }
    }

    pub fn classify_file(&self, path: &Path) -> Result<Classification, PartimgError> {
        let mut header = Vec::with_capacity(self.probe_len);
        File::open(path)?.take(self.probe_len as u64).read_to_end(&mut header)?;
        let class = classify(&header)?;
        debug!("{}: {:?}", path.display(), class);
        Ok(class)
    }

    pub fn classify_source(&self, source: &PartitionSource) -> Result<Classification, PartimgError> {
        match &source.layout {
            SourceLayout::Single(path) => self.classify_file(path),
            SourceLayout::TransferList { data, list } => {
                if !list.exists() {
                    return Err(PartimgError::Integrity {
                        path: list.clone(),
                        reason: format!("{} has no transfer list", data.display()),
                    });
                }
                let container = if data.extension().is_some_and(|e| e == "br") {
                    ContainerKind::Brotli
                } else {
                    ContainerKind::TransferList
                };
                Ok(Classification { container, filesystem: FilesystemKind::Unknown })
            }
            SourceLayout::Chunks(paths) => {
                let first = crate::pipeline::order_chunks(paths)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| PartimgError::Format(format!("{}: no chunk files", source.name)))?;
                let inner = self.classify_file(&first)?;
                if inner.container != ContainerKind::Sparse {
                    return Err(PartimgError::Format(format!(
                        "{} is not a sparse chunk",
                        first.display()
                    )));
                }
                Ok(Classification {
                    container: ContainerKind::SparseChunks,
                    filesystem: inner.filesystem,
                })
            }
        }
    }
}

/// Group the files of an extracted firmware directory into partition sources
///
/// Names outside `allow` are skipped, `super` is always kept. An empty `allow` keeps every
/// partition.
pub fn discover(dir: &Path, allow: &[String]) -> Result<Vec<PartitionSource>, PartimgError> {
    let mut names = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    let mut sources = BTreeMap::new();
    let mut chunks: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for file_name in &names {
        let path = dir.join(file_name);
        let name = partition_name(file_name).to_string();
        if let Some(stem) = file_name.strip_suffix(".new.dat.br") {
            let list = dir.join(format!("{stem}.transfer.list"));
            // an already decompressed payload wins
            sources.entry(name).or_insert(SourceLayout::TransferList { data: path, list });
        } else if let Some(stem) = file_name.strip_suffix(".new.dat") {
            let list = dir.join(format!("{stem}.transfer.list"));
            sources.insert(name, SourceLayout::TransferList { data: path, list });
        } else if let Some(base) = chunk_base(file_name) {
            chunks.entry(base.to_string()).or_default().push(path);
        } else if [".img", ".img.gz", ".img.zst"].iter().any(|s| file_name.ends_with(s)) {
            sources.entry(name).or_insert(SourceLayout::Single(path));
        } else {
            trace!("ignoring {file_name}");
        }
    }

    for (base, mut paths) in chunks {
        let layout = if paths.len() > 1 {
            SourceLayout::Chunks(paths)
        } else {
            match paths.pop() {
                Some(path) => SourceLayout::Single(path),
                None => continue,
            }
        };
        sources.entry(base).or_insert(layout);
    }

    Ok(sources
        .into_iter()
        .filter(|(name, _)| {
            let keep = allowed(name, allow);
            if !keep {
                debug!("skipping {name}, not a known partition");
            }
            keep
        })
        .map(|(name, layout)| PartitionSource { name, layout })
        .collect())
}

pub(crate) fn allowed(name: &str, allow: &[String]) -> bool {
    if allow.is_empty() || name == "super" {
        return true;
    }
    let slotless = crate::partition::Partition::new(name);
    allow.iter().any(|a| a == name || a == slotless.base_name())
}

/// `super` for `super_12.img`
pub(crate) fn chunk_base(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(".img")?;
    let (base, index) = stem.rsplit_once('_')?;
    if !base.is_empty() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
        Some(base)
    } else {
        None
    }
}
