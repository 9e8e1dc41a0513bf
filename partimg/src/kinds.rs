//! Types of image encodings

use core::fmt;

/// Outer encoding wrapped around a filesystem image
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// Android sparse image, `0xED26FF3A` at offset 0
    Sparse,
    /// gzip stream, `1F 8B`
    Gzip,
    /// zstd frame, `28 B5 2F FD`
    Zstd,
    /// `<name>.new.dat.br` with a companion `<name>.transfer.list`
    Brotli,
    /// `<name>.new.dat` with a companion `<name>.transfer.list`
    TransferList,
    /// Sparse image split into `<name>_<N>.img` pieces
    SparseChunks,
    /// No container, filesystem bytes start at offset 0
    Raw,
}

impl ContainerKind {
    /// Match leading signature bytes
    pub fn from_signature(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&SPARSE_MAGIC) {
            Some(Self::Sparse)
        } else if bytes.starts_with(&GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Some(Self::Zstd)
        } else {
            None
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sparse => "sparse",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Brotli => "brotli",
            Self::TransferList => "transfer-list",
            Self::SparseChunks => "sparse-chunks",
            Self::Raw => "raw",
        };
        write!(f, "{s}")
    }
}

/// Filesystem visible once every container layer is removed
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FilesystemKind {
    Ext4,
    Erofs,
    /// Logical partition table (super image), must be split before a filesystem is visible
    Super,
    /// Hidden behind a container that has not been decoded yet
    Unknown,
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ext4 => "ext4",
            Self::Erofs => "erofs",
            Self::Super => "super",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

pub(crate) const SPARSE_MAGIC: [u8; 4] = 0xED26FF3A_u32.to_le_bytes();
pub(crate) const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
pub(crate) const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
