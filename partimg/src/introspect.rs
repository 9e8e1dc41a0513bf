//! Superblock features and directory tree walks of a decoded filesystem image

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::erofs::ErofsSuperBlock;
use crate::error::PartimgError;
use crate::ext4::Ext4SuperBlock;
use crate::kinds::FilesystemKind;
use crate::mode::{decode_mode, render_mode};

/// Headroom added on top of a host tree's size, 40MiB
pub const PARTITION_HEADROOM: u64 = 40 * 1024 * 1024;

/// Directory entries never visited by [`Walk`]
const SKIPPED_NAMES: [&str; 3] = [".", "..", "lost+found"];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Regular,
    Symlink,
}

/// Everything a walk needs to know about one inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// `None` for device nodes, fifos and sockets, which are not recorded
    pub kind: Option<NodeKind>,
    pub uid: u32,
    pub gid: u32,
    /// Full `i_mode`, type bits included
    pub mode: u16,
    pub label: Option<String>,
    pub symlink_target: Option<String>,
}

/// Filesystem that can be walked from its root
pub trait TreeSource {
    /// Inode number of the root directory
    fn root(&self) -> u64;

    /// `(name, inode)` of every entry in directory `dir`
    fn children(&mut self, dir: u64) -> Result<Vec<(String, u64)>, PartimgError>;

    fn node(&mut self, ino: u64) -> Result<NodeInfo, PartimgError>;

    /// Write the contents of regular file `ino`
    fn copy_file(&mut self, ino: u64, writer: &mut dyn Write) -> Result<(), PartimgError>;
}

/// One path found by a [`Walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    /// Root-relative, always starting with `/`
    pub path: String,
    pub kind: NodeKind,
    pub uid: u32,
    pub gid: u32,
    /// Four octal digits, "special owner group other"
    pub mode: String,
    /// Empty when the inode carries no security label
    pub label: String,
    pub symlink_target: Option<String>,
    pub ino: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WalkCounts {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
}

/// Depth-first walk over a [`TreeSource`], yielding one [`InodeRecord`] per path
///
/// Children are visited in name order. The walk stops after the first error, and can't be
/// restarted. [`Walk::counts`] holds the totals once the iterator is exhausted.
pub struct Walk<'a, S: TreeSource> {
    source: &'a mut S,
    pending: Vec<(String, u64)>,
    visited: HashSet<u64>,
    counts: WalkCounts,
    started: bool,
    done: bool,
}

impl<'a, S: TreeSource> Walk<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Self {
            source,
            pending: vec![],
            visited: HashSet::new(),
            counts: WalkCounts::default(),
            started: false,
            done: false,
        }
    }

    pub fn counts(&self) -> WalkCounts {
        self.counts
    }

    fn push_children(&mut self, dir_path: &str, ino: u64) -> Result<(), PartimgError> {
        if !self.visited.insert(ino) {
            return Err(PartimgError::Data(format!("directory loop at {dir_path}/ (inode {ino})")));
        }
        let mut children = self.source.children(ino)?;
        children.retain(|(name, _)| !SKIPPED_NAMES.contains(&name.as_str()));
        // reversed, so pop() hands them out in ascending order
        children.sort_by(|a, b| b.0.cmp(&a.0));
        self.pending.extend(children.into_iter().map(|(name, ino)| (format!("{dir_path}/{name}"), ino)));
        Ok(())
    }

    fn step(&mut self) -> Result<Option<InodeRecord>, PartimgError> {
        if !self.started {
            self.started = true;
            let root = self.source.root();
            self.push_children("", root)?;
        }

        while let Some((path, ino)) = self.pending.pop() {
            let node = self.source.node(ino)?;
            let Some(kind) = node.kind else {
                debug!("skipping special file {path}");
                continue;
            };
            match kind {
                NodeKind::Directory => {
                    self.counts.directories += 1;
                    self.push_children(&path, ino)?;
                }
                NodeKind::Regular => self.counts.files += 1,
                NodeKind::Symlink => self.counts.symlinks += 1,
            }
            let mode = decode_mode(&render_mode(node.mode))?;
            trace!("{path} {kind:?} {}:{} {mode}", node.uid, node.gid);
            return Ok(Some(InodeRecord {
                path,
                kind,
                uid: node.uid,
                gid: node.gid,
                mode,
                label: node.label.unwrap_or_default(),
                symlink_target: node.symlink_target,
                ino,
            }));
        }
        Ok(None)
    }
}

impl<S: TreeSource> Iterator for Walk<'_, S> {
    type Item = Result<InodeRecord, PartimgError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Materialise walked records under `dest`
pub fn extract_tree<S: TreeSource>(
    source: &mut S,
    records: &[InodeRecord],
    dest: &Path,
) -> Result<(), PartimgError> {
    fs::create_dir_all(dest)?;
    for record in records {
        let path = dest.join(record.path.trim_start_matches('/'));
        match record.kind {
            NodeKind::Directory => fs::create_dir_all(&path)?,
            NodeKind::Regular => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut writer = BufWriter::new(File::create(&path)?);
                source.copy_file(record.ino, &mut writer)?;
                writer.flush()?;
            }
            NodeKind::Symlink => {
                let target = record.symlink_target.as_deref().unwrap_or_default();
                if path.symlink_metadata().is_ok() {
                    fs::remove_file(&path)?;
                }
                std::os::unix::fs::symlink(target, &path)?;
            }
        }
    }
    info!("extracted {} paths to {}", records.len(), dest.display());
    Ok(())
}

/// How the partition size of a features artifact is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSizeRule {
    /// Apparent size of a host directory tree rounded up to 1KiB, plus [`PARTITION_HEADROOM`]
    ///
    /// Used when the image will be rebuilt fresh from that tree.
    HostTree(PathBuf),
    /// Byte size of an existing image, used as is
    ImageSize(u64),
}

impl PartitionSizeRule {
    pub fn resolve(&self) -> Result<u64, PartimgError> {
        match self {
            Self::ImageSize(size) => Ok(*size),
            Self::HostTree(root) => {
                let mut total = 0_u64;
                for entry in WalkDir::new(root).follow_links(false) {
                    let entry = entry.map_err(io::Error::from)?;
                    total += entry.metadata().map_err(io::Error::from)?.len();
                }
                Ok(total.div_ceil(1024) * 1024 + PARTITION_HEADROOM)
            }
        }
    }
}

/// Superblock figures needed to describe and later recreate a filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemFeatures {
    pub kind: FilesystemKind,
    pub uuid: Uuid,
    pub volume_name: String,
    pub last_mounted: Option<String>,
    pub magic: u32,
    pub block_size: u64,
    pub inode_size: u16,
    /// Inodes in use by the image, without headroom
    pub inode_count: u64,
    /// ext4: reserved blocks as a percentage, erofs: the `reserved` superblock byte
    pub reserved_blocks: u64,
    /// Seconds since the epoch
    pub build_time: i64,
    pub partition_size: u64,
}

impl FilesystemFeatures {
    pub fn from_ext4(sb: &Ext4SuperBlock, partition_size: u64) -> Self {
        Self {
            kind: FilesystemKind::Ext4,
            uuid: Uuid::from_bytes(sb.uuid),
            volume_name: sb.volume_name(),
            last_mounted: Some(sb.last_mounted()).filter(|s| !s.is_empty()),
            magic: u32::from(sb.magic),
            block_size: sb.block_size(),
            inode_size: sb.inode_size(),
            inode_count: u64::from(sb.inodes_count),
            reserved_blocks: sb.reserved_percent(),
            build_time: i64::from(sb.mkfs_time),
            partition_size,
        }
    }

    pub fn from_erofs(sb: &ErofsSuperBlock, partition_size: u64) -> Self {
        Self {
            kind: FilesystemKind::Erofs,
            uuid: Uuid::from_bytes(sb.uuid),
            volume_name: sb.volume_name(),
            last_mounted: None,
            magic: sb.magic,
            block_size: u64::from(sb.block_size()),
            inode_size: 0,
            inode_count: sb.inos,
            reserved_blocks: u64::from(sb.reserved),
            build_time: i64::try_from(sb.build_time).unwrap_or(i64::MAX),
            partition_size,
        }
    }
}

/// Read the superblock of the filesystem image at `image`
pub fn read_features(
    image: &Path,
    kind: FilesystemKind,
    size: &PartitionSizeRule,
) -> Result<FilesystemFeatures, PartimgError> {
    let mut reader = BufReader::new(File::open(image)?);
    let features = match kind {
        FilesystemKind::Ext4 => {
            FilesystemFeatures::from_ext4(&Ext4SuperBlock::from_reader(&mut reader)?, size.resolve()?)
        }
        FilesystemKind::Erofs => {
            FilesystemFeatures::from_erofs(&ErofsSuperBlock::from_reader(&mut reader)?, size.resolve()?)
        }
        other => {
            return Err(PartimgError::Format(format!(
                "{} holds no readable filesystem ({other})",
                image.display()
            )))
        }
    };
    debug!("{features:?}");
    Ok(features)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::mode::{S_IFCHR, S_IFDIR, S_IFLNK, S_IFREG};

    /// In-memory tree keyed by inode number
    #[derive(Default)]
    pub(crate) struct MemTree {
        pub nodes: BTreeMap<u64, (NodeInfo, Vec<(String, u64)>, Vec<u8>)>,
        pub next: u64,
    }

    impl MemTree {
        pub fn new() -> Self {
            let mut tree = Self { nodes: BTreeMap::new(), next: 3 };
            tree.nodes.insert(2, (dir(0, 0, 0o755, "u:object_r:rootfs:s0"), vec![], vec![]));
            tree
        }

        pub fn add(&mut self, parent: u64, name: &str, info: NodeInfo, data: &[u8]) -> u64 {
            let ino = self.next;
            self.next += 1;
            self.nodes.insert(ino, (info, vec![], data.to_vec()));
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.1.push((name.to_string(), ino));
            }
            ino
        }
    }

    pub(crate) fn dir(uid: u32, gid: u32, perm: u16, label: &str) -> NodeInfo {
        NodeInfo {
            kind: Some(NodeKind::Directory),
            uid,
            gid,
            mode: S_IFDIR | perm,
            label: Some(label.to_string()),
            symlink_target: None,
        }
    }

    pub(crate) fn file(uid: u32, gid: u32, perm: u16, label: &str) -> NodeInfo {
        NodeInfo {
            kind: Some(NodeKind::Regular),
            uid,
            gid,
            mode: S_IFREG | perm,
            label: Some(label.to_string()),
            symlink_target: None,
        }
    }

    pub(crate) fn symlink(target: &str, label: &str) -> NodeInfo {
        NodeInfo {
            kind: Some(NodeKind::Symlink),
            uid: 0,
            gid: 0,
            mode: S_IFLNK | 0o777,
            label: Some(label.to_string()),
            symlink_target: Some(target.to_string()),
        }
    }

    impl TreeSource for MemTree {
        fn root(&self) -> u64 {
            2
        }

        fn children(&mut self, dir: u64) -> Result<Vec<(String, u64)>, PartimgError> {
            let mut out = vec![(".".to_string(), dir), ("..".to_string(), 2)];
            out.extend(self.nodes[&dir].1.iter().cloned());
            Ok(out)
        }

        fn node(&mut self, ino: u64) -> Result<NodeInfo, PartimgError> {
            self.nodes.get(&ino).map(|n| n.0.clone()).ok_or_else(|| PartimgError::Data(format!("no inode {ino}")))
        }

        fn copy_file(&mut self, ino: u64, writer: &mut dyn Write) -> Result<(), PartimgError> {
            writer.write_all(&self.nodes[&ino].2)?;
            Ok(())
        }
    }

    pub(crate) fn sample_tree() -> MemTree {
        let mut tree = MemTree::new();
        let bin = tree.add(2, "bin", dir(0, 2000, 0o751, "u:object_r:system_file:s0"), b"");
        tree.add(bin, "sh", file(0, 2000, 0o755, "u:object_r:shell_exec:s0"), b"#!/bin/sh\n");
        tree.add(bin, "su", file(0, 0, 0o4750, "u:object_r:su_exec:s0"), b"");
        tree.add(2, "lost+found", dir(0, 0, 0o700, "u:object_r:rootfs:s0"), b"");
        tree.add(2, "build.prop", file(0, 0, 0o600, "u:object_r:system_file:s0"), b"ro.product.model=x\n");
        tree.add(2, "etc", symlink("/system/etc", "u:object_r:system_file:s0"), b"");
        tree
    }

    #[test]
    fn walk_order_and_counts() {
        let mut tree = sample_tree();
        let mut walk = Walk::new(&mut tree);
        let records: Vec<_> = walk.by_ref().collect::<Result<_, _>>().unwrap();
        let paths: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["/bin", "/bin/sh", "/bin/su", "/build.prop", "/etc"]);
        assert_eq!(walk.counts(), WalkCounts { directories: 1, files: 3, symlinks: 1 });

        assert_eq!(records[0].mode, "0751");
        assert_eq!(records[0].gid, 2000);
        assert_eq!(records[2].mode, "4750");
        assert_eq!(records[4].symlink_target.as_deref(), Some("/system/etc"));
        assert_eq!(records[1].label, "u:object_r:shell_exec:s0");
    }

    #[test]
    fn walk_is_lazy() {
        let mut tree = sample_tree();
        let mut walk = Walk::new(&mut tree);
        let first = walk.next().unwrap().unwrap();
        assert_eq!(first.path, "/bin");
        // only the root and /bin have been listed so far
        assert_eq!(walk.counts(), WalkCounts { directories: 1, files: 0, symlinks: 0 });
    }

    #[test]
    fn walk_skips_special_files() {
        let mut tree = MemTree::new();
        let mut dev = file(0, 0, 0o600, "");
        dev.mode = S_IFCHR | 0o600;
        dev.kind = None;
        tree.add(2, "null", dev, b"");
        tree.add(2, "a", file(0, 0, 0o644, ""), b"");
        let records: Vec<_> = Walk::new(&mut tree).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/a");
        assert_eq!(records[0].label, "");
    }

    #[test]
    fn walk_stops_on_loop() {
        let mut tree = MemTree::new();
        let a = tree.add(2, "a", dir(0, 0, 0o755, ""), b"");
        tree.nodes.get_mut(&a).unwrap().1.push(("again".to_string(), a));
        let results: Vec<_> = Walk::new(&mut tree).collect();
        assert!(results[0].is_ok());
        assert!(matches!(results.last(), Some(Err(PartimgError::Data(_)))));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn extract() {
        let mut tree = sample_tree();
        let records: Vec<_> = Walk::new(&mut tree).collect::<Result<_, _>>().unwrap();
        let dest = tempfile::tempdir().unwrap();
        extract_tree(&mut tree, &records, dest.path()).unwrap();

        assert_eq!(fs::read(dest.path().join("bin/sh")).unwrap(), b"#!/bin/sh\n");
        assert!(dest.path().join("bin").is_dir());
        assert_eq!(fs::read_link(dest.path().join("etc")).unwrap(), Path::new("/system/etc"));
        assert!(!dest.path().join("lost+found").exists());
    }

    #[test]
    fn host_tree_size() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vendor");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a"), vec![0; 1500]).unwrap();

        let dir_len = fs::metadata(&root).unwrap().len();
        let expected = (dir_len + 1500).div_ceil(1024) * 1024 + PARTITION_HEADROOM;
        assert_eq!(PartitionSizeRule::HostTree(root).resolve().unwrap(), expected);
        assert_eq!(PartitionSizeRule::ImageSize(4096).resolve().unwrap(), 4096);
    }
}
