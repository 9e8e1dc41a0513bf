#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use partimg::{PartimgError, ToolInvocation, ToolOutput, ToolRunner};

pub const BLOCK_SIZE: usize = 4096;
pub const INODES: u32 = 64;
const INODE_SIZE: usize = 256;
const INODE_TABLE_BLOCK: usize = 4;
const FIRST_DATA_BLOCK: usize = INODE_TABLE_BLOCK + INODES as usize * INODE_SIZE / BLOCK_SIZE;
const ROOT_INO: u32 = 2;
const LOST_FOUND_INO: u32 = 11;

const S_IFDIR: u16 = 0o040000;
const S_IFREG: u16 = 0o100000;
const S_IFLNK: u16 = 0o120000;
const EXTENTS_FL: u32 = 0x0008_0000;

#[derive(Debug, Clone)]
pub enum Body {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    path: String,
    perm: u16,
    uid: u16,
    gid: u16,
    label: Option<String>,
    body: Body,
}

/// Single group, 4KiB block ext4 image with extent mapped files and in-inode labels
#[derive(Debug, Clone)]
pub struct Ext4Image {
    nodes: Vec<Node>,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,
    pub mkfs_time: u32,
    /// Minimum image size in blocks
    pub blocks: usize,
}

impl Ext4Image {
    pub fn new(volume_name: &str) -> Self {
        Self {
            nodes: vec![Node {
                path: String::new(),
                perm: 0o755,
                uid: 0,
                gid: 0,
                label: None,
                body: Body::Dir,
            }],
            uuid: [
                0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
                0x0B, 0x0C,
            ],
            volume_name: volume_name.to_string(),
            last_mounted: format!("/{volume_name}"),
            mkfs_time: 1_230_768_000,
            blocks: 64,
        }
    }

    pub fn root(mut self, uid: u16, gid: u16, label: &str) -> Self {
        self.nodes[0].uid = uid;
        self.nodes[0].gid = gid;
        self.nodes[0].label = Some(label.to_string());
        self
    }

    pub fn dir(self, path: &str, perm: u16, uid: u16, gid: u16, label: &str) -> Self {
        self.push(path, perm, uid, gid, Some(label), Body::Dir)
    }

    pub fn file(self, path: &str, perm: u16, uid: u16, gid: u16, label: &str, data: &[u8]) -> Self {
        self.push(path, perm, uid, gid, Some(label), Body::File(data.to_vec()))
    }

    pub fn symlink(self, path: &str, target: &str, label: &str) -> Self {
        self.push(path, 0o777, 0, 0, Some(label), Body::Symlink(target.to_string()))
    }

    pub fn unlabelled_file(self, path: &str, data: &[u8]) -> Self {
        self.push(path, 0o644, 0, 0, None, Body::File(data.to_vec()))
    }

    fn push(
        mut self,
        path: &str,
        perm: u16,
        uid: u16,
        gid: u16,
        label: Option<&str>,
        body: Body,
    ) -> Self {
        self.nodes.push(Node {
            path: path.to_string(),
            perm,
            uid,
            gid,
            label: label.map(str::to_string),
            body,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // inode numbers: root, lost+found, then every node in insertion order
        let mut inos = BTreeMap::new();
        inos.insert(String::new(), ROOT_INO);
        inos.insert("/lost+found".to_string(), LOST_FOUND_INO);
        for (i, node) in self.nodes.iter().skip(1).enumerate() {
            inos.insert(node.path.clone(), LOST_FOUND_INO + 1 + i as u32);
        }
        assert!(inos.len() < INODES as usize, "too many nodes");

        let lost_found = Node {
            path: "/lost+found".to_string(),
            perm: 0o700,
            uid: 0,
            gid: 0,
            label: None,
            body: Body::Dir,
        };
        let all: Vec<&Node> = self.nodes.iter().chain(std::iter::once(&lost_found)).collect();

        let mut next_block = FIRST_DATA_BLOCK;
        let mut blocks: Vec<(usize, Vec<u8>)> = vec![];
        let mut inodes: Vec<(u32, Vec<u8>)> = vec![];
        for node in &all {
            let ino = inos[&node.path];
            let (kind, data) = match &node.body {
                Body::Dir => (S_IFDIR, self.dir_block(node, &inos, &all)),
                Body::File(data) => (S_IFREG, data.clone()),
                Body::Symlink(target) => (S_IFLNK, target.as_bytes().to_vec()),
            };
            let fast_symlink = kind == S_IFLNK && data.len() < 60;
            let count = if fast_symlink { 0 } else { data.len().div_ceil(BLOCK_SIZE) };
            let start = next_block;
            next_block += count;
            if !fast_symlink && !data.is_empty() {
                blocks.push((start, data.clone()));
            }
            inodes.push((ino, inode(node, kind, &data, fast_symlink, start, count)));
        }

        let total_blocks = next_block.max(self.blocks);
        let mut image = vec![0_u8; total_blocks * BLOCK_SIZE];
        image[1024..1024 + 0x160].copy_from_slice(&self.superblock(total_blocks as u32));

        // group descriptor table
        let gd = BLOCK_SIZE;
        image[gd..gd + 4].copy_from_slice(&2_u32.to_le_bytes());
        image[gd + 4..gd + 8].copy_from_slice(&3_u32.to_le_bytes());
        image[gd + 8..gd + 12].copy_from_slice(&(INODE_TABLE_BLOCK as u32).to_le_bytes());

        for (ino, raw) in inodes {
            let at = INODE_TABLE_BLOCK * BLOCK_SIZE + (ino as usize - 1) * INODE_SIZE;
            image[at..at + INODE_SIZE].copy_from_slice(&raw);
        }
        for (block, data) in blocks {
            let at = block * BLOCK_SIZE;
            image[at..at + data.len()].copy_from_slice(&data);
        }
        image
    }

    fn superblock(&self, blocks: u32) -> Vec<u8> {
        let mut sb = vec![0_u8; 0x160];
        sb[0x00..0x04].copy_from_slice(&INODES.to_le_bytes());
        sb[0x04..0x08].copy_from_slice(&blocks.to_le_bytes());
        // 5% reserved
        sb[0x08..0x0C].copy_from_slice(&(blocks / 20).to_le_bytes());
        sb[0x18..0x1C].copy_from_slice(&2_u32.to_le_bytes());
        sb[0x20..0x24].copy_from_slice(&32768_u32.to_le_bytes());
        sb[0x24..0x28].copy_from_slice(&32768_u32.to_le_bytes());
        sb[0x28..0x2C].copy_from_slice(&INODES.to_le_bytes());
        sb[0x38..0x3A].copy_from_slice(&0xEF53_u16.to_le_bytes());
        sb[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes());
        sb[0x54..0x58].copy_from_slice(&11_u32.to_le_bytes());
        sb[0x58..0x5A].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
        // filetype | extents
        sb[0x60..0x64].copy_from_slice(&0x0042_u32.to_le_bytes());
        sb[0x68..0x78].copy_from_slice(&self.uuid);
        let name = self.volume_name.as_bytes();
        sb[0x78..0x78 + name.len()].copy_from_slice(name);
        let mounted = self.last_mounted.as_bytes();
        sb[0x88..0x88 + mounted.len()].copy_from_slice(mounted);
        sb[0x108..0x10C].copy_from_slice(&self.mkfs_time.to_le_bytes());
        sb
    }

    fn dir_block(&self, dir: &Node, inos: &BTreeMap<String, u32>, all: &[&Node]) -> Vec<u8> {
        let parent = match dir.path.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        let mut entries = vec![(".".to_string(), inos[&dir.path], 2_u8), ("..".to_string(), inos[&parent], 2)];
        for node in all {
            if node.path.is_empty() {
                continue;
            }
            if let Some((p, name)) = node.path.rsplit_once('/') {
                if p == dir.path {
                    let file_type = match node.body {
                        Body::Dir => 2,
                        Body::File(_) => 1,
                        Body::Symlink(_) => 7,
                    };
                    entries.push((name.to_string(), inos[&node.path], file_type));
                }
            }
        }

        let mut block = vec![0_u8; BLOCK_SIZE];
        let mut pos = 0;
        let count = entries.len();
        for (i, (name, ino, file_type)) in entries.into_iter().enumerate() {
            let len = (8 + name.len()).next_multiple_of(4);
            let rec_len = if i + 1 == count { BLOCK_SIZE - pos } else { len };
            block[pos..pos + 4].copy_from_slice(&ino.to_le_bytes());
            block[pos + 4..pos + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
            block[pos + 6] = name.len() as u8;
            block[pos + 7] = file_type;
            block[pos + 8..pos + 8 + name.len()].copy_from_slice(name.as_bytes());
            pos += len;
        }
        block
    }
}

fn inode(node: &Node, kind: u16, data: &[u8], fast_symlink: bool, start: usize, count: usize) -> Vec<u8> {
    let mut raw = vec![0_u8; INODE_SIZE];
    raw[0x00..0x02].copy_from_slice(&(kind | node.perm).to_le_bytes());
    raw[0x02..0x04].copy_from_slice(&node.uid.to_le_bytes());
    raw[0x04..0x08].copy_from_slice(&(data.len() as u32).to_le_bytes());
    raw[0x18..0x1A].copy_from_slice(&node.gid.to_le_bytes());
    let links: u16 = if kind == S_IFDIR { 2 } else { 1 };
    raw[0x1A..0x1C].copy_from_slice(&links.to_le_bytes());
    raw[0x1C..0x20].copy_from_slice(&((count * BLOCK_SIZE / 512) as u32).to_le_bytes());

    if fast_symlink {
        raw[0x28..0x28 + data.len()].copy_from_slice(data);
    } else {
        raw[0x20..0x24].copy_from_slice(&EXTENTS_FL.to_le_bytes());
        // extent header: magic, entries, max, depth
        raw[0x28..0x2A].copy_from_slice(&0xF30A_u16.to_le_bytes());
        raw[0x2A..0x2C].copy_from_slice(&u16::from(count > 0).to_le_bytes());
        raw[0x2C..0x2E].copy_from_slice(&4_u16.to_le_bytes());
        if count > 0 {
            // extent: logical block, length, start hi, start lo
            raw[0x34..0x38].copy_from_slice(&0_u32.to_le_bytes());
            raw[0x38..0x3A].copy_from_slice(&(count as u16).to_le_bytes());
            raw[0x3C..0x40].copy_from_slice(&(start as u32).to_le_bytes());
        }
    }

    // i_extra_isize
    raw[0x80..0x82].copy_from_slice(&32_u16.to_le_bytes());
    if let Some(label) = &node.label {
        let region = 0x80 + 32;
        raw[region..region + 4].copy_from_slice(&0xEA02_0000_u32.to_le_bytes());
        let entry = region + 4;
        let mut value = label.as_bytes().to_vec();
        value.push(0);
        let value_offs = 32_u16;
        raw[entry] = b"selinux".len() as u8;
        // security.
        raw[entry + 1] = 6;
        raw[entry + 2..entry + 4].copy_from_slice(&value_offs.to_le_bytes());
        raw[entry + 8..entry + 12].copy_from_slice(&(value.len() as u32).to_le_bytes());
        raw[entry + 16..entry + 23].copy_from_slice(b"selinux");
        let at = entry + usize::from(value_offs);
        assert!(at + value.len() <= INODE_SIZE, "label too long");
        raw[at..at + value.len()].copy_from_slice(&value);
    }
    raw
}

/// The tree most tests describe, as a vendor partition
pub fn vendor_image() -> Ext4Image {
    Ext4Image::new("vendor")
        .root(0, 2000, "u:object_r:vendor_file:s0")
        .dir("/bin", 0o751, 0, 2000, "u:object_r:vendor_file:s0")
        .file("/bin/hw+svc", 0o755, 0, 2000, "u:object_r:vendor_hal_exec:s0", b"#!/bin/sh\nexit 0\n")
        .dir("/etc", 0o755, 0, 2000, "u:object_r:vendor_configs_file:s0")
        .file("/etc/build.prop", 0o600, 1000, 1000, "u:object_r:vendor_configs_file:s0", &[b'a'; 5000])
        .symlink("/lib", "/vendor/lib64", "u:object_r:vendor_file:s0")
}

/// Android sparse encoding of `raw`, zero blocks become DONT_CARE
pub fn sparse(raw: &[u8]) -> Vec<u8> {
    sparse_range(raw, 0, raw.len() / BLOCK_SIZE)
}

/// Sparse file covering the whole image, with only blocks `start..end` carrying data
pub fn sparse_range(raw: &[u8], start: usize, end: usize) -> Vec<u8> {
    assert_eq!(raw.len() % BLOCK_SIZE, 0);
    let total = raw.len() / BLOCK_SIZE;

    // (is_data, blocks)
    let mut runs: Vec<(bool, usize)> = vec![];
    for block in 0..total {
        let bytes = &raw[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE];
        let data = (start..end).contains(&block) && bytes.iter().any(|b| *b != 0);
        match runs.last_mut() {
            Some((d, n)) if *d == data => *n += 1,
            _ => runs.push((data, 1)),
        }
    }

    let mut out = vec![];
    out.extend(0xED26FF3A_u32.to_le_bytes());
    out.extend(1_u16.to_le_bytes());
    out.extend(0_u16.to_le_bytes());
    out.extend(28_u16.to_le_bytes());
    out.extend(12_u16.to_le_bytes());
    out.extend((BLOCK_SIZE as u32).to_le_bytes());
    out.extend((total as u32).to_le_bytes());
    out.extend((runs.len() as u32).to_le_bytes());
    out.extend(0_u32.to_le_bytes());

    let mut block = 0;
    for (data, n) in runs {
        if data {
            out.extend(0xCAC1_u16.to_le_bytes());
            out.extend(0_u16.to_le_bytes());
            out.extend((n as u32).to_le_bytes());
            out.extend(((12 + n * BLOCK_SIZE) as u32).to_le_bytes());
            out.extend_from_slice(&raw[block * BLOCK_SIZE..(block + n) * BLOCK_SIZE]);
        } else {
            out.extend(0xCAC3_u16.to_le_bytes());
            out.extend(0_u16.to_le_bytes());
            out.extend((n as u32).to_le_bytes());
            out.extend(12_u32.to_le_bytes());
        }
        block += n;
    }
    out
}

/// 8KiB image holding only an erofs superblock
pub fn erofs_image(inos: u64, build_time: u64) -> Vec<u8> {
    let mut image = vec![0_u8; 8192];
    let sb = &mut image[0x400..0x480];
    sb[0..4].copy_from_slice(&0xE0F5E1E2_u32.to_le_bytes());
    sb[12] = 12;
    sb[14..16].copy_from_slice(&36_u16.to_le_bytes());
    sb[16..24].copy_from_slice(&inos.to_le_bytes());
    sb[24..32].copy_from_slice(&build_time.to_le_bytes());
    sb[36..40].copy_from_slice(&2_u32.to_le_bytes());
    sb[48..64].copy_from_slice(&[0xAB; 16]);
    sb[64..70].copy_from_slice(b"system");
    image
}

/// Records every invocation and fabricates the outputs the real tools would leave behind
#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<ToolInvocation>>,
    /// `(program file name, exit status)` to fail with
    pub fail: Option<(String, i32)>,
    /// Images `lpunpack` and `payload-dumper-go` leave in their output directory
    pub split: Vec<(String, Vec<u8>)>,
}

impl FakeRunner {
    pub fn failing(program: &str, status: i32) -> Self {
        Self { fail: Some((program.to_string(), status)), ..Self::default() }
    }

    pub fn with_split(split: Vec<(String, Vec<u8>)>) -> Self {
        Self { split, ..Self::default() }
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.name()).collect()
    }

    pub fn call(&self, program: &str) -> ToolInvocation {
        self.calls.lock().unwrap().iter().find(|c| c.name() == program).unwrap().clone()
    }

    fn fabricate(&self, invocation: &ToolInvocation) -> std::io::Result<()> {
        let args = invocation.arg_strings();
        let after = |flag: &str| {
            args.iter().position(|a| a == flag).map(|i| PathBuf::from(&args[i + 1]))
        };
        match invocation.name().as_str() {
            "brotli" => {
                let output = after("-o").unwrap();
                let input = args.iter().rev().nth(2).unwrap();
                fs::copy(input, output)?;
            }
            "img2simg" => {
                fs::copy(&args[0], &args[1])?;
            }
            "python3" => {
                let dir = after("-o").unwrap();
                let part = args[args.iter().position(|a| a == "-p").unwrap() + 1].clone();
                fs::write(dir.join(format!("{part}.new.dat")), b"data")?;
                fs::write(dir.join(format!("{part}.transfer.list")), "4\n1\n0\n0\nnew 2,0,1\n")?;
            }
            "lpunpack" => {
                let dir = PathBuf::from(&args[1]);
                for (name, image) in &self.split {
                    fs::write(dir.join(name), image)?;
                }
            }
            "payload-dumper-go" => {
                let dir = after("-o").unwrap();
                for (name, image) in &self.split {
                    fs::write(dir.join(name), image)?;
                }
            }
            "extract.erofs" => {
                let image = after("-i").unwrap();
                let out = after("-o").unwrap();
                let name = image.file_stem().unwrap().to_string_lossy().into_owned();
                let tree = out.join(&name);
                fs::create_dir_all(tree.join("etc"))?;
                fs::write(tree.join("etc/hosts"), b"127.0.0.1 localhost\n")?;
                std::os::unix::fs::symlink("/system/bin", tree.join("bin"))?;
                fs::create_dir_all(out.join("config"))?;
                fs::write(
                    out.join("config").join(format!("{name}_file_contexts")),
                    format!(
                        "/{name} u:object_r:system_file:s0\n\
                         /{name}/etc u:object_r:system_file:s0\n\
                         /{name}/etc/hosts u:object_r:system_file:s0\n\
                         /{name}/bin u:object_r:system_file:s0\n"
                    ),
                )?;
                fs::write(
                    out.join("config").join(format!("{name}_fs_config")),
                    format!(
                        "/ 0 0 0755\n\
                         {name} 0 0 0755\n\
                         {name}/etc 0 0 0755\n\
                         {name}/etc/hosts 0 0 0644\n\
                         {name}/bin 0 2000 0755\n"
                    ),
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl ToolRunner for FakeRunner {
    fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PartimgError> {
        self.calls.lock().unwrap().push(invocation.clone());
        if let Some((program, status)) = &self.fail {
            if invocation.name() == *program {
                return Ok(ToolOutput { status: Some(*status), output: "failed".to_string() });
            }
        }
        self.fabricate(invocation)?;
        Ok(ToolOutput::success())
    }
}

pub fn write(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path).unwrap().lines().map(str::to_string).collect()
}

fn find_runner() -> Option<String> {
    for (key, value) in std::env::vars() {
        if key.starts_with("CARGO_TARGET_") && key.ends_with("_RUNNER") && !value.is_empty() {
            return Some(value);
        }
    }
    None
}

/// Under cargo cross (qemu), find runner
pub fn get_base_command(base: &str) -> Command {
    let path = assert_cmd::cargo::cargo_bin(base);

    let mut cmd;
    if let Some(runner) = find_runner() {
        let mut runner = runner.split_whitespace();
        cmd = Command::new(runner.next().unwrap());
        for arg in runner {
            cmd.arg(arg);
        }
        cmd.arg(path);
    } else {
        cmd = Command::new(path);
    }
    cmd
}
