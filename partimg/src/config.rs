//! Project directories, external tool paths and tunables

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::PartimgError;

/// `2009-01-01 00:00:00 UTC`, stamped on every rebuilt image
pub const DEFAULT_FAKE_TIME: i64 = 1_230_768_000;

/// Cache size handed to the transfer-list encoder, 384MiB
pub const DEFAULT_TRANSFER_CACHE: u64 = 402_653_184;

pub const DEFAULT_BROTLI_QUALITY: u32 = 6;

/// Header bytes read from each file by the classifier
pub const DEFAULT_PROBE_LEN: usize = 64 * 1024;

#[rustfmt::skip]
const DEFAULT_PARTITIONS: [&str; 13] = [
    "system", "system_ext", "vendor", "product", "odm", "my_product", "my_engineering",
    "my_stock", "my_heytap", "my_company", "my_carrier", "my_region", "my_preload",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extracted firmware files, also where archive members are taken in
    pub source_dir: PathBuf,
    /// Metadata artifacts
    pub config_dir: PathBuf,
    /// Extracted trees, one directory per partition
    pub output_dir: PathBuf,
    /// Rebuilt images
    pub build_dir: PathBuf,

    pub tools: ToolPaths,

    /// Partitions picked up by source discovery, `super` is always included
    pub partitions: Vec<String>,
    /// Build time written into rebuilt filesystems, in seconds since the epoch
    pub fake_time: i64,
    pub transfer_cache: u64,
    pub brotli_quality: u32,
    pub probe_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub brotli: PathBuf,
    pub lpunpack: PathBuf,
    /// Dumps `payload.bin` of A/B firmware into partition images
    pub payload_dumper: PathBuf,
    pub extract_erofs: PathBuf,
    pub img2simg: PathBuf,
    pub img2sdat: PathBuf,
    /// Interpreter for `img2sdat`, which is a python script
    pub python: PathBuf,
    pub mke2fs: PathBuf,
    /// `MKE2FS_CONFIG` for `mke2fs`, unset when `None`
    pub mke2fs_conf: Option<PathBuf>,
    pub e2fsdroid: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            brotli: "brotli".into(),
            lpunpack: "lpunpack".into(),
            payload_dumper: "payload-dumper-go".into(),
            extract_erofs: "extract.erofs".into(),
            img2simg: "img2simg".into(),
            img2sdat: "img2sdat.py".into(),
            python: "python3".into(),
            mke2fs: "mke2fs".into(),
            mke2fs_conf: None,
            e2fsdroid: "e2fsdroid".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_project(".")
    }
}

impl Config {
    /// Default layout under `root`: `source/`, `config/`, `output/` and `build/`
    pub fn with_project(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            source_dir: root.join("source"),
            config_dir: root.join("config"),
            output_dir: root.join("output"),
            build_dir: root.join("build"),
            tools: ToolPaths::default(),
            partitions: DEFAULT_PARTITIONS.iter().map(|p| p.to_string()).collect(),
            fake_time: DEFAULT_FAKE_TIME,
            transfer_cache: DEFAULT_TRANSFER_CACHE,
            brotli_quality: DEFAULT_BROTLI_QUALITY,
            probe_len: DEFAULT_PROBE_LEN,
        }
    }

    /// Load from a TOML file, missing keys take their defaults
    pub fn from_path(path: &Path) -> Result<Self, PartimgError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        debug!("loaded {}: {config:?}", path.display());
        Ok(config)
    }

    pub fn contexts_path(&self, partition: &str) -> PathBuf {
        self.config_dir.join(format!("{partition}_file_contexts.txt"))
    }

    pub fn fs_config_path(&self, partition: &str) -> PathBuf {
        self.config_dir.join(format!("{partition}_filesystem_config.txt"))
    }

    pub fn features_path(&self, partition: &str) -> PathBuf {
        self.config_dir.join(format!("{partition}_filesystem_features.txt"))
    }

    /// Platform and vendor policies concatenated
    pub fn global_contexts_path(&self) -> PathBuf {
        self.config_dir.join("file_contexts.txt")
    }
}
