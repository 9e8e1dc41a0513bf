//! Contexts, config and features artifacts
//!
//! The three text files are what a rebuild consumes: security labels per path, ownership and
//! mode per path, and the superblock figures of the image to recreate. Contexts and config
//! lines are deduplicated and sorted, so identical input always gives identical bytes.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use chrono::DateTime;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::PartimgError;
use crate::introspect::{FilesystemFeatures, InodeRecord};
use crate::kinds::FilesystemKind;
use crate::partition::{Partition, PartitionKind, ROOTFS_LABEL};

/// Inodes added on top of the source image's count
pub const INODE_HEADROOM: u64 = 2000;

/// Inode size of every rebuilt image
pub const REBUILD_INODE_SIZE: u16 = 256;

/// Block size of every rebuilt image
pub const REBUILD_BLOCK_SIZE: u64 = 4096;

const LABEL_WIDTH: usize = 27;

const UUID_KEY: &str = "Filesystem UUID";
const MAGIC_KEY: &str = "Filesystem magic number";
const INODE_SIZE_KEY: &str = "Inode size";
const RESERVED_KEY: &str = "Reserved block count";
const BLOCK_SIZE_KEY: &str = "Block size";
const INODE_COUNT_KEY: &str = "Inode count";
const CREATED_KEY: &str = "Filesystem created";
const PARTITION_SIZE_KEY: &str = "Partition Size";

/// The three artifacts of one partition, one entry per line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub contexts: Vec<String>,
    pub config: Vec<String>,
    pub features: Vec<String>,
}

impl Artifacts {
    /// Overwrite `<partition>_file_contexts.txt`, `<partition>_filesystem_config.txt` and
    /// `<partition>_filesystem_features.txt` under the config directory
    pub fn write(&self, config: &Config, partition: &Partition) -> Result<(), PartimgError> {
        fs::create_dir_all(&config.config_dir)?;
        let name = partition.name();
        for (path, lines) in [
            (config.contexts_path(name), &self.contexts),
            (config.fs_config_path(name), &self.config),
            (config.features_path(name), &self.features),
        ] {
            fs::write(&path, render(lines))?;
            debug!("wrote {} lines to {}", lines.len(), path.display());
        }
        info!("{name}: wrote metadata to {}", config.config_dir.display());
        Ok(())
    }
}

/// Newline-terminated lines
fn render(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// `.` and `+` escaped, nothing else changed
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '.' || c == '+' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Drop repeated lines, keeping the first, then sort bytewise
fn canonical(lines: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out: Vec<String> = lines.into_iter().filter(|l| seen.insert(l.clone())).collect();
    out.sort();
    out
}

/// Build every artifact from a live walk
pub fn synthesize(
    partition: &Partition,
    records: &[InodeRecord],
    features: &FilesystemFeatures,
) -> Artifacts {
    let system = partition.kind() == PartitionKind::System;
    let base = partition.base_name();
    let mut contexts = Vec::with_capacity(records.len() + 3);
    let mut config = Vec::with_capacity(records.len() + 2);

    for record in records {
        let (context_path, config_path) = if system {
            (record.path.clone(), record.path.trim_start_matches('/').to_string())
        } else {
            (format!("/{base}{}", record.path), format!("{base}{}", record.path))
        };

        if record.label.is_empty() {
            warn!("{partition}: {} has no security label, leaving it out of the contexts", record.path);
        } else {
            contexts.push(format!("{} {}", escape_path(&context_path), record.label));
        }

        let mut line = format!("{config_path} {} {} {}", record.uid, record.gid, record.mode);
        if let Some(target) = &record.symlink_target {
            line.push(' ');
            line.push_str(target);
        }
        config.push(line);
    }

    finish(partition, contexts, config, features)
}

/// Root entries, then dedup and sort
fn finish(
    partition: &Partition,
    mut contexts: Vec<String>,
    mut config: Vec<String>,
    features: &FilesystemFeatures,
) -> Artifacts {
    let base = partition.base_name();
    let profile = partition.profile();

    contexts.push(format!("/ {}", profile.root_label));
    contexts.push(format!("/{base}(/.*)? {}", profile.root_label));
    let lost_found = if partition.kind() == PartitionKind::System {
        "/lost+found".to_string()
    } else {
        format!("/{base}/lost+found")
    };
    contexts.push(format!("{} {ROOTFS_LABEL}", escape_path(&lost_found)));

    config.push(format!("/ 0 {} 0755", profile.root_gid));
    config.push(format!("{base} 0 {} 0755", profile.root_gid));

    Artifacts {
        contexts: canonical(contexts),
        config: canonical(config),
        features: FeatureSheet::from_features(features).lines(),
    }
}

/// Contexts lines of an extraction tool, made partition-root-relative
///
/// Only lines under `/<partition>/` are kept. They are already escaped.
pub fn rederive_contexts(partition: &Partition, text: &str) -> Vec<String> {
    let prefix = format!("/{}", partition.base_name());
    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            let rest = line.strip_prefix(&prefix)?;
            rest.starts_with('/').then(|| rest.to_string())
        })
        .collect()
}

/// Config lines of an extraction tool, made partition-root-relative
///
/// `<partition>/` is stripped from each path and lines without it are dropped. Symlink targets
/// are read back from the extracted tree under `host_root`.
pub fn rederive_config(
    partition: &Partition,
    text: &str,
    host_root: &Path,
) -> Result<Vec<String>, PartimgError> {
    let prefix = format!("{}/", partition.base_name());
    let mut out = vec![];
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [path, uid, gid, mode, ..] = fields[..] else {
            if !line.trim().is_empty() {
                warn!("{partition}: skipping config line {line:?}");
            }
            continue;
        };
        let Some(path) = path.strip_prefix(&prefix).filter(|p| !p.is_empty()) else {
            continue;
        };

        let host = host_root.join(path);
        let target = match fs::symlink_metadata(&host) {
            Ok(meta) if meta.file_type().is_symlink() => Some(fs::read_link(&host)?),
            _ => None,
        };
        match target {
            Some(target) => out.push(format!("{path} {uid} {gid} {mode} {}", target.display())),
            None => out.push(format!("{path} {uid} {gid} {mode}")),
        }
    }
    Ok(out)
}

/// Build every artifact from an extraction tool's output
pub fn rederive(
    partition: &Partition,
    contexts_text: &str,
    config_text: &str,
    host_root: &Path,
    features: &FilesystemFeatures,
) -> Result<Artifacts, PartimgError> {
    let contexts = rederive_contexts(partition, contexts_text);
    let config = rederive_config(partition, config_text, host_root)?;
    Ok(finish(partition, contexts, config, features))
}

/// Contents of a features artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSheet {
    pub uuid: String,
    pub magic: Option<String>,
    pub inode_size: u16,
    pub reserved: u64,
    pub block_size: u64,
    /// Headroom already included
    pub inode_count: u64,
    pub created: Option<String>,
    pub partition_size: u64,
}

impl FeatureSheet {
    pub fn from_features(features: &FilesystemFeatures) -> Self {
        let uuid = match features.kind {
            FilesystemKind::Erofs => format!("{:X}", features.uuid.hyphenated()),
            _ => features.uuid.hyphenated().to_string(),
        };
        let created = DateTime::from_timestamp(features.build_time, 0)
            .map(|t| t.format("%a %b %-d %H:%M:%S %Y").to_string());
        Self {
            uuid,
            magic: Some(format!("{:#x}", features.magic)),
            inode_size: REBUILD_INODE_SIZE,
            reserved: features.reserved_blocks,
            block_size: REBUILD_BLOCK_SIZE,
            inode_count: features.inode_count + INODE_HEADROOM,
            created,
            partition_size: features.partition_size,
        }
    }

    /// Artifact lines, in their fixed order
    pub fn lines(&self) -> Vec<String> {
        let mut out = vec![line(UUID_KEY, &self.uuid)];
        if let Some(magic) = &self.magic {
            out.push(line(MAGIC_KEY, magic));
        }
        out.push(line(INODE_SIZE_KEY, &self.inode_size));
        out.push(line(RESERVED_KEY, &self.reserved));
        out.push(line(BLOCK_SIZE_KEY, &self.block_size));
        out.push(line(INODE_COUNT_KEY, &self.inode_count));
        if let Some(created) = &self.created {
            out.push(line(CREATED_KEY, created));
        }
        out.push(line(PARTITION_SIZE_KEY, &self.partition_size));
        out
    }

    /// Read a features artifact back, keys are matched up to the first `:`
    pub fn parse(text: &str) -> Result<Self, PartimgError> {
        let mut values = BTreeMap::new();
        for l in text.lines() {
            if let Some((key, value)) = l.split_once(':') {
                values.entry(key.trim()).or_insert_with(|| value.trim());
            }
        }

        let text_of = |key: &str| {
            values
                .get(key)
                .map(|v| v.to_string())
                .ok_or_else(|| PartimgError::Data(format!("features have no {key:?}")))
        };
        let number_of = |key: &str| -> Result<u64, PartimgError> {
            let value = text_of(key)?;
            value.parse().map_err(|_| PartimgError::Data(format!("{key:?} is not a number: {value:?}")))
        };

        let inode_size = number_of(INODE_SIZE_KEY)?;
        Ok(Self {
            uuid: text_of(UUID_KEY)?,
            magic: text_of(MAGIC_KEY).ok(),
            inode_size: u16::try_from(inode_size)
                .map_err(|_| PartimgError::Data(format!("inode size {inode_size} is out of range")))?,
            reserved: number_of(RESERVED_KEY)?,
            block_size: number_of(BLOCK_SIZE_KEY)?,
            inode_count: number_of(INODE_COUNT_KEY)?,
            created: text_of(CREATED_KEY).ok(),
            partition_size: number_of(PARTITION_SIZE_KEY)?,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, PartimgError> {
        Self::parse(&fs::read_to_string(path)?)
    }
}

fn line(key: &str, value: &dyn std::fmt::Display) -> String {
    format!("{:<LABEL_WIDTH$}{value}", format!("{key}:"))
}
