//! Errors

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::TransformKind;

#[derive(Error, Debug)]
pub enum PartimgError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// No container or filesystem signature matched
    #[error("unrecognized format: {0}")]
    Format(String),

    /// An artifact that must accompany the input is missing
    #[error("missing companion artifact {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    /// External capability exited non-zero
    #[error("{tool} exited with status {status}")]
    ToolFailure { tool: String, status: i32, output: String },

    /// External capability was killed by a signal, usually an interrupt from the terminal
    #[error("{0} was interrupted")]
    Interrupted(String),

    /// Required metadata field was unreadable or inconsistent
    #[error("data error: {0}")]
    Data(String),
}

impl PartimgError {
    /// `true` if this error must stop every remaining partition, not only the current one
    pub fn aborts_run(&self) -> bool {
        matches!(self, Self::ToolFailure { .. } | Self::Interrupted(_))
    }

    /// Process exit code reported by the binaries
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ToolFailure { tool, .. } if is_mkfs_tool(tool) => 4,
            _ => 1,
        }
    }
}

fn is_mkfs_tool(tool: &str) -> bool {
    let name = tool.rsplit('/').next().unwrap_or(tool);
    name.starts_with("mke2fs") || name.starts_with("e2fsdroid")
}

/// Point in a partition's processing where a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Taking partition files out of a firmware archive
    Intake,
    Classify,
    Decode(TransformKind),
    Introspect,
    Extract,
    Synthesize,
    FilesystemCreate,
    Encode(TransformKind),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intake => write!(f, "intake"),
            Self::Classify => write!(f, "classify"),
            Self::Decode(kind) => write!(f, "decode/{kind}"),
            Self::Introspect => write!(f, "introspect"),
            Self::Extract => write!(f, "extract"),
            Self::Synthesize => write!(f, "synthesize"),
            Self::FilesystemCreate => write!(f, "filesystem-create"),
            Self::Encode(kind) => write!(f, "encode/{kind}"),
        }
    }
}

/// [`PartimgError`] tagged with the partition and stage it happened in
#[derive(Error, Debug)]
#[error("{partition} [{stage}]: {source}")]
pub struct PartitionFailure {
    pub partition: String,
    pub stage: Stage,
    #[source]
    pub source: PartimgError,
}

impl PartitionFailure {
    pub fn new(partition: impl Into<String>, stage: Stage, source: PartimgError) -> Self {
        Self { partition: partition.into(), stage, source }
    }
}

/// Attach partition and stage context to a fallible step
pub(crate) trait StageContext<T> {
    fn stage(self, partition: &str, stage: Stage) -> Result<T, PartitionFailure>;
}

impl<T> StageContext<T> for Result<T, PartimgError> {
    fn stage(self, partition: &str, stage: Stage) -> Result<T, PartitionFailure> {
        self.map_err(|e| PartitionFailure::new(partition, stage, e))
    }
}
