//! Decode chains turning a distributed partition into a raw filesystem image
//!
//! A chain is planned from a [`Classification`] and run one [`DecodeStep`] at a time. Each step
//! removes its inputs only once its output exists. When a chain ends in bytes whose filesystem
//! was hidden by the container, the output is classified again and a follow-up chain is planned.

pub mod transfer_list;
pub mod transform;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::classify::{
    chunk_base, discover, Classification, Classifier, PartitionSource, SourceLayout,
};
use crate::config::Config;
use crate::error::{PartimgError, PartitionFailure, Stage, StageContext};
use crate::kinds::{ContainerKind, FilesystemKind};
use crate::tool::ToolRunner;
use self::transform::{Transform, TransformSet};

/// Deepest nesting of containers followed before giving up
const MAX_DECODE_DEPTH: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransformKind {
    GzipDecompress,
    ZstdDecompress,
    BrotliDecompress,
    TransferListReplay,
    ChunkMerge,
    SparseToRaw,
    PartitionTableSplit,
    PayloadDump,
    SparseEncode,
    TransferListEncode,
    BrotliEncode,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GzipDecompress => "gzip-decompress",
            Self::ZstdDecompress => "zstd-decompress",
            Self::BrotliDecompress => "brotli-decompress",
            Self::TransferListReplay => "transfer-list-replay",
            Self::ChunkMerge => "chunk-merge",
            Self::SparseToRaw => "sparse-to-raw",
            Self::PartitionTableSplit => "partition-table-split",
            Self::PayloadDump => "payload-dump",
            Self::SparseEncode => "sparse-encode",
            Self::TransferListEncode => "transfer-list-encode",
            Self::BrotliEncode => "brotli-encode",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeStep {
    pub kind: TransformKind,
    pub inputs: Vec<PathBuf>,
    /// A file, or a directory for [`TransformKind::PartitionTableSplit`] and
    /// [`TransformKind::PayloadDump`]
    pub output: PathBuf,
}

impl DecodeStep {
    pub fn new(kind: TransformKind, inputs: Vec<PathBuf>, output: PathBuf) -> Self {
        Self { kind, inputs, output }
    }

    /// Apply the step, then remove its inputs
    ///
    /// Inputs are left in place when the transform fails or no output appeared.
    pub fn execute(&self, transform: &dyn Transform) -> Result<(), PartimgError> {
        transform.apply(self.kind, &self.inputs, &self.output)?;
        if !self.output.exists() {
            return Err(PartimgError::Integrity {
                path: self.output.clone(),
                reason: format!("{} produced no output", self.kind),
            });
        }
        for input in &self.inputs {
            debug!("removing {}", input.display());
            match fs::remove_file(input) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Order `<name>_<N>.img` chunk files by `N`, numerically
pub fn order_chunks(paths: &[PathBuf]) -> Result<Vec<PathBuf>, PartimgError> {
    let mut keyed = paths
        .iter()
        .map(|path| {
            let index = path
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| chunk_base(n).is_some())
                .and_then(|n| n.strip_suffix(".img"))
                .and_then(|n| n.rsplit_once('_'))
                .and_then(|(_, i)| i.parse::<u64>().ok())
                .ok_or_else(|| {
                    PartimgError::Format(format!("{} is not a numbered chunk", path.display()))
                })?;
            Ok((index, path.clone()))
        })
        .collect::<Result<Vec<_>, PartimgError>>()?;
    keyed.sort_by_key(|(index, _)| *index);
    Ok(keyed.into_iter().map(|(_, path)| path).collect())
}

/// Steps that remove every container layer visible in `class`
///
/// Intermediate files are written next to the source. A chain ending in a filesystem of
/// [`FilesystemKind::Unknown`] needs its output classified again.
pub fn plan_chain(
    source: &PartitionSource,
    class: Classification,
) -> Result<Vec<DecodeStep>, PartimgError> {
    let inputs = source.inputs();
    let dir = inputs
        .first()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let name = &source.name;
    let mut used = inputs.clone();
    let mut out = |suffix: &str| {
        let mut path = dir.join(format!("{name}.{suffix}"));
        let mut n = 1;
        while used.contains(&path) {
            path = dir.join(format!("{name}.{n}.{suffix}"));
            n += 1;
        }
        used.push(path.clone());
        path
    };

    let mut steps = vec![];
    let mut current = match (&source.layout, class.container) {
        (SourceLayout::Single(path), ContainerKind::Raw) => path.clone(),
        (SourceLayout::Single(path), ContainerKind::Sparse) => {
            let output = out("raw.img");
            steps.push(DecodeStep::new(TransformKind::SparseToRaw, vec![path.clone()], output.clone()));
            output
        }
        (SourceLayout::Single(path), ContainerKind::Gzip) => {
            let output = out("img");
            steps.push(DecodeStep::new(TransformKind::GzipDecompress, vec![path.clone()], output.clone()));
            output
        }
        (SourceLayout::Single(path), ContainerKind::Zstd) => {
            let output = out("img");
            steps.push(DecodeStep::new(TransformKind::ZstdDecompress, vec![path.clone()], output.clone()));
            output
        }
        (SourceLayout::TransferList { data, list }, ContainerKind::Brotli) => {
            let new_dat = out("new.dat");
            steps.push(DecodeStep::new(TransformKind::BrotliDecompress, vec![data.clone()], new_dat.clone()));
            let output = out("img");
            steps.push(DecodeStep::new(
                TransformKind::TransferListReplay,
                vec![new_dat, list.clone()],
                output.clone(),
            ));
            output
        }
        (SourceLayout::TransferList { data, list }, ContainerKind::TransferList) => {
            let output = out("img");
            steps.push(DecodeStep::new(
                TransformKind::TransferListReplay,
                vec![data.clone(), list.clone()],
                output.clone(),
            ));
            output
        }
        (SourceLayout::Chunks(paths), ContainerKind::SparseChunks) => {
            let merged = out("sparse");
            steps.push(DecodeStep::new(TransformKind::ChunkMerge, order_chunks(paths)?, merged.clone()));
            let output = out("raw.img");
            steps.push(DecodeStep::new(TransformKind::SparseToRaw, vec![merged], output.clone()));
            output
        }
        (layout, container) => {
            return Err(PartimgError::Format(format!(
                "{name}: {container} container does not fit {layout:?}"
            )))
        }
    };

    if class.filesystem == FilesystemKind::Super {
        let parts = dir.join(format!("{name}_partitions"));
        steps.push(DecodeStep::new(TransformKind::PartitionTableSplit, vec![current], parts.clone()));
        current = parts;
    }
    debug!(
        "{name}: planned {:?} ending at {}",
        steps.iter().map(|s| s.kind).collect::<Vec<_>>(),
        current.display()
    );
    Ok(steps)
}

/// Decoded partition image, every container layer removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionImage {
    pub name: String,
    pub path: PathBuf,
    /// Outermost container of the source
    pub container: ContainerKind,
    /// [`FilesystemKind::Ext4`] or [`FilesystemKind::Erofs`]
    pub filesystem: FilesystemKind,
    pub size: u64,
    /// Steps run to get here, outermost first
    pub chain: Vec<TransformKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Image(PartitionImage),
    /// Logical partitions found in a partition table, each to be decoded on its own
    Split(Vec<PartitionSource>),
}

pub struct Pipeline {
    classifier: Classifier,
    transform: Box<dyn Transform>,
    partitions: Vec<String>,
}

impl Pipeline {
    pub fn new(config: &Config, runner: Arc<dyn ToolRunner>) -> Self {
        Self::with_transform(config, Box::new(TransformSet::new(config, runner)))
    }

    pub fn with_transform(config: &Config, transform: Box<dyn Transform>) -> Self {
        Self {
            classifier: Classifier::new(config),
            transform,
            partitions: config.partitions.clone(),
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Classification and first chain of `source`, without running anything
    pub fn plan(
        &self,
        source: &PartitionSource,
    ) -> Result<(Classification, Vec<DecodeStep>), PartitionFailure> {
        let name = source.name.as_str();
        let class = self.classifier.classify_source(source).stage(name, Stage::Classify)?;
        let steps = plan_chain(source, class).stage(name, Stage::Classify)?;
        Ok((class, steps))
    }

    pub fn decode(&self, source: &PartitionSource) -> Result<Decoded, PartitionFailure> {
        let name = source.name.as_str();
        let (first, mut steps) = self.plan(source)?;
        let mut class = first;
        let mut chain = vec![];
        let mut current = source.clone();

        for _ in 0..MAX_DECODE_DEPTH {
            for step in &steps {
                info!("{name}: {}", step.kind);
                step.execute(self.transform.as_ref()).stage(name, Stage::Decode(step.kind))?;
                chain.push(step.kind);
            }
            let end = steps.last().map(|s| s.output.clone());

            if class.filesystem == FilesystemKind::Super {
                let Some(dir) = end else {
                    return Err(PartitionFailure::new(
                        name,
                        Stage::Classify,
                        PartimgError::Format("partition table without a split step".to_string()),
                    ));
                };
                let parts = discover(&dir, &self.partitions).stage(name, Stage::Classify)?;
                info!("{name}: {} logical partitions in {}", parts.len(), dir.display());
                return Ok(Decoded::Split(parts));
            }

            if let Some(path) = end {
                current = PartitionSource::single(name, path);
            }
            if class.filesystem != FilesystemKind::Unknown {
                let SourceLayout::Single(path) = &current.layout else {
                    return Err(PartitionFailure::new(
                        name,
                        Stage::Classify,
                        PartimgError::Format("decode chain ended without an image".to_string()),
                    ));
                };
                let size = fs::metadata(path).map_err(PartimgError::from).stage(name, Stage::Classify)?.len();
                return Ok(Decoded::Image(PartitionImage {
                    name: name.to_string(),
                    path: path.clone(),
                    container: first.container,
                    filesystem: class.filesystem,
                    size,
                    chain,
                }));
            }

            if steps.is_empty() {
                break;
            }
            (class, steps) = self.plan(&current)?;
            debug!("{name}: reclassified as {class:?}");
        }

        warn!("{name}: gave up after {MAX_DECODE_DEPTH} container layers");
        Err(PartitionFailure::new(
            name,
            Stage::Classify,
            PartimgError::Format(format!("{name}: no filesystem found inside the container")),
        ))
    }
}
