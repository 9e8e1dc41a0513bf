//! Recreate an ext4 image from an extracted tree and its metadata artifacts
//!
//! The filesystem itself is created by `mke2fs` and populated by `e2fsdroid`, both driven with
//! the figures recorded in the features artifact. The re-encode chain then runs as forward
//! [`DecodeStep`]s, with the same cleanup rule as decoding.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{PartimgError, PartitionFailure, Stage, StageContext};
use crate::partition::Partition;
use crate::pipeline::transform::{Transform, TransformSet};
use crate::pipeline::{DecodeStep, TransformKind};
use crate::synth::FeatureSheet;
use crate::tool::{ToolInvocation, ToolRunner};

/// Platform policy, relative to the output directory
pub const PLAT_FILE_CONTEXTS: &str = "system/system/etc/selinux/plat_file_contexts";

/// Vendor policy, relative to the output directory
pub const VENDOR_FILE_CONTEXTS: &str = "vendor/etc/selinux/vendor_file_contexts";

/// Arguments of the filesystem creation tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mke2fsParams {
    pub label: String,
    pub inode_count: u64,
    pub inode_size: u16,
    pub mount_point: String,
    pub reserved_percent: u64,
    pub uuid: String,
    pub block_size: u64,
    /// `partition_size / block_size`, rounded down
    pub block_count: u64,
    pub image: PathBuf,
}

impl Mke2fsParams {
    pub fn new(partition: &Partition, sheet: &FeatureSheet, image: PathBuf) -> Result<Self, PartimgError> {
        if sheet.block_size == 0 {
            return Err(PartimgError::Data(format!("{partition}: block size is 0")));
        }
        Ok(Self {
            label: partition.name().to_string(),
            inode_count: sheet.inode_count,
            inode_size: sheet.inode_size,
            mount_point: partition.mount_point(),
            reserved_percent: sheet.reserved,
            uuid: sheet.uuid.clone(),
            block_size: sheet.block_size,
            block_count: sheet.partition_size / sheet.block_size,
            image,
        })
    }

    pub fn invocation(&self, config: &Config) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(&config.tools.mke2fs)
            .args(["-O", "^has_journal", "-L"])
            .arg(&self.label)
            .arg("-N")
            .arg(self.inode_count.to_string())
            .arg("-I")
            .arg(self.inode_size.to_string())
            .arg("-M")
            .arg(&self.mount_point)
            .arg("-m")
            .arg(self.reserved_percent.to_string())
            .arg("-U")
            .arg(&self.uuid)
            .args(["-t", "ext4", "-b"])
            .arg(self.block_size.to_string())
            .arg(&self.image)
            .arg(self.block_count.to_string())
            .env("E2FSPROGS_FAKE_TIME", config.fake_time.to_string());
        if let Some(conf) = &config.tools.mke2fs_conf {
            invocation = invocation.env("MKE2FS_CONFIG", conf);
        }
        invocation
    }
}

/// Arguments of the label seeding tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelinuxSeed {
    /// Ownership and modes, left out when the artifact is missing
    pub fs_config: Option<PathBuf>,
    /// The partition's own contexts artifact
    pub contexts: PathBuf,
    /// Platform and vendor policy, consulted after `contexts`
    pub fallback_contexts: PathBuf,
    /// Tree copied into the image
    pub seed_dir: PathBuf,
    pub mount_point: String,
    pub image: PathBuf,
}

impl SelinuxSeed {
    pub fn new(config: &Config, partition: &Partition, image: PathBuf) -> Self {
        let fs_config = config.fs_config_path(partition.name());
        Self {
            fs_config: fs_config.exists().then_some(fs_config),
            contexts: config.contexts_path(partition.name()),
            fallback_contexts: config.global_contexts_path(),
            seed_dir: config.output_dir.join(partition.name()),
            mount_point: partition.mount_point(),
            image,
        }
    }

    pub fn invocation(&self, config: &Config) -> ToolInvocation {
        let fake_time = config.fake_time.to_string();
        let mut invocation =
            ToolInvocation::new(&config.tools.e2fsdroid).arg("-e").arg("-T").arg(&fake_time);
        if let Some(fs_config) = &self.fs_config {
            invocation = invocation.arg("-C").arg(fs_config);
        }
        invocation
            .arg("-S")
            .arg(&self.contexts)
            .arg("-S")
            .arg(&self.fallback_contexts)
            .arg("-f")
            .arg(&self.seed_dir)
            .arg("-a")
            .arg(&self.mount_point)
            .arg(&self.image)
            .env("E2FSPROGS_FAKE_TIME", fake_time)
    }
}

/// Drives filesystem creation and re-encoding for one build directory
pub struct RebuildPlanner {
    config: Config,
    runner: Arc<dyn ToolRunner>,
    transform: Box<dyn Transform>,
}

impl RebuildPlanner {
    pub fn new(config: &Config, runner: Arc<dyn ToolRunner>) -> Self {
        let transform = Box::new(TransformSet::new(config, runner.clone()));
        Self { config: config.clone(), runner, transform }
    }

    pub fn raw_path(&self, partition: &Partition) -> PathBuf {
        self.config.build_dir.join(format!("{}.img", partition.name()))
    }

    pub fn sparse_path(&self, partition: &Partition) -> PathBuf {
        self.config.build_dir.join(format!("{}.sparse", partition.name()))
    }

    pub fn new_dat_path(&self, partition: &Partition) -> PathBuf {
        self.config.build_dir.join(format!("{}.new.dat", partition.name()))
    }

    pub fn brotli_path(&self, partition: &Partition) -> PathBuf {
        self.config.build_dir.join(format!("{}.new.dat.br", partition.name()))
    }

    /// Partitions with both an extracted tree and a features artifact, sorted by name
    pub fn buildable(&self) -> Result<Vec<Partition>, PartimgError> {
        let mut out = vec![];
        if !self.config.output_dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.config.output_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && self.config.features_path(&name).exists() {
                out.push(Partition::new(name));
            }
        }
        out.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(out)
    }

    /// Concatenate the platform and vendor policies into the global contexts file
    ///
    /// An existing global file is kept.
    pub fn assemble_global_contexts(&self) -> Result<PathBuf, PartimgError> {
        let global = self.config.global_contexts_path();
        if global.exists() {
            return Ok(global);
        }
        let sources: Vec<PathBuf> = [PLAT_FILE_CONTEXTS, VENDOR_FILE_CONTEXTS]
            .iter()
            .map(|p| self.config.output_dir.join(p))
            .filter(|p| p.exists())
            .collect();
        if sources.is_empty() {
            return Err(PartimgError::Integrity {
                path: self.config.output_dir.join(PLAT_FILE_CONTEXTS),
                reason: "neither platform nor vendor file_contexts were extracted".to_string(),
            });
        }

        fs::create_dir_all(&self.config.config_dir)?;
        let mut writer = BufWriter::new(File::create(&global)?);
        for source in &sources {
            info!("appending {} to {}", source.display(), global.display());
            io::copy(&mut File::open(source)?, &mut writer)?;
        }
        writer.flush()?;
        Ok(global)
    }

    /// Creation parameters for `partition`, read from its features artifact
    pub fn plan(&self, partition: &Partition) -> Result<(Mke2fsParams, SelinuxSeed), PartimgError> {
        let tree = self.config.output_dir.join(partition.name());
        if !tree.is_dir() {
            return Err(PartimgError::Integrity {
                path: tree,
                reason: format!("{partition} has not been extracted"),
            });
        }
        let sheet = FeatureSheet::from_path(&self.config.features_path(partition.name()))?;
        let image = self.raw_path(partition);
        let params = Mke2fsParams::new(partition, &sheet, image.clone())?;
        let seed = SelinuxSeed::new(&self.config, partition, image);
        if seed.fs_config.is_none() {
            warn!("{partition}: no filesystem config, ownership comes from the tree");
        }
        Ok((params, seed))
    }

    /// Create and populate `build/<partition>.img`
    ///
    /// A failure of either tool removes the half-written image.
    pub fn build_raw(&self, partition: &Partition) -> Result<PathBuf, PartitionFailure> {
        let name = partition.name();
        let (params, seed) = self.plan(partition).stage(name, Stage::Synthesize)?;

        // mke2fs keeps trailing data, such as a verity section, of an existing file
        fs::create_dir_all(&self.config.build_dir)
            .and_then(|()| File::create(&params.image).map(drop))
            .map_err(PartimgError::from)
            .stage(name, Stage::FilesystemCreate)?;

        let created = (|| {
            info!("{partition}: creating {} blocks of {} bytes", params.block_count, params.block_size);
            self.runner.run(&params.invocation(&self.config))?;
            self.runner.run(&seed.invocation(&self.config))
        })();

        if let Err(e) = created {
            error!("{partition}: filesystem creation failed, removing {}", params.image.display());
            if let Err(rm) = fs::remove_file(&params.image) {
                warn!("could not remove {}: {rm}", params.image.display());
            }
            return Err(PartitionFailure::new(name, Stage::FilesystemCreate, e));
        }
        Ok(params.image)
    }

    /// Turn `build/<partition>.img` into `build/<partition>.sparse`
    pub fn encode_sparse(&self, partition: &Partition) -> Result<PathBuf, PartitionFailure> {
        self.encode(
            partition,
            TransformKind::SparseEncode,
            self.raw_path(partition),
            self.sparse_path(partition),
        )
    }

    /// Turn `build/<partition>.sparse` into `build/<partition>.new.dat.br`
    pub fn encode_brotli(&self, partition: &Partition) -> Result<PathBuf, PartitionFailure> {
        self.encode(
            partition,
            TransformKind::TransferListEncode,
            self.sparse_path(partition),
            self.new_dat_path(partition),
        )?;
        self.encode(
            partition,
            TransformKind::BrotliEncode,
            self.new_dat_path(partition),
            self.brotli_path(partition),
        )
    }

    fn encode(
        &self,
        partition: &Partition,
        kind: TransformKind,
        input: PathBuf,
        output: PathBuf,
    ) -> Result<PathBuf, PartitionFailure> {
        let name = partition.name();
        if !input.exists() {
            return Err(PartitionFailure::new(
                name,
                Stage::Encode(kind),
                PartimgError::Integrity { path: input, reason: format!("{kind} needs it") },
            ));
        }
        let step = DecodeStep::new(kind, vec![input], output);
        step.execute(self.transform.as_ref()).stage(name, Stage::Encode(kind))?;
        Ok(step.output)
    }
}
