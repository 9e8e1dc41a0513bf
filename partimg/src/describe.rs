//! Extract a decoded image and write its metadata artifacts

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::erofs::ErofsSuperBlock;
use crate::error::{PartimgError, PartitionFailure, Stage, StageContext};
use crate::ext4::Ext4Volume;
use crate::introspect::{extract_tree, FilesystemFeatures, PartitionSizeRule, Walk, WalkCounts};
use crate::kinds::FilesystemKind;
use crate::partition::Partition;
use crate::pipeline::PartitionImage;
use crate::synth::{rederive, synthesize, Artifacts};
use crate::tool::{ToolInvocation, ToolRunner};

/// Result of describing one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub partition: String,
    pub filesystem: FilesystemKind,
    /// Where the described image ended up, it may have been renamed for an extraction tool
    pub image: PathBuf,
    /// Host directory holding the extracted tree
    pub tree: PathBuf,
    /// Known only for walks done in-process
    pub counts: Option<WalkCounts>,
    pub artifacts: Artifacts,
}

pub struct Describer {
    config: Config,
    runner: Arc<dyn ToolRunner>,
}

impl Describer {
    pub fn new(config: &Config, runner: Arc<dyn ToolRunner>) -> Self {
        Self { config: config.clone(), runner }
    }

    pub fn describe(&self, image: &PartitionImage) -> Result<Description, PartitionFailure> {
        let description = match image.filesystem {
            FilesystemKind::Ext4 => self.describe_ext4(image)?,
            FilesystemKind::Erofs => self.describe_erofs(image)?,
            other => {
                return Err(PartitionFailure::new(
                    &image.name,
                    Stage::Introspect,
                    PartimgError::Format(format!("{other} images can't be described")),
                ))
            }
        };

        // only intermediate images are ours to remove
        if !image.chain.is_empty() {
            debug!("removing {}", description.image.display());
            fs::remove_file(&description.image)
                .map_err(PartimgError::from)
                .stage(&image.name, Stage::Extract)?;
        }
        Ok(description)
    }

    /// Walk and extract in-process, the partition size is the image size
    fn describe_ext4(&self, image: &PartitionImage) -> Result<Description, PartitionFailure> {
        let name = image.name.as_str();
        let partition = Partition::new(name);
        let file = File::open(&image.path).map_err(PartimgError::from).stage(name, Stage::Introspect)?;
        let mut volume = Ext4Volume::open(BufReader::new(file)).stage(name, Stage::Introspect)?;

        let mut walk = Walk::new(&mut volume);
        let records = walk.by_ref().collect::<Result<Vec<_>, _>>().stage(name, Stage::Introspect)?;
        let counts = walk.counts();
        info!(
            "{name}: {} directories, {} files, {} symlinks",
            counts.directories, counts.files, counts.symlinks
        );

        let size = PartitionSizeRule::ImageSize(image.size).resolve().stage(name, Stage::Introspect)?;
        let features = FilesystemFeatures::from_ext4(volume.superblock(), size);
        let artifacts = synthesize(&partition, &records, &features);
        artifacts.write(&self.config, &partition).stage(name, Stage::Synthesize)?;

        let tree = self.config.output_dir.join(name);
        extract_tree(&mut volume, &records, &tree).stage(name, Stage::Extract)?;

        Ok(Description {
            partition: name.to_string(),
            filesystem: FilesystemKind::Ext4,
            image: image.path.clone(),
            tree,
            counts: Some(counts),
            artifacts,
        })
    }

    /// Extract with `extract.erofs`, then re-derive its metadata against the host tree
    fn describe_erofs(&self, image: &PartitionImage) -> Result<Description, PartitionFailure> {
        let name = image.name.as_str();
        let partition = Partition::new(name);
        let sb = File::open(&image.path)
            .map_err(PartimgError::from)
            .and_then(|f| ErofsSuperBlock::from_reader(BufReader::new(f)))
            .stage(name, Stage::Introspect)?;

        let image_path = self.tool_named_image(image).stage(name, Stage::Extract)?;
        let output = &self.config.output_dir;
        fs::create_dir_all(output).map_err(PartimgError::from).stage(name, Stage::Extract)?;
        let invocation = ToolInvocation::new(&self.config.tools.extract_erofs)
            .arg("-i")
            .arg(&image_path)
            .arg("-o")
            .arg(output)
            .args(["-f", "-x"]);
        self.runner.run(&invocation).stage(name, Stage::Extract)?;

        let tree = output.join(name);
        let contexts_path = output.join("config").join(format!("{name}_file_contexts"));
        let fs_config_path = output.join("config").join(format!("{name}_fs_config"));
        let contexts = read_companion(&contexts_path).stage(name, Stage::Synthesize)?;
        let fs_config = read_companion(&fs_config_path).stage(name, Stage::Synthesize)?;

        let size = PartitionSizeRule::HostTree(tree.clone()).resolve().stage(name, Stage::Synthesize)?;
        let features = FilesystemFeatures::from_erofs(&sb, size);
        let artifacts =
            rederive(&partition, &contexts, &fs_config, &tree, &features).stage(name, Stage::Synthesize)?;
        artifacts.write(&self.config, &partition).stage(name, Stage::Synthesize)?;

        Ok(Description {
            partition: name.to_string(),
            filesystem: FilesystemKind::Erofs,
            image: image_path,
            tree,
            counts: None,
            artifacts,
        })
    }

    /// `extract.erofs` names its output after the image file, so give it `<partition>.img`
    fn tool_named_image(&self, image: &PartitionImage) -> Result<PathBuf, PartimgError> {
        let wanted = format!("{}.img", image.name);
        if image.path.file_name().is_some_and(|n| n == wanted.as_str()) {
            return Ok(image.path.clone());
        }
        let target = image.path.with_file_name(&wanted);
        if target.exists() {
            return Err(PartimgError::Data(format!(
                "{} already exists, not renaming {} over it",
                target.display(),
                image.path.display()
            )));
        }
        fs::rename(&image.path, &target)?;
        debug!("renamed {} to {}", image.path.display(), target.display());
        Ok(target)
    }
}

fn read_companion(path: &Path) -> Result<String, PartimgError> {
    fs::read_to_string(path).map_err(|e| PartimgError::Integrity {
        path: path.to_path_buf(),
        reason: format!("extraction left no metadata: {e}"),
    })
}
