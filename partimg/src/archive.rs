//! Firmware archive intake
//!
//! Pulls the members that make up partitions out of a firmware zip into the source directory,
//! flattened to their file names, so [`discover`](crate::classify::discover) sees the same files
//! as for a hand-extracted firmware. A `payload.bin` is dumped into partition images by an
//! external tool.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, trace};
use zip::ZipArchive;

use crate::classify::{allowed, chunk_base};
use crate::config::Config;
use crate::error::{PartimgError, PartitionFailure, Stage, StageContext};
use crate::partition::partition_name;
use crate::pipeline::transform::{Transform, TransformSet};
use crate::pipeline::{DecodeStep, TransformKind};
use crate::tool::ToolRunner;

pub const PAYLOAD_NAME: &str = "payload.bin";

/// Boot chain images, copied without being unpacked
const PASSTHROUGH_PREFIXES: [&str; 3] = ["vbmeta", "boot", "dtbo"];

/// File name endings of every partition encoding source discovery understands
const PARTITION_SUFFIXES: [&str; 6] =
    [".new.dat.br", ".new.dat", ".transfer.list", ".img", ".img.gz", ".img.zst"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    /// Decoded and described like any other source
    Partition,
    /// Dumped into partition images by an external tool
    Payload,
    /// Copied next to the partitions as-is
    Passthrough,
}

/// What to do with an archive member named `file_name`, `None` leaves it in the archive
///
/// `allow` filters partitions the same way source discovery does.
pub fn member_role(file_name: &str, allow: &[String]) -> Option<MemberRole> {
    if file_name == PAYLOAD_NAME {
        return Some(MemberRole::Payload);
    }
    if file_name.ends_with(".img") && PASSTHROUGH_PREFIXES.iter().any(|p| file_name.starts_with(p)) {
        return Some(MemberRole::Passthrough);
    }
    if PARTITION_SUFFIXES.iter().any(|s| file_name.ends_with(s)) {
        let name = chunk_base(file_name).unwrap_or_else(|| partition_name(file_name));
        if !name.is_empty() && allowed(name, allow) {
            return Some(MemberRole::Partition);
        }
    }
    None
}

/// Result of taking in one archive
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Intake {
    /// Files written to the source directory, in archive order
    pub extracted: Vec<PathBuf>,
    /// Members left in the archive
    pub skipped: Vec<String>,
    /// `payload.bin` was found and dumped
    pub payload: bool,
}

pub struct FirmwareIntake {
    source_dir: PathBuf,
    partitions: Vec<String>,
    transform: Box<dyn Transform>,
}

impl FirmwareIntake {
    pub fn new(config: &Config, runner: Arc<dyn ToolRunner>) -> Self {
        Self::with_transform(config, Box::new(TransformSet::new(config, runner)))
    }

    pub fn with_transform(config: &Config, transform: Box<dyn Transform>) -> Self {
        Self {
            source_dir: config.source_dir.clone(),
            partitions: config.partitions.clone(),
            transform,
        }
    }

    /// Extract the partition members of `archive` into the source directory
    ///
    /// Failures are reported against the archive's file name.
    pub fn intake(&self, archive: &Path) -> Result<Intake, PartitionFailure> {
        let label = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());
        let mut intake = self.extract(archive).stage(&label, Stage::Intake)?;

        let payload = intake.extracted.iter().position(|p| p.file_name().is_some_and(|n| n == PAYLOAD_NAME));
        if let Some(index) = payload {
            let payload = intake.extracted.remove(index);
            let step = DecodeStep::new(TransformKind::PayloadDump, vec![payload], self.source_dir.clone());
            step.execute(self.transform.as_ref())
                .stage(&label, Stage::Decode(TransformKind::PayloadDump))?;
            intake.payload = true;
        }
        info!(
            "{label}: took in {} files{}",
            intake.extracted.len(),
            if intake.payload { " and a payload" } else { "" }
        );
        Ok(intake)
    }

    fn extract(&self, archive: &Path) -> Result<Intake, PartimgError> {
        let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        fs::create_dir_all(&self.source_dir)?;

        let mut intake = Intake::default();
        for index in 0..zip.len() {
            let mut member = zip.by_index(index)?;
            let member_name = member.name().to_string();
            // flattened, which also keeps `..` components out of the source directory
            let file_name = match Path::new(&member_name).file_name().and_then(|n| n.to_str()) {
                Some(name) if !member.is_dir() => name.to_string(),
                _ => continue,
            };

            let Some(role) = member_role(&file_name, &self.partitions) else {
                trace!("leaving {member_name} in the archive");
                intake.skipped.push(member_name);
                continue;
            };
            let dest = self.source_dir.join(&file_name);
            info!("extracting {member_name} ({role:?}) to {}", dest.display());
            let mut writer = BufWriter::new(File::create(&dest)?);
            io::copy(&mut member, &mut writer)?;
            writer.flush()?;
            intake.extracted.push(dest);
        }
        Ok(intake)
    }
}

#[cfg(test)]
mod tests {
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    use super::*;
    use crate::tool::ProcessRunner;

    fn allow() -> Vec<String> {
        Config::default().partitions
    }

    #[test]
    fn roles() {
        let allow = allow();
        assert_eq!(member_role("payload.bin", &allow), Some(MemberRole::Payload));
        assert_eq!(member_role("vbmeta_system.img", &allow), Some(MemberRole::Passthrough));
        assert_eq!(member_role("boot.img", &allow), Some(MemberRole::Passthrough));
        assert_eq!(member_role("dtbo.img", &allow), Some(MemberRole::Passthrough));
        assert_eq!(member_role("system.new.dat.br", &allow), Some(MemberRole::Partition));
        assert_eq!(member_role("system.transfer.list", &allow), Some(MemberRole::Partition));
        assert_eq!(member_role("super_10.img", &allow), Some(MemberRole::Partition));
        assert_eq!(member_role("super.img.zst", &allow), Some(MemberRole::Partition));
        assert_eq!(member_role("my_product.img", &allow), Some(MemberRole::Partition));

        assert_eq!(member_role("system.patch.dat", &allow), None);
        assert_eq!(member_role("recovery.img", &allow), None);
        assert_eq!(member_role("updater-script", &allow), None);
        assert_eq!(member_role(".img", &[]), None);
        assert_eq!(member_role("recovery.img", &[]), Some(MemberRole::Partition));
    }

    #[test]
    fn extract_flattens_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("rom.zip");
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        let options = |method| SimpleFileOptions::default().compression_method(method);
        for (name, method, data) in [
            ("META-INF/com/google/android/updater-script", CompressionMethod::Stored, &b"ui_print"[..]),
            ("IMAGES/odm.img", CompressionMethod::Deflated, &[7_u8; 8192][..]),
            ("../../escape/vendor.img", CompressionMethod::Stored, &b"vendor"[..]),
            ("recovery.img", CompressionMethod::Stored, &b"recovery"[..]),
        ] {
            zip.start_file(name, options(method)).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.add_directory("IMAGES/nested", options(CompressionMethod::Stored)).unwrap();
        zip.finish().unwrap();

        let config = Config::with_project(dir.path());
        let intake = FirmwareIntake::new(&config, Arc::new(ProcessRunner)).intake(&archive).unwrap();
        assert_eq!(
            intake.extracted,
            [config.source_dir.join("odm.img"), config.source_dir.join("vendor.img")]
        );
        assert_eq!(intake.skipped, ["META-INF/com/google/android/updater-script", "recovery.img"]);
        assert!(!intake.payload);
        assert_eq!(fs::read(config.source_dir.join("odm.img")).unwrap(), [7_u8; 8192]);
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("rom.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        let config = Config::with_project(dir.path());
        let failure = FirmwareIntake::new(&config, Arc::new(ProcessRunner)).intake(&archive).unwrap_err();
        assert_eq!(failure.partition, "rom.zip");
        assert_eq!(failure.stage, Stage::Intake);
        assert!(matches!(failure.source, PartimgError::Zip(_)));
        assert!(!failure.source.aborts_run());
    }
}
