//! File-to-file transforms, run natively when a codec is compiled in and through external tools
//! otherwise

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::transfer_list::TransferList;
use super::TransformKind;
use crate::config::Config;
use crate::error::PartimgError;
use crate::sparse;
use crate::tool::{ToolInvocation, ToolRunner};

/// Turn `inputs` into `output`
///
/// Implementations must not remove their inputs, [`super::DecodeStep::execute`] does that once
/// `output` exists.
pub trait Transform {
    fn apply(&self, kind: TransformKind, inputs: &[PathBuf], output: &Path) -> Result<(), PartimgError>;
}

/// Default transforms, configured tool paths and tunables
pub struct TransformSet {
    config: Config,
    runner: Arc<dyn ToolRunner>,
}

impl TransformSet {
    pub fn new(config: &Config, runner: Arc<dyn ToolRunner>) -> Self {
        Self { config: config.clone(), runner }
    }

    fn run(&self, invocation: ToolInvocation) -> Result<(), PartimgError> {
        self.runner.run(&invocation)?;
        Ok(())
    }
}

impl Transform for TransformSet {
    fn apply(&self, kind: TransformKind, inputs: &[PathBuf], output: &Path) -> Result<(), PartimgError> {
        info!("{kind}: {} -> {}", display_all(inputs), output.display());
        let tools = &self.config.tools;
        match kind {
            #[cfg(feature = "gzip")]
            TransformKind::GzipDecompress => {
                let reader = BufReader::new(File::open(single(kind, inputs)?)?);
                copy_to(flate2::read::MultiGzDecoder::new(reader), output)?;
            }
            #[cfg(feature = "zstd")]
            TransformKind::ZstdDecompress => {
                let reader = BufReader::new(File::open(single(kind, inputs)?)?);
                let mut writer = BufWriter::new(File::create(output)?);
                zstd::stream::copy_decode(reader, &mut writer)?;
                writer.flush()?;
            }
            TransformKind::SparseToRaw => sparse::unsparse_file(single(kind, inputs)?, output)?,
            TransformKind::ChunkMerge => sparse::merge_chunks(&super::order_chunks(inputs)?, output)?,
            TransformKind::TransferListReplay => {
                let [data, list] = inputs else {
                    return Err(arity(kind, inputs));
                };
                TransferList::from_path(list)?.replay_file(data, output)?;
            }
            TransformKind::BrotliDecompress => self.run(
                ToolInvocation::new(&tools.brotli)
                    .args(["-d", "-f"])
                    .arg(single(kind, inputs)?)
                    .arg("-o")
                    .arg(output),
            )?,
            TransformKind::PartitionTableSplit => {
                fs::create_dir_all(output)?;
                self.run(ToolInvocation::new(&tools.lpunpack).arg(single(kind, inputs)?).arg(output))?;
            }
            TransformKind::PayloadDump => {
                fs::create_dir_all(output)?;
                self.run(
                    ToolInvocation::new(&tools.payload_dumper)
                        .arg("-o")
                        .arg(output)
                        .arg(single(kind, inputs)?),
                )?;
            }
            TransformKind::SparseEncode => {
                self.run(ToolInvocation::new(&tools.img2simg).arg(single(kind, inputs)?).arg(output))?
            }
            TransformKind::TransferListEncode => {
                let (dir, partition) = transfer_list_target(output)?;
                self.run(
                    ToolInvocation::new(&tools.python)
                        .arg(&tools.img2sdat)
                        .arg("-o")
                        .arg(dir)
                        .arg("-p")
                        .arg(partition)
                        .arg(single(kind, inputs)?)
                        .arg(self.config.transfer_cache.to_string()),
                )?
            }
            TransformKind::BrotliEncode => self.run(
                ToolInvocation::new(&tools.brotli)
                    .arg("-q")
                    .arg(self.config.brotli_quality.to_string())
                    .args(["-v", "-f"])
                    .arg(single(kind, inputs)?)
                    .arg("-o")
                    .arg(output),
            )?,
            #[allow(unreachable_patterns)]
            _ => return Err(PartimgError::Format(format!("{kind} support is not compiled in"))),
        }
        Ok(())
    }
}

fn single(kind: TransformKind, inputs: &[PathBuf]) -> Result<&Path, PartimgError> {
    match inputs {
        [input] => Ok(input),
        _ => Err(arity(kind, inputs)),
    }
}

fn arity(kind: TransformKind, inputs: &[PathBuf]) -> PartimgError {
    PartimgError::Data(format!("{kind} can't take {} inputs", inputs.len()))
}

#[cfg(any(feature = "gzip", feature = "zstd"))]
fn copy_to<R: io::Read>(mut reader: R, output: &Path) -> Result<(), PartimgError> {
    let mut writer = BufWriter::new(File::create(output)?);
    let len = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    debug!("wrote {len} bytes to {}", output.display());
    Ok(())
}

/// Output directory and partition name for `<dir>/<partition>.new.dat`
fn transfer_list_target(output: &Path) -> Result<(&Path, &str), PartimgError> {
    let name = output.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let partition = name
        .strip_suffix(".new.dat")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| PartimgError::Data(format!("{} is not a .new.dat path", output.display())))?;
    Ok((output.parent().unwrap_or(Path::new(".")), partition))
}

fn display_all(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::tool::ToolOutput;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ToolInvocation>>);

    impl ToolRunner for Recorder {
        fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PartimgError> {
            self.0.lock().unwrap().push(invocation.clone());
            Ok(ToolOutput::success())
        }
    }

    fn set() -> (TransformSet, Arc<Recorder>) {
        let runner = Arc::new(Recorder::default());
        (TransformSet::new(&Config::with_project("/p"), runner.clone()), runner)
    }

    #[test]
    fn encode_invocations() {
        let (set, runner) = set();
        set.apply(TransformKind::SparseEncode, &["/b/vendor.img".into()], Path::new("/b/vendor.sparse"))
            .unwrap();
        set.apply(TransformKind::TransferListEncode, &["/b/vendor.sparse".into()], Path::new("/b/vendor.new.dat"))
            .unwrap();
        set.apply(TransformKind::BrotliEncode, &["/b/vendor.new.dat".into()], Path::new("/b/vendor.new.dat.br"))
            .unwrap();

        let calls = runner.0.lock().unwrap();
        assert_eq!(calls[0].arg_strings(), ["/b/vendor.img", "/b/vendor.sparse"]);
        assert_eq!(calls[1].program, Path::new("python3"));
        assert_eq!(
            calls[1].arg_strings(),
            ["img2sdat.py", "-o", "/b", "-p", "vendor", "/b/vendor.sparse", "402653184"]
        );
        assert_eq!(
            calls[2].arg_strings(),
            ["-q", "6", "-v", "-f", "/b/vendor.new.dat", "-o", "/b/vendor.new.dat.br"]
        );
    }

    #[test]
    fn wrong_arity() {
        let (set, _) = set();
        let err = set.apply(TransformKind::TransferListReplay, &["/a".into()], Path::new("/b")).unwrap_err();
        assert!(matches!(err, PartimgError::Data(_)));
        assert!(transfer_list_target(Path::new("/b/vendor.img")).is_err());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_native() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("odm.img.gz");
        let mut encoder = flate2::write::GzEncoder::new(File::create(&input).unwrap(), flate2::Compression::fast());
        encoder.write_all(b"odm contents").unwrap();
        encoder.finish().unwrap();

        let (set, runner) = set();
        let output = dir.path().join("odm.img");
        set.apply(TransformKind::GzipDecompress, &[input], &output).unwrap();
        assert_eq!(fs::read(output).unwrap(), b"odm contents");
        assert!(runner.0.lock().unwrap().is_empty());
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_native() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("odm.img.zst");
        fs::write(&input, zstd::encode_all(&b"odm contents"[..], 1).unwrap()).unwrap();

        let (set, _) = set();
        let output = dir.path().join("odm.img");
        set.apply(TransformKind::ZstdDecompress, &[input], &output).unwrap();
        assert_eq!(fs::read(output).unwrap(), b"odm contents");
    }
}
